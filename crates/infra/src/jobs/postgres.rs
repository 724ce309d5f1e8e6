//! Postgres-backed job store.
//!
//! Every state change is a single conditional `UPDATE ... RETURNING`, with the
//! allowed source statuses in the `WHERE` clause, so concurrent writers (the
//! worker, a cancel request) cannot race a record into an illegal state. When
//! the update matches nothing, the record is re-read to tell `NotFound` from
//! `InvalidTransition`.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use paysettle_core::{DateRange, JobId};

use super::store::{JobStore, JobStoreError};
use super::types::{JobRecord, JobStatus};

const RECORD_COLUMNS: &str = "job_id, status, range_from, range_to, progress, processed, total, \
     error, created_at, updated_at, cancelled, cancelled_at";

const ALL_STATUSES: [JobStatus; 5] = [
    JobStatus::Queued,
    JobStatus::Running,
    JobStatus::Finished,
    JobStatus::Failed,
    JobStatus::Cancelled,
];

#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: PgPool,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Explain why a conditional update matched no row.
    async fn rejection(&self, job_id: JobId, to: JobStatus) -> JobStoreError {
        match self.get_by_id(job_id).await {
            Ok(Some(current)) => JobStoreError::InvalidTransition {
                job_id,
                from: current.status,
                to,
            },
            Ok(None) => JobStoreError::NotFound(job_id),
            Err(e) => e,
        }
    }
}

/// Statuses a record may be in for a move to `to` to be legal.
fn sources_of(to: JobStatus) -> Vec<String> {
    ALL_STATUSES
        .iter()
        .filter(|from| from.can_transition_to(to))
        .map(|from| from.as_str().to_string())
        .collect()
}

#[async_trait::async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, record), fields(job_id = %record.job_id), err)]
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        sqlx::query(
            r#"
            INSERT INTO job_records (
                job_id, status, range_from, range_to, progress, processed, total,
                error, created_at, updated_at, cancelled, cancelled_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(record.job_id.as_uuid())
        .bind(record.status.as_str())
        .bind(record.range.from())
        .bind(record.range.to())
        .bind(record.progress)
        .bind(record.processed as i64)
        .bind(record.total as i64)
        .bind(record.error.as_deref())
        .bind(record.created_at)
        .bind(record.updated_at)
        .bind(record.cancelled)
        .bind(record.cancelled_at)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("create", record.job_id, e))?;

        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn get_by_id(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let row = sqlx::query(&format!(
            "SELECT {RECORD_COLUMNS} FROM job_records WHERE job_id = $1"
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get_by_id", job_id, e))?;

        row.as_ref().map(record_from_row).transpose()
    }

    #[instrument(skip(self), fields(job_id = %job_id, status = %status), err)]
    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
    ) -> Result<JobRecord, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE job_records
            SET status = $2,
                progress = CASE WHEN $2 = 'FINISHED' THEN 100 ELSE progress END,
                updated_at = now()
            WHERE job_id = $1 AND status = ANY($3)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(status.as_str())
        .bind(sources_of(status))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_status", job_id, e))?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(self.rejection(job_id, status).await),
        }
    }

    #[instrument(skip(self, error), fields(job_id = %job_id), err)]
    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<JobRecord, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE job_records
            SET status = 'FAILED', error = $2, updated_at = now()
            WHERE job_id = $1 AND status = ANY($3)
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .bind(error)
        .bind(sources_of(JobStatus::Failed))
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_failed", job_id, e))?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(self.rejection(job_id, JobStatus::Failed).await),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn mark_cancelled(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        let row = sqlx::query(&format!(
            r#"
            UPDATE job_records
            SET cancelled = TRUE,
                cancelled_at = now(),
                updated_at = now(),
                status = CASE WHEN status = 'QUEUED' THEN 'CANCELLED' ELSE status END
            WHERE job_id = $1 AND status IN ('QUEUED', 'RUNNING')
            RETURNING {RECORD_COLUMNS}
            "#
        ))
        .bind(job_id.as_uuid())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("mark_cancelled", job_id, e))?;

        match row {
            Some(row) => record_from_row(&row),
            None => Err(self.rejection(job_id, JobStatus::Cancelled).await),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn update_total(&self, job_id: JobId, total: u64) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET total = $2, processed = LEAST(processed, $2), updated_at = now()
            WHERE job_id = $1
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(total as i64)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_total", job_id, e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn increment_processed(
        &self,
        job_id: JobId,
        delta: u64,
        progress: f64,
    ) -> Result<(), JobStoreError> {
        let result = sqlx::query(
            r#"
            UPDATE job_records
            SET processed = LEAST(processed + $2, total),
                progress = GREATEST(progress, LEAST(GREATEST($3, 0), 100)),
                updated_at = now()
            WHERE job_id = $1 AND status = 'RUNNING'
            "#,
        )
        .bind(job_id.as_uuid())
        .bind(delta as i64)
        .bind(progress)
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("increment_processed", job_id, e))?;

        if result.rows_affected() == 0 {
            return Err(self.rejection(job_id, JobStatus::Running).await);
        }
        Ok(())
    }
}

fn record_from_row(row: &sqlx::postgres::PgRow) -> Result<JobRecord, JobStoreError> {
    let read = |e: sqlx::Error| JobStoreError::Storage(format!("failed to read job record: {e}"));

    let job_id: Uuid = row.try_get("job_id").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;
    let from: NaiveDate = row.try_get("range_from").map_err(read)?;
    let to: NaiveDate = row.try_get("range_to").map_err(read)?;
    let progress: f64 = row.try_get("progress").map_err(read)?;
    let processed: i64 = row.try_get("processed").map_err(read)?;
    let total: i64 = row.try_get("total").map_err(read)?;
    let error: Option<String> = row.try_get("error").map_err(read)?;
    let created_at: DateTime<Utc> = row.try_get("created_at").map_err(read)?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at").map_err(read)?;
    let cancelled: bool = row.try_get("cancelled").map_err(read)?;
    let cancelled_at: Option<DateTime<Utc>> = row.try_get("cancelled_at").map_err(read)?;

    let status = status.parse::<JobStatus>().map_err(JobStoreError::Storage)?;
    let range = DateRange::new(from, to).map_err(|e| JobStoreError::Storage(e.to_string()))?;

    Ok(JobRecord {
        job_id: JobId::from_uuid(job_id),
        status,
        range,
        progress,
        processed: processed.max(0) as u64,
        total: total.max(0) as u64,
        result_path: None,
        error,
        created_at,
        updated_at,
        cancelled,
        cancelled_at,
    })
}

fn map_sqlx_error(operation: &str, job_id: JobId, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            if db_err.is_unique_violation() {
                JobStoreError::AlreadyExists(job_id)
            } else {
                JobStoreError::Storage(format!(
                    "database error in {}: {}",
                    operation,
                    db_err.message()
                ))
            }
        }
        other => JobStoreError::Storage(format!("{operation}: {other}")),
    }
}
