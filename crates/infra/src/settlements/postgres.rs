//! Postgres-backed settlement sink.
//!
//! The `settlements` table carries a unique constraint on `(merchant_id, date)`.
//! Upserts resolve conflicts in SQL with the same rule as
//! `SettlementRow::merged_into`: accumulate when the stored row belongs to the
//! same run, replace otherwise. Doing it in a single statement keeps the merge
//! atomic under concurrent writers.

use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use paysettle_core::{Cents, JobId, MerchantId};
use paysettle_settlement::{SettlementKey, SettlementRow};

use super::{SettlementSink, SinkError};

#[derive(Debug, Clone)]
pub struct PostgresSettlementSink {
    pool: PgPool,
}

impl PostgresSettlementSink {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl SettlementSink for PostgresSettlementSink {
    #[instrument(
        skip(self, row),
        fields(merchant_id = %row.merchant_id, date = %row.date, run_id = %row.run_id),
        err
    )]
    async fn upsert(&self, row: &SettlementRow) -> Result<(), SinkError> {
        sqlx::query(
            r#"
            INSERT INTO settlements (
                merchant_id,
                date,
                gross_cents,
                fee_cents,
                net_cents,
                txn_count,
                generated_at,
                run_id
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (merchant_id, date)
            DO UPDATE SET
                gross_cents = CASE WHEN settlements.run_id = EXCLUDED.run_id
                    THEN settlements.gross_cents + EXCLUDED.gross_cents
                    ELSE EXCLUDED.gross_cents END,
                fee_cents = CASE WHEN settlements.run_id = EXCLUDED.run_id
                    THEN settlements.fee_cents + EXCLUDED.fee_cents
                    ELSE EXCLUDED.fee_cents END,
                net_cents = CASE WHEN settlements.run_id = EXCLUDED.run_id
                    THEN settlements.net_cents + EXCLUDED.net_cents
                    ELSE EXCLUDED.net_cents END,
                txn_count = CASE WHEN settlements.run_id = EXCLUDED.run_id
                    THEN settlements.txn_count + EXCLUDED.txn_count
                    ELSE EXCLUDED.txn_count END,
                generated_at = GREATEST(
                    CASE WHEN settlements.run_id = EXCLUDED.run_id
                        THEN settlements.generated_at
                        ELSE EXCLUDED.generated_at END,
                    EXCLUDED.generated_at
                ),
                run_id = EXCLUDED.run_id
            "#,
        )
        .bind(row.merchant_id.get() as i64)
        .bind(row.date)
        .bind(row.gross.get())
        .bind(row.fee.get())
        .bind(row.net.get())
        .bind(row.txn_count as i64)
        .bind(row.generated_at)
        .bind(row.run_id.as_uuid())
        .execute(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("upsert", e))?;

        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn get(&self, key: SettlementKey) -> Result<Option<SettlementRow>, SinkError> {
        let row = sqlx::query(
            r#"
            SELECT merchant_id, date, gross_cents, fee_cents, net_cents, txn_count, generated_at, run_id
            FROM settlements
            WHERE merchant_id = $1 AND date = $2
            "#,
        )
        .bind(key.merchant_id.get() as i64)
        .bind(key.date)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("get", e))?;

        row.as_ref().map(settlement_from_row).transpose()
    }

    #[instrument(skip(self), fields(run_id = %run_id), err)]
    async fn list_for_run(&self, run_id: JobId) -> Result<Vec<SettlementRow>, SinkError> {
        let rows = sqlx::query(
            r#"
            SELECT merchant_id, date, gross_cents, fee_cents, net_cents, txn_count, generated_at, run_id
            FROM settlements
            WHERE run_id = $1
            ORDER BY merchant_id ASC, date ASC
            "#,
        )
        .bind(run_id.as_uuid())
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("list_for_run", e))?;

        rows.iter().map(settlement_from_row).collect()
    }
}

fn settlement_from_row(row: &sqlx::postgres::PgRow) -> Result<SettlementRow, SinkError> {
    let read = |e: sqlx::Error| SinkError::Malformed(e.to_string());

    let merchant_id: i64 = row.try_get("merchant_id").map_err(read)?;
    let date: NaiveDate = row.try_get("date").map_err(read)?;
    let gross: i64 = row.try_get("gross_cents").map_err(read)?;
    let fee: i64 = row.try_get("fee_cents").map_err(read)?;
    let net: i64 = row.try_get("net_cents").map_err(read)?;
    let txn_count: i64 = row.try_get("txn_count").map_err(read)?;
    let generated_at: DateTime<Utc> = row.try_get("generated_at").map_err(read)?;
    let run_id: Uuid = row.try_get("run_id").map_err(read)?;

    Ok(SettlementRow {
        merchant_id: MerchantId(merchant_id as u64),
        date,
        gross: Cents(gross),
        fee: Cents(fee),
        net: Cents(net),
        txn_count: txn_count.max(0) as u64,
        generated_at,
        run_id: JobId::from_uuid(run_id),
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SinkError {
    match err {
        sqlx::Error::Database(db_err) => SinkError::Unavailable(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        other => SinkError::Unavailable(format!("{operation}: {other}")),
    }
}
