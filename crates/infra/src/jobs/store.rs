//! Job storage abstraction and the in-memory implementation.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;

use paysettle_core::JobId;

use super::types::{JobRecord, JobStatus};

/// Job store abstraction.
///
/// Implementations must apply each operation atomically per record: the queue,
/// the worker and cancellation requests all write to the same record
/// concurrently.
#[async_trait::async_trait]
pub trait JobStore: Send + Sync {
    /// Persist a new record. Fails with `AlreadyExists` on identity reuse.
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError>;

    /// Get a job by ID.
    async fn get_by_id(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// Move a job to `status`, refusing transitions out of terminal states.
    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
    ) -> Result<JobRecord, JobStoreError>;

    /// Move a job to FAILED and remember why.
    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<JobRecord, JobStoreError>;

    /// Flag a job as cancelled.
    ///
    /// A QUEUED job becomes CANCELLED immediately; a RUNNING job only gets the
    /// flag and is resolved by its worker at the next checkpoint.
    async fn mark_cancelled(&self, job_id: JobId) -> Result<JobRecord, JobStoreError>;

    /// Record the number of qualifying transactions.
    async fn update_total(&self, job_id: JobId, total: u64) -> Result<(), JobStoreError>;

    /// Add `delta` to the processed counter and raise progress to `progress`.
    ///
    /// Processed is clamped to total and progress never decreases.
    async fn increment_processed(
        &self,
        job_id: JobId,
        delta: u64,
        progress: f64,
    ) -> Result<(), JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job {job_id} cannot move from {from} to {to}")]
    InvalidTransition {
        job_id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("storage error: {0}")]
    Storage(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Number of records held (any status).
    pub fn len(&self) -> usize {
        self.jobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.read().is_empty()
    }

    fn with_record<T>(
        &self,
        job_id: JobId,
        f: impl FnOnce(&mut JobRecord) -> Result<T, JobStoreError>,
    ) -> Result<T, JobStoreError> {
        let mut jobs = self.jobs.write();
        let record = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
        f(record)
    }
}

fn transition(record: &mut JobRecord, to: JobStatus) -> Result<(), JobStoreError> {
    if !record.status.can_transition_to(to) {
        return Err(JobStoreError::InvalidTransition {
            job_id: record.job_id,
            from: record.status,
            to,
        });
    }
    record.status = to;
    record.updated_at = Utc::now();
    if to == JobStatus::Finished {
        record.progress = 100.0;
    }
    Ok(())
}

#[async_trait::async_trait]
impl JobStore for InMemoryJobStore {
    async fn create(&self, record: &JobRecord) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write();
        if jobs.contains_key(&record.job_id) {
            return Err(JobStoreError::AlreadyExists(record.job_id));
        }
        jobs.insert(record.job_id, record.clone());
        Ok(())
    }

    async fn get_by_id(&self, job_id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        Ok(self.jobs.read().get(&job_id).cloned())
    }

    async fn update_status(
        &self,
        job_id: JobId,
        status: JobStatus,
    ) -> Result<JobRecord, JobStoreError> {
        self.with_record(job_id, |record| {
            transition(record, status)?;
            Ok(record.clone())
        })
    }

    async fn mark_failed(&self, job_id: JobId, error: &str) -> Result<JobRecord, JobStoreError> {
        self.with_record(job_id, |record| {
            transition(record, JobStatus::Failed)?;
            record.error = Some(error.to_string());
            Ok(record.clone())
        })
    }

    async fn mark_cancelled(&self, job_id: JobId) -> Result<JobRecord, JobStoreError> {
        self.with_record(job_id, |record| {
            if record.status.is_terminal() {
                return Err(JobStoreError::InvalidTransition {
                    job_id,
                    from: record.status,
                    to: JobStatus::Cancelled,
                });
            }
            let now = Utc::now();
            record.cancelled = true;
            record.cancelled_at = Some(now);
            record.updated_at = now;
            if record.status == JobStatus::Queued {
                record.status = JobStatus::Cancelled;
            }
            Ok(record.clone())
        })
    }

    async fn update_total(&self, job_id: JobId, total: u64) -> Result<(), JobStoreError> {
        self.with_record(job_id, |record| {
            record.total = total;
            record.processed = record.processed.min(total);
            record.updated_at = Utc::now();
            Ok(())
        })
    }

    async fn increment_processed(
        &self,
        job_id: JobId,
        delta: u64,
        progress: f64,
    ) -> Result<(), JobStoreError> {
        self.with_record(job_id, |record| {
            if record.status != JobStatus::Running {
                return Err(JobStoreError::InvalidTransition {
                    job_id,
                    from: record.status,
                    to: JobStatus::Running,
                });
            }
            record.processed = record.processed.saturating_add(delta).min(record.total);
            record.progress = record.progress.max(progress.clamp(0.0, 100.0));
            record.updated_at = Utc::now();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use paysettle_core::DateRange;

    fn queued() -> JobRecord {
        let range = DateRange::parse("2025-01-01", "2025-01-31").unwrap();
        JobRecord::queued(JobId::new(), range, Utc::now())
    }

    #[tokio::test]
    async fn create_and_get() {
        let store = InMemoryJobStore::new();
        let record = queued();
        store.create(&record).await.unwrap();

        let loaded = store.get_by_id(record.job_id).await.unwrap().unwrap();
        assert_eq!(loaded, record);
        assert!(store.get_by_id(JobId::new()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn duplicate_identity_is_rejected() {
        let store = InMemoryJobStore::new();
        let record = queued();
        store.create(&record).await.unwrap();

        assert!(matches!(
            store.create(&record).await,
            Err(JobStoreError::AlreadyExists(id)) if id == record.job_id
        ));
    }

    #[tokio::test]
    async fn progress_is_clamped_and_monotonic() {
        let store = InMemoryJobStore::new();
        let record = queued();
        let id = record.job_id;
        store.create(&record).await.unwrap();
        store.update_status(id, JobStatus::Running).await.unwrap();
        store.update_total(id, 10).await.unwrap();

        store.increment_processed(id, 6, 60.0).await.unwrap();
        store.increment_processed(id, 0, 20.0).await.unwrap();
        let loaded = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(loaded.processed, 6);
        assert_eq!(loaded.progress, 60.0);

        store.increment_processed(id, 9, 100.0).await.unwrap();
        let loaded = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(loaded.processed, 10);
        assert_eq!(loaded.progress, 100.0);
    }

    #[tokio::test]
    async fn cancelling_a_queued_job_is_terminal() {
        let store = InMemoryJobStore::new();
        let record = queued();
        let id = record.job_id;
        store.create(&record).await.unwrap();

        let cancelled = store.mark_cancelled(id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(cancelled.cancelled);
        assert!(cancelled.cancelled_at.is_some());

        // A worker that dequeues it later cannot start it.
        assert!(matches!(
            store.update_status(id, JobStatus::Running).await,
            Err(JobStoreError::InvalidTransition { from: JobStatus::Cancelled, .. })
        ));
    }

    #[tokio::test]
    async fn cancelling_a_running_job_only_sets_the_flag() {
        let store = InMemoryJobStore::new();
        let record = queued();
        let id = record.job_id;
        store.create(&record).await.unwrap();
        store.update_status(id, JobStatus::Running).await.unwrap();

        let flagged = store.mark_cancelled(id).await.unwrap();
        assert_eq!(flagged.status, JobStatus::Running);
        assert!(flagged.cancelled);

        let resolved = store.update_status(id, JobStatus::Cancelled).await.unwrap();
        assert_eq!(resolved.status, JobStatus::Cancelled);
    }

    #[tokio::test]
    async fn finished_jobs_cannot_be_cancelled_or_failed() {
        let store = InMemoryJobStore::new();
        let record = queued();
        let id = record.job_id;
        store.create(&record).await.unwrap();
        store.update_status(id, JobStatus::Running).await.unwrap();
        let finished = store.update_status(id, JobStatus::Finished).await.unwrap();
        assert_eq!(finished.progress, 100.0);

        assert!(matches!(
            store.mark_cancelled(id).await,
            Err(JobStoreError::InvalidTransition { from: JobStatus::Finished, .. })
        ));
        assert!(store.mark_failed(id, "late failure").await.is_err());
    }

    #[tokio::test]
    async fn mark_failed_keeps_the_reason() {
        let store = InMemoryJobStore::new();
        let record = queued();
        let id = record.job_id;
        store.create(&record).await.unwrap();
        store.update_status(id, JobStatus::Running).await.unwrap();

        let failed = store.mark_failed(id, "fetch page: connection reset").await.unwrap();
        assert_eq!(failed.status, JobStatus::Failed);
        assert_eq!(failed.error.as_deref(), Some("fetch page: connection reset"));
    }

    #[tokio::test]
    async fn unknown_ids_are_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();
        assert!(matches!(
            store.update_total(id, 1).await,
            Err(JobStoreError::NotFound(missing)) if missing == id
        ));
        assert!(matches!(store.mark_cancelled(id).await, Err(JobStoreError::NotFound(_))));
    }
}
