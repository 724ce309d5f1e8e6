//! Job intake: validation, admission, status lookup and cancellation.

use std::sync::Arc;

use chrono::Utc;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{info, instrument};

use paysettle_core::{DateRange, DomainError, JobId};

use super::cancellation::CancellationRegistry;
use super::store::{JobStore, JobStoreError};
use super::types::{JobRecord, JobStatus, WorkItem};
use crate::export::ExportLayout;

/// Errors returned to callers of the job queue.
#[derive(Debug, Clone, thiserror::Error)]
pub enum QueueError {
    #[error(transparent)]
    Validation(#[from] DomainError),
    #[error("job queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },
    #[error("job queue is shutting down")]
    ShuttingDown,
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job {job_id} is already {status}")]
    AlreadyTerminal { job_id: JobId, status: JobStatus },
    #[error("job store error: {0}")]
    Store(JobStoreError),
}

struct QueueInner {
    sender: RwLock<Option<mpsc::Sender<WorkItem>>>,
    capacity: usize,
    store: Arc<dyn JobStore>,
    registry: CancellationRegistry,
    layout: ExportLayout,
}

/// Front door of the job system. Cheap to clone.
#[derive(Clone)]
pub struct JobQueue {
    inner: Arc<QueueInner>,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("capacity", &self.inner.capacity)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl JobQueue {
    /// Create a queue with a bounded intake channel of `capacity` slots.
    ///
    /// The returned receiver is the consumer side; the worker pool owns it.
    pub fn new(
        capacity: usize,
        store: Arc<dyn JobStore>,
        registry: CancellationRegistry,
        layout: ExportLayout,
    ) -> (Self, mpsc::Receiver<WorkItem>) {
        let capacity = capacity.max(1);
        let (tx, rx) = mpsc::channel(capacity);
        let queue = Self {
            inner: Arc::new(QueueInner {
                sender: RwLock::new(Some(tx)),
                capacity,
                store,
                registry,
                layout,
            }),
        };
        (queue, rx)
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn registry(&self) -> &CancellationRegistry {
        &self.inner.registry
    }

    pub fn layout(&self) -> &ExportLayout {
        &self.inner.layout
    }

    pub fn is_closed(&self) -> bool {
        self.inner.sender.read().is_none()
    }

    /// Validate a date range and enqueue a settlement job for it.
    ///
    /// Never blocks: a full intake channel is reported as `QueueFull`. Nothing
    /// is persisted unless a channel slot was reserved first, and the QUEUED
    /// record exists before the work item becomes visible to workers.
    #[instrument(skip(self), err)]
    pub async fn submit(&self, from: &str, to: &str) -> Result<JobId, QueueError> {
        let range = DateRange::parse(from, to)?;

        let sender = self
            .inner
            .sender
            .read()
            .clone()
            .ok_or(QueueError::ShuttingDown)?;
        let permit = sender.try_reserve().map_err(|e| match e {
            TrySendError::Full(()) => QueueError::QueueFull {
                capacity: self.inner.capacity,
            },
            TrySendError::Closed(()) => QueueError::ShuttingDown,
        })?;

        let job_id = JobId::new();
        let now = Utc::now();
        let record = JobRecord::queued(job_id, range, now);
        // On failure the permit is dropped, which releases the slot.
        self.inner
            .store
            .create(&record)
            .await
            .map_err(QueueError::Store)?;

        permit.send(WorkItem {
            job_id,
            range,
            enqueued_at: now,
        });
        info!(job_id = %job_id, range = %range, "settlement job queued");
        Ok(job_id)
    }

    /// Current state of a job, with the download location once finished.
    pub async fn status(&self, job_id: JobId) -> Result<JobRecord, QueueError> {
        let record = self
            .inner
            .store
            .get_by_id(job_id)
            .await
            .map_err(QueueError::Store)?
            .ok_or(QueueError::NotFound(job_id))?;
        Ok(self.with_result_location(record))
    }

    /// Request cancellation of a queued or running job.
    ///
    /// A queued job is CANCELLED on return. A running job is flagged and its
    /// worker stops at the next page checkpoint.
    #[instrument(skip(self), fields(job_id = %job_id), err)]
    pub async fn cancel(&self, job_id: JobId) -> Result<JobRecord, QueueError> {
        let record = self
            .inner
            .store
            .mark_cancelled(job_id)
            .await
            .map_err(|e| match e {
                JobStoreError::NotFound(id) => QueueError::NotFound(id),
                JobStoreError::InvalidTransition { job_id, from, .. } if from.is_terminal() => {
                    QueueError::AlreadyTerminal {
                        job_id,
                        status: from,
                    }
                }
                other => QueueError::Store(other),
            })?;

        let signalled = self.inner.registry.cancel(job_id);
        info!(status = %record.status, signalled, "cancellation requested");
        Ok(self.with_result_location(record))
    }

    /// Stop accepting submissions. Workers exit once the channel is drained.
    pub fn close(&self) {
        if self.inner.sender.write().take().is_some() {
            info!("job queue closed");
        }
    }

    fn with_result_location(&self, mut record: JobRecord) -> JobRecord {
        if record.status == JobStatus::Finished {
            record.result_path = Some(self.inner.layout.public_location(record.job_id));
        }
        record
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    use crate::jobs::store::InMemoryJobStore;

    fn new_queue(capacity: usize) -> (JobQueue, mpsc::Receiver<WorkItem>, Arc<InMemoryJobStore>) {
        let store = InMemoryJobStore::arc();
        let (queue, rx) = JobQueue::new(
            capacity,
            store.clone(),
            CancellationRegistry::new(),
            ExportLayout::new("exports", "/jobs/downloads"),
        );
        (queue, rx, store)
    }

    #[tokio::test]
    async fn submit_persists_a_queued_record_before_handing_off() {
        let (queue, mut rx, store) = new_queue(4);
        let id = queue.submit("2025-01-01", "2025-01-31").await.unwrap();

        let record = store.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Queued);

        let item = rx.recv().await.unwrap();
        assert_eq!(item.job_id, id);
        assert_eq!(item.range, DateRange::parse("2025-01-01", "2025-01-31").unwrap());
    }

    #[tokio::test]
    async fn invalid_input_creates_nothing() {
        let (queue, mut rx, store) = new_queue(4);

        for (from, to) in [
            ("2025-02-30", "2025-03-01"),
            ("2025-03-10", "2025-03-01"),
            ("yesterday", "2025-03-01"),
            ("2025-3-1", "2025-03-02"),
        ] {
            assert!(matches!(
                queue.submit(from, to).await,
                Err(QueueError::Validation(_))
            ));
        }

        assert!(store.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn ids_are_unique() {
        let (queue, _rx, _store) = new_queue(64);
        let mut ids = HashSet::new();
        for _ in 0..64 {
            ids.insert(queue.submit("2025-01-01", "2025-01-02").await.unwrap());
        }
        assert_eq!(ids.len(), 64);
    }

    #[tokio::test]
    async fn full_queue_fails_fast_without_persisting() {
        let (queue, _rx, store) = new_queue(2);
        queue.submit("2025-01-01", "2025-01-02").await.unwrap();
        queue.submit("2025-01-01", "2025-01-02").await.unwrap();

        assert!(matches!(
            queue.submit("2025-01-01", "2025-01-02").await,
            Err(QueueError::QueueFull { capacity: 2 })
        ));
        assert_eq!(store.len(), 2);
    }

    #[tokio::test]
    async fn closed_queue_rejects_submissions() {
        let (queue, mut rx, _store) = new_queue(2);
        queue.submit("2025-01-01", "2025-01-02").await.unwrap();
        queue.close();

        assert!(queue.is_closed());
        assert!(matches!(
            queue.submit("2025-01-01", "2025-01-02").await,
            Err(QueueError::ShuttingDown)
        ));
        // Already accepted work is still delivered, then the channel ends.
        assert!(rx.recv().await.is_some());
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn status_fills_in_the_download_location_once_finished() {
        let (queue, _rx, store) = new_queue(2);
        let id = queue.submit("2025-01-01", "2025-01-02").await.unwrap();
        assert!(queue.status(id).await.unwrap().result_path.is_none());

        store.update_status(id, JobStatus::Running).await.unwrap();
        store.update_status(id, JobStatus::Finished).await.unwrap();

        let record = queue.status(id).await.unwrap();
        assert_eq!(record.result_path, Some(format!("/jobs/downloads/{id}.csv")));
        assert!(matches!(
            queue.status(JobId::new()).await,
            Err(QueueError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn cancel_covers_every_lifecycle_state() {
        let (queue, _rx, store) = new_queue(4);

        let queued = queue.submit("2025-01-01", "2025-01-02").await.unwrap();
        assert_eq!(queue.cancel(queued).await.unwrap().status, JobStatus::Cancelled);

        let running = queue.submit("2025-01-01", "2025-01-02").await.unwrap();
        let token = queue.registry().register(running);
        store.update_status(running, JobStatus::Running).await.unwrap();
        let record = queue.cancel(running).await.unwrap();
        assert_eq!(record.status, JobStatus::Running);
        assert!(record.cancelled);
        assert!(token.is_cancelled());

        assert!(matches!(
            queue.cancel(queued).await,
            Err(QueueError::AlreadyTerminal { status: JobStatus::Cancelled, .. })
        ));
        assert!(matches!(
            queue.cancel(JobId::new()).await,
            Err(QueueError::NotFound(_))
        ));
    }
}
