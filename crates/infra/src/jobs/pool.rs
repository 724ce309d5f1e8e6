//! Fixed-size worker pool draining the job queue.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::cancellation::{CancellationRegistry, ExecutionContext};
use super::queue::JobQueue;
use super::store::{JobStore, JobStoreError};
use super::types::{JobStatus, WorkItem};
use crate::aggregator::{AggregateError, SettlementAggregator};

/// Worker pool configuration.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of workers; fixed for the lifetime of the pool
    pub worker_count: usize,
    /// Capacity of the intake channel
    pub queue_capacity: usize,
    /// Per-job deadline; `None` lets a job run until it completes
    pub job_timeout: Option<Duration>,
    /// Name for logging
    pub name: String,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            worker_count: 4,
            queue_capacity: 100,
            job_timeout: Some(Duration::from_secs(3600)),
            name: "settlement-pool".to_string(),
        }
    }
}

impl WorkerPoolConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }
}

/// What the workers need to run jobs.
#[derive(Clone)]
pub struct WorkerPoolDeps {
    pub store: Arc<dyn JobStore>,
    pub aggregator: SettlementAggregator,
}

/// Pool runtime statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct PoolStats {
    pub jobs_processed: u64,
    pub jobs_finished: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    /// Dequeued but never started (cancelled while queued)
    pub jobs_skipped: u64,
    pub current_running: usize,
    pub uptime_secs: u64,
}

/// Outcome of `WorkerPoolHandle::shutdown`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Whether every worker exited within the grace period
    pub drained: bool,
    /// Running jobs whose cancellation was forced after the grace period
    pub forced_cancellations: usize,
    pub stats: PoolStats,
}

struct Worker {
    id: usize,
    store: Arc<dyn JobStore>,
    aggregator: SettlementAggregator,
    registry: CancellationRegistry,
    stats: Arc<Mutex<PoolStats>>,
    job_timeout: Option<Duration>,
    /// Tripped when the shutdown grace period elapses
    aborting: CancellationToken,
}

pub struct WorkerPool;

impl WorkerPool {
    /// Spawn the workers and return the queue that feeds them.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(config: WorkerPoolConfig, deps: WorkerPoolDeps) -> (JobQueue, WorkerPoolHandle) {
        let registry = CancellationRegistry::new();
        let layout = deps.aggregator.writer().layout().clone();
        let (queue, rx) = JobQueue::new(
            config.queue_capacity,
            deps.store.clone(),
            registry.clone(),
            layout,
        );

        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let stats = Arc::new(Mutex::new(PoolStats::default()));
        let aborting = CancellationToken::new();
        let worker_count = config.worker_count.max(1);

        let mut workers = JoinSet::new();
        for id in 0..worker_count {
            let worker = Worker {
                id,
                store: deps.store.clone(),
                aggregator: deps.aggregator.clone(),
                registry: registry.clone(),
                stats: stats.clone(),
                job_timeout: config.job_timeout,
                aborting: aborting.clone(),
            };
            workers.spawn(worker.run(rx.clone()));
        }

        info!(
            pool = %config.name,
            workers = worker_count,
            capacity = queue.capacity(),
            "worker pool started"
        );

        let handle = WorkerPoolHandle {
            name: config.name,
            queue: queue.clone(),
            store: deps.store,
            registry,
            workers,
            stats,
            aborting,
            started: Instant::now(),
        };
        (queue, handle)
    }
}

/// Handle to control a running pool.
pub struct WorkerPoolHandle {
    name: String,
    queue: JobQueue,
    store: Arc<dyn JobStore>,
    registry: CancellationRegistry,
    workers: JoinSet<()>,
    stats: Arc<Mutex<PoolStats>>,
    aborting: CancellationToken,
    started: Instant,
}

impl WorkerPoolHandle {
    /// Get current pool statistics.
    pub fn stats(&self) -> PoolStats {
        snapshot(&self.stats, self.started)
    }

    /// Close the queue and wait for the workers to drain it.
    ///
    /// When `grace` elapses first, every running job is flagged cancelled in
    /// the store and its token tripped. Jobs still waiting in the queue are
    /// cancelled as they are dequeued. The call then waits for the workers to
    /// reach their next checkpoint.
    pub async fn shutdown(mut self, grace: Duration) -> ShutdownReport {
        info!(pool = %self.name, grace_secs = grace.as_secs(), "worker pool shutting down");
        self.queue.close();

        let drained = tokio::time::timeout(grace, join_all(&mut self.workers))
            .await
            .is_ok();

        let mut forced_cancellations = 0;
        if !drained {
            self.aborting.cancel();
            // Flag first: once a token trips, the worker moves its job to CANCELLED.
            for job_id in self.registry.job_ids() {
                if let Err(e) = self.store.mark_cancelled(job_id).await {
                    warn!(pool = %self.name, job_id = %job_id, error = %e, "failed to flag job cancelled");
                }
            }
            forced_cancellations = self.registry.cancel_all();
            warn!(
                pool = %self.name,
                forced_cancellations,
                "grace period elapsed; cancelling remaining jobs"
            );
            join_all(&mut self.workers).await;
        }

        let stats = snapshot(&self.stats, self.started);
        info!(pool = %self.name, drained, ?stats, "worker pool stopped");
        ShutdownReport {
            drained,
            forced_cancellations,
            stats,
        }
    }
}

async fn join_all(workers: &mut JoinSet<()>) {
    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "worker task ended abnormally");
        }
    }
}

fn snapshot(stats: &Mutex<PoolStats>, started: Instant) -> PoolStats {
    let mut stats = stats.lock().clone();
    stats.uptime_secs = started.elapsed().as_secs();
    stats
}

impl Worker {
    async fn run(self, rx: Arc<tokio::sync::Mutex<mpsc::Receiver<WorkItem>>>) {
        debug!(worker = self.id, "worker started");
        loop {
            // The lock is only held while waiting for the next item.
            let next = rx.lock().await.recv().await;
            let Some(item) = next else { break };
            self.execute(item).await;
        }
        debug!(worker = self.id, "worker exiting");
    }

    async fn execute(&self, item: WorkItem) {
        let job_id = item.job_id;
        let token = self.registry.register(job_id);

        if self.aborting.is_cancelled() {
            if let Err(e) = self.store.mark_cancelled(job_id).await {
                warn!(worker = self.id, job_id = %job_id, error = %e, "failed to cancel queued job during shutdown");
            }
            self.registry.remove(job_id);
            self.stats.lock().jobs_skipped += 1;
            return;
        }

        let deadline = self.job_timeout.map(|t| Instant::now() + t);
        let ctx = ExecutionContext::new(token, deadline);

        match self.store.update_status(job_id, JobStatus::Running).await {
            Ok(_) => {}
            Err(JobStoreError::InvalidTransition { from, .. }) => {
                info!(worker = self.id, job_id = %job_id, status = %from, "skipping job that is no longer queued");
                self.registry.remove(job_id);
                self.stats.lock().jobs_skipped += 1;
                return;
            }
            Err(e) => {
                error!(worker = self.id, job_id = %job_id, error = %e, "failed to start job");
                if let Err(e) = self.store.mark_failed(job_id, &e.to_string()).await {
                    warn!(worker = self.id, job_id = %job_id, error = %e, "failed to mark job failed");
                }
                self.registry.remove(job_id);
                let mut stats = self.stats.lock();
                stats.jobs_processed += 1;
                stats.jobs_failed += 1;
                return;
            }
        }

        self.stats.lock().current_running += 1;
        let queued_for = chrono::Utc::now() - item.enqueued_at;
        info!(
            worker = self.id,
            job_id = %job_id,
            range = %item.range,
            queued_ms = queued_for.num_milliseconds(),
            "job started"
        );

        let outcome = self.aggregator.run(job_id, &item.range, &ctx).await;
        let terminal = match &outcome {
            Ok(_) => JobStatus::Finished,
            Err(AggregateError::Cancelled) => JobStatus::Cancelled,
            Err(_) => JobStatus::Failed,
        };
        let recorded = match &outcome {
            Err(e) if terminal == JobStatus::Failed => {
                self.store.mark_failed(job_id, &e.to_string()).await
            }
            _ => self.store.update_status(job_id, terminal).await,
        };

        match (&outcome, &recorded) {
            (Ok(summary), Ok(_)) => info!(
                worker = self.id,
                job_id = %job_id,
                processed = summary.processed,
                rows = summary.rows,
                "job finished"
            ),
            (Err(AggregateError::Cancelled), Ok(_)) => {
                info!(worker = self.id, job_id = %job_id, "job cancelled")
            }
            (Err(e), Ok(_)) => warn!(worker = self.id, job_id = %job_id, error = %e, "job failed"),
            (_, Err(e)) => error!(
                worker = self.id,
                job_id = %job_id,
                status = %terminal,
                error = %e,
                "failed to record job outcome"
            ),
        }

        self.registry.remove(job_id);
        let mut stats = self.stats.lock();
        stats.current_running = stats.current_running.saturating_sub(1);
        stats.jobs_processed += 1;
        match terminal {
            JobStatus::Finished => stats.jobs_finished += 1,
            JobStatus::Cancelled => stats.jobs_cancelled += 1,
            _ => stats.jobs_failed += 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use tokio::sync::Notify;

    use paysettle_core::{Cents, DateRange, JobId, MerchantId};
    use paysettle_settlement::{Transaction, TransactionStatus};

    use crate::export::{ArtifactWriter, ExportLayout};
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::JobRecord;
    use crate::settlements::{InMemorySettlementSink, SettlementSink};
    use crate::transactions::{InMemoryTransactionSource, SourceError, TransactionSource};

    /// Blocks every `count_by_range` until released, and records call order.
    struct GatedSource {
        inner: InMemoryTransactionSource,
        gate: Notify,
        gated: bool,
        started: Mutex<Vec<DateRange>>,
    }

    #[async_trait::async_trait]
    impl TransactionSource for GatedSource {
        async fn count_by_range(&self, range: &DateRange) -> Result<u64, SourceError> {
            self.started.lock().push(*range);
            if self.gated {
                self.gate.notified().await;
            }
            self.inner.count_by_range(range).await
        }

        async fn fetch_page(
            &self,
            range: &DateRange,
            offset: u64,
            limit: u64,
        ) -> Result<Vec<Transaction>, SourceError> {
            self.inner.fetch_page(range, offset, limit).await
        }
    }

    fn transactions(count: u64) -> Vec<Transaction> {
        let start = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        (0..count)
            .map(|i| Transaction {
                id: i + 1,
                merchant_id: MerchantId(i % 3 + 1),
                amount: Cents(500),
                fee: Cents(5),
                status: TransactionStatus::Paid,
                paid_at: start + ChronoDuration::hours(i as i64),
            })
            .collect()
    }

    struct Fixture {
        store: Arc<InMemoryJobStore>,
        sink: Arc<InMemorySettlementSink>,
        source: Arc<GatedSource>,
        _dir: tempfile::TempDir,
        deps: WorkerPoolDeps,
    }

    fn fixture(gated: bool, batch_size: u64) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let store = InMemoryJobStore::arc();
        let sink = Arc::new(InMemorySettlementSink::new());
        let source = Arc::new(GatedSource {
            inner: InMemoryTransactionSource::with_transactions(transactions(120)),
            gate: Notify::new(),
            gated,
            started: Mutex::new(Vec::new()),
        });
        let writer = ArtifactWriter::new(ExportLayout::new(dir.path(), "/jobs/downloads"));
        let aggregator = SettlementAggregator::new(
            source.clone(),
            sink.clone(),
            store.clone(),
            writer,
            batch_size,
        );
        let deps = WorkerPoolDeps {
            store: store.clone(),
            aggregator,
        };
        Fixture {
            store,
            sink,
            source,
            _dir: dir,
            deps,
        }
    }

    async fn wait_for(store: &InMemoryJobStore, job_id: JobId, status: JobStatus) -> JobRecord {
        for _ in 0..500 {
            let record = store.get_by_id(job_id).await.unwrap().unwrap();
            if record.status == status {
                return record;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {status}");
    }

    fn one_worker() -> WorkerPoolConfig {
        WorkerPoolConfig::default()
            .with_name("test-pool")
            .with_worker_count(1)
            .with_queue_capacity(8)
    }

    #[tokio::test]
    async fn runs_a_job_to_completion() {
        let fx = fixture(false, 50);
        let (queue, pool) = WorkerPool::start(one_worker(), fx.deps.clone());

        let id = queue.submit("2025-01-01", "2025-01-31").await.unwrap();
        let record = wait_for(&fx.store, id, JobStatus::Finished).await;

        assert_eq!(record.total, 120);
        assert_eq!(record.processed, 120);
        assert_eq!(record.progress, 100.0);
        let status = queue.status(id).await.unwrap();
        assert_eq!(status.result_path, Some(format!("/jobs/downloads/{id}.csv")));
        assert_eq!(
            fx.sink.list_for_run(id).await.unwrap().iter().map(|r| r.txn_count).sum::<u64>(),
            120
        );

        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert!(report.drained);
        assert_eq!(report.stats.jobs_finished, 1);
        assert_eq!(report.stats.current_running, 0);
    }

    #[tokio::test]
    async fn single_worker_runs_jobs_back_to_back() {
        let fx = fixture(true, 50);
        let (queue, pool) = WorkerPool::start(one_worker(), fx.deps.clone());

        let first = queue.submit("2025-01-01", "2025-01-02").await.unwrap();
        let second = queue.submit("2025-01-03", "2025-01-04").await.unwrap();

        wait_for(&fx.store, first, JobStatus::Running).await;
        // The only worker is busy, so the second job must still be waiting.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.store.get_by_id(second).await.unwrap().unwrap().status, JobStatus::Queued);

        fx.source.gate.notify_one();
        wait_for(&fx.store, first, JobStatus::Finished).await;
        wait_for(&fx.store, second, JobStatus::Running).await;
        fx.source.gate.notify_one();
        wait_for(&fx.store, second, JobStatus::Finished).await;

        let started = fx.source.started.lock().clone();
        assert_eq!(
            started,
            vec![
                DateRange::parse("2025-01-01", "2025-01-02").unwrap(),
                DateRange::parse("2025-01-03", "2025-01-04").unwrap(),
            ]
        );
        pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn job_cancelled_while_queued_is_never_started() {
        let fx = fixture(true, 50);
        let (queue, pool) = WorkerPool::start(one_worker(), fx.deps.clone());

        let blocker = queue.submit("2025-01-01", "2025-01-02").await.unwrap();
        let waiting = queue.submit("2025-01-03", "2025-01-04").await.unwrap();
        wait_for(&fx.store, blocker, JobStatus::Running).await;

        let record = queue.cancel(waiting).await.unwrap();
        assert_eq!(record.status, JobStatus::Cancelled);

        fx.source.gate.notify_one();
        wait_for(&fx.store, blocker, JobStatus::Finished).await;
        let report = pool.shutdown(Duration::from_secs(5)).await;

        assert_eq!(report.stats.jobs_skipped, 1);
        assert_eq!(fx.source.started.lock().len(), 1);
        assert!(fx.sink.list_for_run(waiting).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancelling_a_running_job_ends_it_cancelled() {
        let fx = fixture(true, 50);
        let (queue, pool) = WorkerPool::start(one_worker(), fx.deps.clone());

        let id = queue.submit("2025-01-01", "2025-01-31").await.unwrap();
        wait_for(&fx.store, id, JobStatus::Running).await;

        let ack = queue.cancel(id).await.unwrap();
        assert_eq!(ack.status, JobStatus::Running);
        assert!(ack.cancelled);

        fx.source.gate.notify_one();
        let record = wait_for(&fx.store, id, JobStatus::Cancelled).await;
        assert_eq!(record.processed, 0);
        assert!(fx.sink.is_empty());

        let report = pool.shutdown(Duration::from_secs(5)).await;
        assert_eq!(report.stats.jobs_cancelled, 1);
        assert!(queue.registry().is_empty());
    }

    #[tokio::test]
    async fn elapsed_timeout_fails_the_job() {
        let fx = fixture(true, 50);
        let config = one_worker().with_job_timeout(Some(Duration::from_millis(10)));
        let (queue, pool) = WorkerPool::start(config, fx.deps.clone());

        let id = queue.submit("2025-01-01", "2025-01-31").await.unwrap();
        wait_for(&fx.store, id, JobStatus::Running).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        fx.source.gate.notify_one();

        let record = wait_for(&fx.store, id, JobStatus::Failed).await;
        assert_eq!(record.error.as_deref(), Some("deadline exceeded"));
        pool.shutdown(Duration::from_secs(5)).await;
    }

    #[tokio::test]
    async fn shutdown_after_grace_cancels_running_and_queued_jobs() {
        let fx = fixture(true, 50);
        let (queue, pool) = WorkerPool::start(one_worker(), fx.deps.clone());

        let running = queue.submit("2025-01-01", "2025-01-02").await.unwrap();
        let queued = queue.submit("2025-01-03", "2025-01-04").await.unwrap();
        wait_for(&fx.store, running, JobStatus::Running).await;

        let source = fx.source.clone();
        let release = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            source.gate.notify_one();
        });

        let report = pool.shutdown(Duration::from_millis(20)).await;
        release.await.unwrap();

        assert!(!report.drained);
        assert_eq!(report.forced_cancellations, 1);
        assert_eq!(report.stats.jobs_cancelled, 1);
        assert_eq!(report.stats.jobs_skipped, 1);
        for id in [running, queued] {
            let record = fx.store.get_by_id(id).await.unwrap().unwrap();
            assert_eq!(record.status, JobStatus::Cancelled);
            assert!(record.cancelled);
            assert!(record.cancelled_at.is_some());
        }
        assert!(matches!(
            queue.submit("2025-01-05", "2025-01-06").await,
            Err(crate::jobs::queue::QueueError::ShuttingDown)
        ));
    }
}
