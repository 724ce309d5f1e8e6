//! Settlement job system.
//!
//! ## Flow
//!
//! - `JobQueue::submit` validates the date range, reserves a slot on the
//!   bounded intake channel, persists a QUEUED record and hands a `WorkItem`
//!   to the pool
//! - a `WorkerPool` worker dequeues it, registers a cancellation token, moves
//!   the record to RUNNING and drives the `SettlementAggregator`
//! - the outcome becomes FINISHED, CANCELLED or FAILED; nothing is retried
//!
//! ## Components
//!
//! - `JobStore`: persistence for job records (in-memory or Postgres)
//! - `JobQueue`: submission, status lookup, cancellation
//! - `WorkerPool` / `WorkerPoolHandle`: fixed set of workers and their lifecycle
//! - `CancellationRegistry` / `ExecutionContext`: cooperative cancellation and deadlines

pub mod cancellation;
pub mod pool;
pub mod postgres;
pub mod queue;
pub mod store;
pub mod types;

pub use cancellation::{CancellationRegistry, ExecutionContext, Interrupt};
pub use pool::{PoolStats, ShutdownReport, WorkerPool, WorkerPoolConfig, WorkerPoolDeps, WorkerPoolHandle};
pub use postgres::PostgresJobStore;
pub use queue::{JobQueue, QueueError};
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use types::{JobRecord, JobStatus, WorkItem};
