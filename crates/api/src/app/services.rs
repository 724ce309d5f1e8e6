//! Service wiring: stores, aggregator and worker pool behind the HTTP layer.

use std::sync::Arc;

use sqlx::PgPool;

use paysettle_infra::jobs::{
    InMemoryJobStore, JobQueue, JobStore, PostgresJobStore, WorkerPool, WorkerPoolDeps,
    WorkerPoolHandle,
};
use paysettle_infra::settlements::{InMemorySettlementSink, PostgresSettlementSink, SettlementSink};
use paysettle_infra::transactions::{
    InMemoryTransactionSource, PostgresTransactionSource, TransactionSource,
};
use paysettle_infra::{AppConfig, ArtifactWriter, ExportLayout, SettlementAggregator};

/// Shared state handed to every handler.
#[derive(Clone, Debug)]
pub struct AppServices {
    pub queue: JobQueue,
    pub layout: ExportLayout,
}

/// Backends a pool runs against.
pub struct Backends {
    pub store: Arc<dyn JobStore>,
    pub source: Arc<dyn TransactionSource>,
    pub sink: Arc<dyn SettlementSink>,
}

impl Backends {
    pub fn postgres(pool: PgPool) -> Self {
        Self {
            store: Arc::new(PostgresJobStore::new(pool.clone())),
            source: Arc::new(PostgresTransactionSource::new(pool.clone())),
            sink: Arc::new(PostgresSettlementSink::new(pool)),
        }
    }

    /// In-memory backends (dev/test); the source starts with `source`'s rows.
    pub fn in_memory(source: InMemoryTransactionSource) -> Self {
        Self {
            store: InMemoryJobStore::arc(),
            source: Arc::new(source),
            sink: Arc::new(InMemorySettlementSink::new()),
        }
    }
}

/// Start the worker pool and build the handler state.
///
/// Must be called from within a tokio runtime.
pub fn start(config: &AppConfig, backends: Backends) -> (AppServices, WorkerPoolHandle) {
    let layout = config.export_layout();
    let aggregator = SettlementAggregator::new(
        backends.source,
        backends.sink,
        backends.store.clone(),
        ArtifactWriter::new(layout.clone()),
        config.batch_size,
    );
    let deps = WorkerPoolDeps {
        store: backends.store,
        aggregator,
    };
    let (queue, handle) = WorkerPool::start(config.pool_config(), deps);
    (AppServices { queue, layout }, handle)
}
