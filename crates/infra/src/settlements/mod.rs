//! Settlement sink: durable settlement rows keyed by (merchant, date).

pub mod postgres;

use std::collections::BTreeMap;

use parking_lot::Mutex;

use paysettle_core::JobId;
use paysettle_settlement::{SettlementKey, SettlementRow};

pub use postgres::PostgresSettlementSink;

/// Store of settlement rows with one row per (merchant, date).
///
/// `upsert` follows `SettlementRow::merged_into`: rows from the same run
/// accumulate, rows from a different run replace the stored row. The
/// aggregator only upserts whole days, so a replacement never leaves a
/// partial total behind.
#[async_trait::async_trait]
pub trait SettlementSink: Send + Sync {
    async fn upsert(&self, row: &SettlementRow) -> Result<(), SinkError>;

    async fn get(&self, key: SettlementKey) -> Result<Option<SettlementRow>, SinkError>;

    /// Rows currently owned by `run_id`, ordered by (merchant, date).
    async fn list_for_run(&self, run_id: JobId) -> Result<Vec<SettlementRow>, SinkError>;
}

/// Settlement sink error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SinkError {
    #[error("settlement sink unavailable: {0}")]
    Unavailable(String),
    #[error("malformed settlement row: {0}")]
    Malformed(String),
}

/// In-memory settlement sink for tests/dev.
#[derive(Debug, Default)]
pub struct InMemorySettlementSink {
    rows: Mutex<BTreeMap<SettlementKey, SettlementRow>>,
}

impl InMemorySettlementSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }

    /// Snapshot of every row, ordered by key.
    pub fn all(&self) -> Vec<SettlementRow> {
        self.rows.lock().values().cloned().collect()
    }
}

#[async_trait::async_trait]
impl SettlementSink for InMemorySettlementSink {
    async fn upsert(&self, row: &SettlementRow) -> Result<(), SinkError> {
        let mut rows = self.rows.lock();
        let merged = match rows.get(&row.key()) {
            Some(existing) => row.clone().merged_into(existing),
            None => row.clone(),
        };
        rows.insert(merged.key(), merged);
        Ok(())
    }

    async fn get(&self, key: SettlementKey) -> Result<Option<SettlementRow>, SinkError> {
        Ok(self.rows.lock().get(&key).cloned())
    }

    async fn list_for_run(&self, run_id: JobId) -> Result<Vec<SettlementRow>, SinkError> {
        Ok(self
            .rows
            .lock()
            .values()
            .filter(|row| row.run_id == run_id)
            .cloned()
            .collect())
    }
}
