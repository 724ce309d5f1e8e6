//! Infrastructure layer: job system, storage adapters, aggregation and export.

pub mod aggregator;
pub mod config;
pub mod db;
pub mod export;
pub mod jobs;
pub mod settlements;
pub mod transactions;

pub use aggregator::{AggregateError, RunSummary, SettlementAggregator};
pub use config::{AppConfig, ConfigError};
pub use export::{ArtifactWriter, ExportError, ExportLayout};
