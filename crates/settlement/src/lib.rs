//! `paysettle-settlement`: settlement domain.
//!
//! Pure computation only: turning paid transactions into per-merchant, per-day
//! settlement rows, the merge rules the settlement sink applies on conflict,
//! and progress arithmetic for long-running runs.

pub mod batch;
pub mod progress;
pub mod settlement;
pub mod transaction;

pub use batch::{group_transactions, DayBuffer, SettlementRun};
pub use progress::progress_percent;
pub use settlement::{SettlementKey, SettlementRow};
pub use transaction::{Transaction, TransactionStatus};
