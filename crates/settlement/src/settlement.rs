//! Settlement rows and their merge rules.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use paysettle_core::{Cents, JobId, MerchantId};

use crate::transaction::Transaction;

/// Uniqueness key of a settlement row: one row per merchant per day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SettlementKey {
    pub merchant_id: MerchantId,
    pub date: NaiveDate,
}

/// Aggregated settlement for one merchant on one calendar day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SettlementRow {
    pub merchant_id: MerchantId,
    pub date: NaiveDate,
    pub gross: Cents,
    pub fee: Cents,
    pub net: Cents,
    pub txn_count: u64,
    pub generated_at: DateTime<Utc>,
    /// Job that produced (or last replaced) this row.
    pub run_id: JobId,
}

impl SettlementRow {
    /// Contribution of a single transaction: gross = amount, net = amount - fee.
    pub fn from_transaction(run_id: JobId, tx: &Transaction, generated_at: DateTime<Utc>) -> Self {
        Self {
            merchant_id: tx.merchant_id,
            date: tx.settlement_date(),
            gross: tx.amount,
            fee: tx.fee,
            net: tx.net(),
            txn_count: 1,
            generated_at,
            run_id,
        }
    }

    pub fn key(&self) -> SettlementKey {
        SettlementKey {
            merchant_id: self.merchant_id,
            date: self.date,
        }
    }

    /// Add another row for the same key into this one.
    ///
    /// Amounts and counts accumulate; `generated_at` keeps the latest value.
    pub fn accumulate(&mut self, other: &SettlementRow) {
        debug_assert_eq!(self.key(), other.key());
        self.gross += other.gross;
        self.fee += other.fee;
        self.net += other.net;
        self.txn_count += other.txn_count;
        if other.generated_at > self.generated_at {
            self.generated_at = other.generated_at;
        }
    }

    /// Conflict resolution used by settlement sinks on upsert.
    ///
    /// Rows written by the same run accumulate. A row from a different run
    /// replaces the stored one. Runs only upsert days they have fully read
    /// (see `DayBuffer`), so the replacement is always a complete day and the
    /// last writer wins with a correct total.
    pub fn merged_into(self, existing: &SettlementRow) -> SettlementRow {
        if existing.run_id == self.run_id {
            let mut merged = existing.clone();
            merged.accumulate(&self);
            merged
        } else {
            self
        }
    }
}
