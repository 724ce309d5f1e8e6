//! Transactions as read from the transaction log.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use paysettle_core::{Cents, MerchantId};

/// Lifecycle status of a transaction in the log.
///
/// Only `Paid` transactions take part in settlement; the transaction source is
/// responsible for filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransactionStatus::Pending => "pending",
            TransactionStatus::Paid => "paid",
            TransactionStatus::Failed => "failed",
            TransactionStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

/// A single transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: u64,
    pub merchant_id: MerchantId,
    /// Charged amount in cents.
    pub amount: Cents,
    /// Processing fee in cents.
    pub fee: Cents,
    pub status: TransactionStatus,
    pub paid_at: DateTime<Utc>,
}

impl Transaction {
    /// The calendar day (UTC) this transaction settles on.
    pub fn settlement_date(&self) -> NaiveDate {
        self.paid_at.date_naive()
    }

    pub fn net(&self) -> Cents {
        self.amount - self.fee
    }

    pub fn is_paid(&self) -> bool {
        self.status == TransactionStatus::Paid
    }
}
