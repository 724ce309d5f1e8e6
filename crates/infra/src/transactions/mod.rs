//! Transaction source: the read side of the transaction log.

pub mod postgres;

use parking_lot::RwLock;

use paysettle_core::DateRange;
use paysettle_settlement::Transaction;

pub use postgres::PostgresTransactionSource;

/// Queryable log of paid transactions.
///
/// Both operations only consider `paid` transactions whose `paid_at` falls in
/// the range (whole UTC days, end inclusive). Pages are ordered by `paid_at`,
/// then by transaction id, so offset pagination is stable.
#[async_trait::async_trait]
pub trait TransactionSource: Send + Sync {
    async fn count_by_range(&self, range: &DateRange) -> Result<u64, SourceError>;

    async fn fetch_page(
        &self,
        range: &DateRange,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Transaction>, SourceError>;
}

/// Transaction source error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SourceError {
    #[error("transaction source unavailable: {0}")]
    Unavailable(String),
    #[error("malformed transaction row: {0}")]
    Malformed(String),
}

/// In-memory transaction log for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryTransactionSource {
    transactions: RwLock<Vec<Transaction>>,
}

impl InMemoryTransactionSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_transactions(transactions: Vec<Transaction>) -> Self {
        let source = Self::new();
        source.insert(transactions);
        source
    }

    pub fn insert(&self, transactions: impl IntoIterator<Item = Transaction>) {
        let mut log = self.transactions.write();
        log.extend(transactions);
        log.sort_by_key(|tx| (tx.paid_at, tx.id));
    }

    fn qualifying(&self, range: &DateRange) -> Vec<Transaction> {
        self.transactions
            .read()
            .iter()
            .filter(|tx| tx.is_paid() && range.contains(tx.paid_at))
            .cloned()
            .collect()
    }
}

#[async_trait::async_trait]
impl TransactionSource for InMemoryTransactionSource {
    async fn count_by_range(&self, range: &DateRange) -> Result<u64, SourceError> {
        Ok(self.qualifying(range).len() as u64)
    }

    async fn fetch_page(
        &self,
        range: &DateRange,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Transaction>, SourceError> {
        Ok(self
            .qualifying(range)
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}
