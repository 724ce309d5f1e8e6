//! Postgres-backed transaction source.
//!
//! Reads the `transactions` table created by the embedded migrations. Range
//! filters are half-open on `paid_at` (`>= start`, `< end`), which matches the
//! whole-day semantics of `DateRange`. The `(status, paid_at, id)` index keeps
//! both the count and the ordered page scan on an index.

use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::instrument;

use paysettle_core::{Cents, DateRange, MerchantId};
use paysettle_settlement::{Transaction, TransactionStatus};

use super::{SourceError, TransactionSource};

#[derive(Debug, Clone)]
pub struct PostgresTransactionSource {
    pool: PgPool,
}

impl PostgresTransactionSource {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Bulk insert (used by the seeding tool). Returns the number of rows written.
    #[instrument(skip(self, transactions), fields(rows = transactions.len()), err)]
    pub async fn insert_batch(&self, transactions: &[NewTransaction]) -> Result<u64, SourceError> {
        if transactions.is_empty() {
            return Ok(0);
        }

        let mut builder = QueryBuilder::<Postgres>::new(
            "INSERT INTO transactions (merchant_id, amount_cents, fee_cents, status, paid_at) ",
        );
        builder.push_values(transactions, |mut b, tx| {
            b.push_bind(tx.merchant_id.get() as i64)
                .push_bind(tx.amount.get())
                .push_bind(tx.fee.get())
                .push_bind(tx.status.as_str())
                .push_bind(tx.paid_at);
        });

        let result = builder
            .build()
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert_batch", e))?;
        Ok(result.rows_affected())
    }
}

/// A transaction that has not been assigned an id yet.
#[derive(Debug, Clone)]
pub struct NewTransaction {
    pub merchant_id: MerchantId,
    pub amount: Cents,
    pub fee: Cents,
    pub status: TransactionStatus,
    pub paid_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl TransactionSource for PostgresTransactionSource {
    #[instrument(skip(self), fields(range = %range), err)]
    async fn count_by_range(&self, range: &DateRange) -> Result<u64, SourceError> {
        let row = sqlx::query(
            r#"
            SELECT COUNT(*) AS total
            FROM transactions
            WHERE status = 'paid'
              AND paid_at >= $1
              AND paid_at < $2
            "#,
        )
        .bind(range.start_instant())
        .bind(range.end_instant())
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_by_range", e))?;

        let total: i64 = row
            .try_get("total")
            .map_err(|e| SourceError::Malformed(format!("failed to read count: {e}")))?;
        Ok(total.max(0) as u64)
    }

    #[instrument(skip(self), fields(range = %range), err)]
    async fn fetch_page(
        &self,
        range: &DateRange,
        offset: u64,
        limit: u64,
    ) -> Result<Vec<Transaction>, SourceError> {
        let rows = sqlx::query(
            r#"
            SELECT id, merchant_id, amount_cents, fee_cents, status, paid_at
            FROM transactions
            WHERE status = 'paid'
              AND paid_at >= $1
              AND paid_at < $2
            ORDER BY paid_at ASC, id ASC
            LIMIT $3 OFFSET $4
            "#,
        )
        .bind(range.start_instant())
        .bind(range.end_instant())
        .bind(limit as i64)
        .bind(offset as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_page", e))?;

        rows.iter().map(transaction_from_row).collect()
    }
}

fn transaction_from_row(row: &sqlx::postgres::PgRow) -> Result<Transaction, SourceError> {
    let read = |e: sqlx::Error| SourceError::Malformed(e.to_string());

    let id: i64 = row.try_get("id").map_err(read)?;
    let merchant_id: i64 = row.try_get("merchant_id").map_err(read)?;
    let amount: i64 = row.try_get("amount_cents").map_err(read)?;
    let fee: i64 = row.try_get("fee_cents").map_err(read)?;
    let status: String = row.try_get("status").map_err(read)?;
    let paid_at: DateTime<Utc> = row.try_get("paid_at").map_err(read)?;

    let status = TransactionStatus::parse(&status)
        .ok_or_else(|| SourceError::Malformed(format!("unknown status {status:?} on transaction {id}")))?;

    Ok(Transaction {
        id: id as u64,
        merchant_id: MerchantId(merchant_id as u64),
        amount: Cents(amount),
        fee: Cents(fee),
        status,
        paid_at,
    })
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> SourceError {
    match err {
        sqlx::Error::Database(db_err) => SourceError::Unavailable(format!(
            "database error in {}: {}",
            operation,
            db_err.message()
        )),
        other => SourceError::Unavailable(format!("{operation}: {other}")),
    }
}
