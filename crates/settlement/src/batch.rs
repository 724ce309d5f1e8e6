//! Per-batch grouping and per-run accumulation.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};

use paysettle_core::JobId;

use crate::settlement::{SettlementKey, SettlementRow};
use crate::transaction::Transaction;

/// Group a batch of transactions into one settlement row per (merchant, date).
///
/// Rows are returned ordered by key. Every row carries `run_id` and
/// `generated_at`. Non-paid transactions are skipped.
pub fn group_transactions(
    run_id: JobId,
    batch: &[Transaction],
    generated_at: DateTime<Utc>,
) -> Vec<SettlementRow> {
    let mut groups: BTreeMap<SettlementKey, SettlementRow> = BTreeMap::new();

    for tx in batch.iter().filter(|tx| tx.is_paid()) {
        let row = SettlementRow::from_transaction(run_id, tx, generated_at);
        groups
            .entry(row.key())
            .and_modify(|existing| existing.accumulate(&row))
            .or_insert(row);
    }

    groups.into_values().collect()
}

/// Holds back the rows of the day a batch ends on.
///
/// Batches arrive ordered by `paid_at`, so a later batch can only add to the
/// last settlement date of the current one. Rows for earlier dates are final
/// and released; rows for the open date are carried until a batch ends on a
/// later date or the run calls `finish`.
#[derive(Debug, Clone, Default)]
pub struct DayBuffer {
    open: BTreeMap<SettlementKey, SettlementRow>,
}

impl DayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one batch's grouped rows in and return every row whose day is
    /// complete. `open_date` is the settlement date of the batch's last
    /// transaction; `None` releases everything.
    pub fn push(
        &mut self,
        rows: impl IntoIterator<Item = SettlementRow>,
        open_date: Option<NaiveDate>,
    ) -> Vec<SettlementRow> {
        for row in rows {
            self.open
                .entry(row.key())
                .and_modify(|existing| existing.accumulate(&row))
                .or_insert(row);
        }

        let (open, closed): (BTreeMap<_, _>, BTreeMap<_, _>) = std::mem::take(&mut self.open)
            .into_iter()
            .partition(|(key, _)| Some(key.date) == open_date);
        self.open = open;
        closed.into_values().collect()
    }

    /// Release the rows still held; the source is exhausted.
    pub fn finish(self) -> Vec<SettlementRow> {
        self.open.into_values().collect()
    }

    /// Number of (merchant, date) rows currently held back.
    pub fn held(&self) -> usize {
        self.open.len()
    }
}

/// Settlement rows accumulated over every batch of a single run.
///
/// Memory is bounded by the number of distinct (merchant, date) pairs in the
/// range, not by the number of transactions.
#[derive(Debug, Clone)]
pub struct SettlementRun {
    run_id: JobId,
    rows: BTreeMap<SettlementKey, SettlementRow>,
}

impl SettlementRun {
    pub fn new(run_id: JobId) -> Self {
        Self {
            run_id,
            rows: BTreeMap::new(),
        }
    }

    pub fn run_id(&self) -> JobId {
        self.run_id
    }

    /// Fold grouped rows from one batch into the run.
    pub fn absorb<'a>(&mut self, rows: impl IntoIterator<Item = &'a SettlementRow>) {
        for row in rows {
            self.rows
                .entry(row.key())
                .and_modify(|existing| existing.accumulate(row))
                .or_insert_with(|| row.clone());
        }
    }

    /// Number of distinct (merchant, date) rows.
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Total number of transactions folded in so far.
    pub fn transaction_count(&self) -> u64 {
        self.rows.values().map(|r| r.txn_count).sum()
    }

    /// Rows ordered by (merchant, date).
    pub fn rows(&self) -> impl Iterator<Item = &SettlementRow> {
        self.rows.values()
    }

    pub fn into_rows(self) -> Vec<SettlementRow> {
        self.rows.into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate, TimeZone};
    use proptest::prelude::*;

    use paysettle_core::{Cents, MerchantId};

    use crate::transaction::TransactionStatus;

    fn tx(id: u64, merchant: u64, day: u32, amount: i64, fee: i64) -> Transaction {
        Transaction {
            id,
            merchant_id: MerchantId(merchant),
            amount: Cents(amount),
            fee: Cents(fee),
            status: TransactionStatus::Paid,
            paid_at: Utc.with_ymd_and_hms(2025, 1, day, 12, 0, 0).unwrap(),
        }
    }

    #[test]
    fn two_transactions_same_merchant_same_day_become_one_row() {
        let run = JobId::new();
        let rows = group_transactions(run, &[tx(1, 5, 3, 1_000, 30), tx(2, 5, 3, 4_000, 70)], Utc::now());

        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.merchant_id, MerchantId(5));
        assert_eq!(row.date, NaiveDate::from_ymd_opt(2025, 1, 3).unwrap());
        assert_eq!(row.gross, Cents(5_000));
        assert_eq!(row.fee, Cents(100));
        assert_eq!(row.net, Cents(4_900));
        assert_eq!(row.txn_count, 2);
    }

    #[test]
    fn distinct_merchants_and_days_stay_separate_and_ordered() {
        let run = JobId::new();
        let batch = vec![
            tx(1, 9, 2, 100, 1),
            tx(2, 1, 4, 100, 1),
            tx(3, 1, 2, 100, 1),
            tx(4, 9, 2, 100, 1),
        ];
        let rows = group_transactions(run, &batch, Utc::now());

        let keys: Vec<(u64, u32)> = rows
            .iter()
            .map(|r| (r.merchant_id.get(), chrono::Datelike::day(&r.date)))
            .collect();
        assert_eq!(keys, vec![(1, 2), (1, 4), (9, 2)]);
        assert_eq!(rows[2].txn_count, 2);
    }

    #[test]
    fn unpaid_transactions_are_ignored() {
        let mut refunded = tx(2, 5, 3, 4_000, 70);
        refunded.status = TransactionStatus::Refunded;
        let rows = group_transactions(JobId::new(), &[tx(1, 5, 3, 1_000, 30), refunded], Utc::now());

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].txn_count, 1);
        assert_eq!(rows[0].gross, Cents(1_000));
    }

    #[test]
    fn day_boundary_is_utc_midnight() {
        let run = JobId::new();
        let mut late = tx(1, 5, 3, 100, 0);
        late.paid_at = Utc.with_ymd_and_hms(2025, 1, 3, 23, 59, 59).unwrap();
        let mut early = tx(2, 5, 3, 100, 0);
        early.paid_at = late.paid_at + Duration::seconds(1);

        let rows = group_transactions(run, &[late, early], Utc::now());
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn run_accumulates_across_batches() {
        let run_id = JobId::new();
        let mut run = SettlementRun::new(run_id);

        let first = group_transactions(run_id, &[tx(1, 5, 3, 1_000, 10), tx(2, 6, 3, 500, 5)], Utc::now());
        let second = group_transactions(run_id, &[tx(3, 5, 3, 2_000, 20)], Utc::now());
        run.absorb(&first);
        run.absorb(&second);

        assert_eq!(run.len(), 2);
        assert_eq!(run.transaction_count(), 3);
        let merchant_five = run.rows().find(|r| r.merchant_id == MerchantId(5)).unwrap();
        assert_eq!(merchant_five.gross, Cents(3_000));
        assert_eq!(merchant_five.txn_count, 2);
    }

    #[test]
    fn buffer_releases_a_day_once_a_later_batch_moves_past_it() {
        let run_id = JobId::new();
        let now = Utc::now();
        let jan = |day| NaiveDate::from_ymd_opt(2025, 1, day);
        let mut buffer = DayBuffer::new();

        // Day 3 closes inside this batch; day 4 may continue.
        let first = vec![tx(1, 5, 3, 100, 1), tx(2, 6, 3, 100, 1), tx(3, 5, 4, 100, 1)];
        let released = buffer.push(group_transactions(run_id, &first, now), jan(4));
        assert_eq!(released.len(), 2);
        assert!(released.iter().all(|r| r.date == jan(3).unwrap()));
        assert_eq!(buffer.held(), 1);

        // Still day 4: nothing is released, the held row grows.
        let second = vec![tx(4, 5, 4, 200, 2)];
        assert!(buffer.push(group_transactions(run_id, &second, now), jan(4)).is_empty());

        let third = vec![tx(5, 5, 5, 50, 0)];
        let released = buffer.push(group_transactions(run_id, &third, now), jan(5));
        assert_eq!(released.len(), 1);
        assert_eq!(released[0].gross, Cents(300));
        assert_eq!(released[0].txn_count, 2);

        let rest = buffer.finish();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].date, jan(5).unwrap());
    }

    fn arb_tx() -> impl Strategy<Value = Transaction> {
        (0u64..20, 1u32..29, 1i64..100_000, 0i64..5_000).prop_map(|(merchant, day, amount, fee)| {
            tx(0, merchant, day, amount, fee)
        })
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: grouping conserves money and transaction counts, and
        /// net == gross - fee on every row.
        #[test]
        fn grouping_conserves_totals(batch in prop::collection::vec(arb_tx(), 0..200)) {
            let rows = group_transactions(JobId::new(), &batch, Utc::now());

            let gross: Cents = rows.iter().map(|r| r.gross).sum();
            let fee: Cents = rows.iter().map(|r| r.fee).sum();
            let count: u64 = rows.iter().map(|r| r.txn_count).sum();

            prop_assert_eq!(gross, batch.iter().map(|t| t.amount).sum::<Cents>());
            prop_assert_eq!(fee, batch.iter().map(|t| t.fee).sum::<Cents>());
            prop_assert_eq!(count, batch.len() as u64);
            for row in &rows {
                prop_assert_eq!(row.net, row.gross - row.fee);
            }
        }

        /// Property: splitting a run into batches in any place yields the same
        /// accumulated rows as processing it in one go.
        #[test]
        fn batch_boundaries_do_not_change_the_result(
            batch in prop::collection::vec(arb_tx(), 1..200),
            split in 0usize..200,
        ) {
            let run_id = JobId::new();
            let now = Utc::now();
            let split = split.min(batch.len());

            let mut whole = SettlementRun::new(run_id);
            whole.absorb(&group_transactions(run_id, &batch, now));

            let mut pieces = SettlementRun::new(run_id);
            pieces.absorb(&group_transactions(run_id, &batch[..split], now));
            pieces.absorb(&group_transactions(run_id, &batch[split..], now));

            prop_assert_eq!(whole.into_rows(), pieces.into_rows());
        }

        /// Property: whatever the batch size, the buffer releases each
        /// (merchant, date) exactly once and with its full-day total.
        #[test]
        fn buffer_releases_each_day_once_with_its_total(
            mut batch in prop::collection::vec(arb_tx(), 1..200),
            size in 1usize..50,
        ) {
            batch.sort_by_key(|t| t.paid_at);
            let run_id = JobId::new();
            let now = Utc::now();

            let mut expected = SettlementRun::new(run_id);
            expected.absorb(&group_transactions(run_id, &batch, now));

            let mut buffer = DayBuffer::new();
            let mut released = Vec::new();
            for chunk in batch.chunks(size) {
                let open_date = chunk.last().map(Transaction::settlement_date);
                released.extend(buffer.push(group_transactions(run_id, chunk, now), open_date));
            }
            released.extend(buffer.finish());
            released.sort_by_key(SettlementRow::key);

            prop_assert_eq!(released, expected.into_rows());
        }
    }
}
