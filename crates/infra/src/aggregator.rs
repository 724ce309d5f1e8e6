//! Settlement aggregation run.
//!
//! A run counts the qualifying transactions, records the total, then walks the
//! range page by page (ordered by `paid_at`). Each page is grouped into
//! (merchant, date) rows and folded into the run's in-memory accumulation;
//! progress is written after every page. Only complete days reach the sink:
//! the day a page ends on is held back until a later page moves past it or the
//! source is exhausted. Every upsert therefore carries a whole-day total, and
//! an interrupted run never overwrites a day it did not finish. Once the
//! source is exhausted the accumulated rows are exported as CSV.
//!
//! The execution context is checked before every page and once more before
//! the export.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, info, instrument};

use paysettle_core::{DateRange, JobId};
use paysettle_settlement::{
    group_transactions, progress_percent, DayBuffer, SettlementRow, SettlementRun, Transaction,
};

use crate::export::{ArtifactWriter, ExportError};
use crate::jobs::cancellation::{ExecutionContext, Interrupt};
use crate::jobs::store::{JobStore, JobStoreError};
use crate::settlements::{SettlementSink, SinkError};
use crate::transactions::{SourceError, TransactionSource};

/// Aggregation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AggregateError {
    #[error("failed to count transactions: {0}")]
    Count(SourceError),
    #[error("failed to fetch page at offset {offset}: {source}")]
    Fetch { offset: u64, source: SourceError },
    #[error("failed to upsert settlement: {0}")]
    Upsert(SinkError),
    #[error("failed to record progress: {0}")]
    Store(JobStoreError),
    #[error("failed to export settlements: {0}")]
    Export(ExportError),
    #[error("job cancelled")]
    Cancelled,
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl From<Interrupt> for AggregateError {
    fn from(interrupt: Interrupt) -> Self {
        match interrupt {
            Interrupt::Cancelled => AggregateError::Cancelled,
            Interrupt::DeadlineExceeded => AggregateError::DeadlineExceeded,
        }
    }
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub job_id: JobId,
    pub total: u64,
    pub processed: u64,
    pub pages: u64,
    /// Distinct (merchant, date) rows produced
    pub rows: usize,
    pub artifact: PathBuf,
}

#[derive(Debug, Clone, Copy, Default)]
struct ProgressState {
    processed: u64,
    total: u64,
    percent: f64,
}

/// Processed/progress bookkeeping for one run.
///
/// All updates go through one lock, so the counter and the percentage derived
/// from it always move together and never backwards.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    state: Mutex<ProgressState>,
}

impl ProgressTracker {
    pub fn new(total: u64) -> Self {
        Self {
            state: Mutex::new(ProgressState {
                total,
                ..ProgressState::default()
            }),
        }
    }

    /// Account for `fetched` more transactions.
    ///
    /// Returns the clamped delta actually added and the new percentage.
    pub fn advance(&self, fetched: u64) -> (u64, f64) {
        let mut state = self.state.lock();
        let before = state.processed;
        state.processed = before.saturating_add(fetched).min(state.total);
        state.percent = state
            .percent
            .max(progress_percent(state.processed, state.total));
        (state.processed - before, state.percent)
    }

    pub fn processed(&self) -> u64 {
        self.state.lock().processed
    }

    pub fn percent(&self) -> f64 {
        self.state.lock().percent
    }
}

/// Runs settlement jobs against the transaction source and settlement sink.
#[derive(Clone)]
pub struct SettlementAggregator {
    source: Arc<dyn TransactionSource>,
    sink: Arc<dyn SettlementSink>,
    store: Arc<dyn JobStore>,
    writer: ArtifactWriter,
    batch_size: u64,
}

impl SettlementAggregator {
    pub fn new(
        source: Arc<dyn TransactionSource>,
        sink: Arc<dyn SettlementSink>,
        store: Arc<dyn JobStore>,
        writer: ArtifactWriter,
        batch_size: u64,
    ) -> Self {
        Self {
            source,
            sink,
            store,
            writer,
            batch_size: batch_size.max(1),
        }
    }

    pub fn batch_size(&self) -> u64 {
        self.batch_size
    }

    pub fn writer(&self) -> &ArtifactWriter {
        &self.writer
    }

    /// Aggregate `range` for `job_id` and write its export.
    ///
    /// The job record must already be RUNNING; status transitions are the
    /// caller's responsibility.
    #[instrument(skip(self, ctx), fields(job_id = %job_id, range = %range), err)]
    pub async fn run(
        &self,
        job_id: JobId,
        range: &DateRange,
        ctx: &ExecutionContext,
    ) -> Result<RunSummary, AggregateError> {
        ctx.checkpoint()?;

        let total = self
            .source
            .count_by_range(range)
            .await
            .map_err(AggregateError::Count)?;
        self.store
            .update_total(job_id, total)
            .await
            .map_err(AggregateError::Store)?;
        info!(total, batch_size = self.batch_size, "settlement run started");

        let tracker = ProgressTracker::new(total);
        let mut run = SettlementRun::new(job_id);
        let mut held = DayBuffer::new();
        let mut offset = 0u64;
        let mut pages = 0u64;

        loop {
            ctx.checkpoint()?;

            let page = self
                .source
                .fetch_page(range, offset, self.batch_size)
                .await
                .map_err(|source| AggregateError::Fetch { offset, source })?;
            if page.is_empty() {
                break;
            }
            let fetched = page.len() as u64;

            let rows = group_transactions(job_id, &page, Utc::now());
            run.absorb(&rows);
            let open_date = page.last().map(Transaction::settlement_date);
            let complete = held.push(rows, open_date);
            self.upsert_all(&complete).await?;

            let (delta, percent) = tracker.advance(fetched);
            self.store
                .increment_processed(job_id, delta, percent)
                .await
                .map_err(AggregateError::Store)?;

            pages += 1;
            offset += fetched;
            debug!(
                page = pages,
                fetched,
                upserted = complete.len(),
                held = held.held(),
                percent,
                "page settled"
            );

            if fetched < self.batch_size {
                break;
            }
        }

        self.upsert_all(&held.finish()).await?;
        ctx.checkpoint()?;

        let rows = run.into_rows();
        let artifact = self
            .writer
            .write(job_id, &rows)
            .await
            .map_err(AggregateError::Export)?;

        info!(
            pages,
            processed = tracker.processed(),
            rows = rows.len(),
            artifact = %artifact.display(),
            "settlement run complete"
        );

        Ok(RunSummary {
            job_id,
            total,
            processed: tracker.processed(),
            pages,
            rows: rows.len(),
            artifact,
        })
    }

    async fn upsert_all(&self, rows: &[SettlementRow]) -> Result<(), AggregateError> {
        for row in rows {
            self.sink.upsert(row).await.map_err(AggregateError::Upsert)?;
        }
        Ok(())
    }
}
