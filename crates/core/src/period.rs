//! Inclusive calendar date ranges.

use chrono::{DateTime, Days, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};
use crate::value_object::ValueObject;

/// Wire format for calendar dates (ISO 8601, `YYYY-MM-DD`).
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// An inclusive `[from, to]` range of calendar dates.
///
/// Construction enforces `from <= to`. A range covers whole UTC days: a
/// timestamp belongs to it when `start_instant() <= ts < end_instant()`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DateRange {
    from: NaiveDate,
    to: NaiveDate,
}

impl DateRange {
    pub fn new(from: NaiveDate, to: NaiveDate) -> DomainResult<Self> {
        if from > to {
            return Err(DomainError::validation(format!(
                "from ({from}) must not be after to ({to})"
            )));
        }
        Ok(Self { from, to })
    }

    /// Parse both bounds from `YYYY-MM-DD` strings and validate ordering.
    ///
    /// Impossible calendar dates such as `2025-02-30` are rejected.
    pub fn parse(from: &str, to: &str) -> DomainResult<Self> {
        let from = parse_date("from", from)?;
        let to = parse_date("to", to)?;
        Self::new(from, to)
    }

    pub fn from(&self) -> NaiveDate {
        self.from
    }

    pub fn to(&self) -> NaiveDate {
        self.to
    }

    /// First instant covered by the range (midnight UTC of `from`).
    pub fn start_instant(&self) -> DateTime<Utc> {
        self.from.and_time(NaiveTime::MIN).and_utc()
    }

    /// First instant *after* the range (midnight UTC of the day after `to`).
    pub fn end_instant(&self) -> DateTime<Utc> {
        // NaiveDate::MAX has no successor; saturate to the end of that day.
        match self.to.checked_add_days(Days::new(1)) {
            Some(next) => next.and_time(NaiveTime::MIN).and_utc(),
            None => NaiveDateTime::MAX.and_utc(),
        }
    }

    pub fn contains(&self, ts: DateTime<Utc>) -> bool {
        ts >= self.start_instant() && ts < self.end_instant()
    }

    /// Number of calendar days in the range (at least 1).
    pub fn days(&self) -> u64 {
        (self.to - self.from).num_days() as u64 + 1
    }
}

impl ValueObject for DateRange {}

impl core::fmt::Display for DateRange {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(
            f,
            "{}..={}",
            self.from.format(DATE_FORMAT),
            self.to.format(DATE_FORMAT)
        )
    }
}

fn parse_date(field: &str, raw: &str) -> DomainResult<NaiveDate> {
    let raw = raw.trim();
    // chrono accepts some non-padded forms; require the canonical 10-char layout.
    if raw.len() != 10 {
        return Err(DomainError::validation(format!(
            "invalid {field} date {raw:?}: expected YYYY-MM-DD"
        )));
    }
    NaiveDate::parse_from_str(raw, DATE_FORMAT)
        .map_err(|e| DomainError::validation(format!("invalid {field} date {raw:?}: {e}")))
}
