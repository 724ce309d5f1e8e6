//! Core job types.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use paysettle_core::{DateRange, JobId};

/// Job execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Accepted and waiting for a free worker
    Queued,
    /// Currently being executed by a worker
    Running,
    /// Completed successfully; the export artifact exists
    Finished,
    /// Aborted by an error (or a deadline)
    Failed,
    /// Cancelled by a caller before it could finish
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "QUEUED",
            JobStatus::Running => "RUNNING",
            JobStatus::Finished => "FINISHED",
            JobStatus::Failed => "FAILED",
            JobStatus::Cancelled => "CANCELLED",
        }
    }

    /// Whether a record in `self` may move to `next`.
    ///
    /// Terminal states are final; everything else may only move forward.
    pub fn can_transition_to(&self, next: JobStatus) -> bool {
        match (self, next) {
            (JobStatus::Queued, JobStatus::Running) => true,
            (JobStatus::Queued, JobStatus::Cancelled) => true,
            (JobStatus::Queued, JobStatus::Failed) => true,
            (JobStatus::Running, s) => s.is_terminal(),
            _ => false,
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "QUEUED" => Ok(JobStatus::Queued),
            "RUNNING" => Ok(JobStatus::Running),
            "FINISHED" => Ok(JobStatus::Finished),
            "FAILED" => Ok(JobStatus::Failed),
            "CANCELLED" => Ok(JobStatus::Cancelled),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Persisted state of a settlement job, as returned by status lookups.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: JobId,
    pub status: JobStatus,
    /// Inclusive date range the job settles
    pub range: DateRange,
    /// 0-100, display only
    pub progress: f64,
    pub processed: u64,
    /// Number of qualifying transactions, fixed before the first batch
    pub total: u64,
    /// Download location; only present once the job is finished
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cancelled_at: Option<DateTime<Utc>>,
}

impl JobRecord {
    /// A freshly accepted job, not yet picked up by a worker.
    pub fn queued(job_id: JobId, range: DateRange, now: DateTime<Utc>) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            range,
            progress: 0.0,
            processed: 0,
            total: 0,
            result_path: None,
            error: None,
            created_at: now,
            updated_at: now,
            cancelled: false,
            cancelled_at: None,
        }
    }
}

/// Unit of work handed from the queue to the worker pool.
///
/// Only identity and parameters travel through the channel; the record itself
/// lives in the job store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub job_id: JobId,
    pub range: DateRange,
    pub enqueued_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states_are_final() {
        for terminal in [JobStatus::Finished, JobStatus::Failed, JobStatus::Cancelled] {
            assert!(terminal.is_terminal());
            for next in [
                JobStatus::Queued,
                JobStatus::Running,
                JobStatus::Finished,
                JobStatus::Failed,
                JobStatus::Cancelled,
            ] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn lifecycle_moves_forward_only() {
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Running));
        assert!(JobStatus::Queued.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Queued.can_transition_to(JobStatus::Finished));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Finished));
        assert!(JobStatus::Running.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Queued));
        assert!(!JobStatus::Running.can_transition_to(JobStatus::Running));
    }

    #[test]
    fn status_round_trips_through_its_wire_name() {
        for status in [
            JobStatus::Queued,
            JobStatus::Running,
            JobStatus::Finished,
            JobStatus::Failed,
            JobStatus::Cancelled,
        ] {
            assert_eq!(status.as_str().parse::<JobStatus>().unwrap(), status);
            assert_eq!(
                serde_json::to_value(status).unwrap(),
                serde_json::Value::String(status.as_str().to_string())
            );
        }
    }

    #[test]
    fn queued_record_starts_empty() {
        let range = DateRange::parse("2025-01-01", "2025-01-31").unwrap();
        let record = JobRecord::queued(JobId::new(), range, Utc::now());
        assert_eq!(record.status, JobStatus::Queued);
        assert_eq!((record.processed, record.total), (0, 0));
        assert_eq!(record.progress, 0.0);
        assert!(!record.cancelled);
        assert!(record.result_path.is_none());
    }
}
