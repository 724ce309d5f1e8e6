use serde::{Deserialize, Serialize};

use paysettle_core::JobId;
use paysettle_infra::jobs::{JobRecord, JobStatus};

// -------------------------
// Request DTOs
// -------------------------

#[derive(Debug, Deserialize)]
pub struct SubmitSettlementRequest {
    pub from: String,
    pub to: String,
}

// -------------------------
// Response DTOs
// -------------------------

#[derive(Debug, Serialize)]
pub struct SubmitSettlementResponse {
    pub job_id: JobId,
    pub status: JobStatus,
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub job_id: JobId,
    /// `CANCELLED` when the job never started, `CANCELLING` while its worker winds down
    pub status: &'static str,
}

impl From<&JobRecord> for CancelResponse {
    fn from(record: &JobRecord) -> Self {
        let status = if record.status == JobStatus::Cancelled {
            "CANCELLED"
        } else {
            "CANCELLING"
        };
        Self {
            job_id: record.job_id,
            status,
        }
    }
}
