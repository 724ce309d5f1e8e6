//! Settlement job endpoints: submission, status, cancellation and downloads.

use axum::{
    extract::{Extension, Path},
    http::{header, StatusCode},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};

use paysettle_core::JobId;
use paysettle_infra::jobs::JobStatus;

use crate::app::dto::{CancelResponse, SubmitSettlementRequest, SubmitSettlementResponse};
use crate::app::errors::{json_error, queue_error_to_response};
use crate::app::services::AppServices;

pub fn router() -> Router {
    Router::new()
        .route("/settlement", post(submit_settlement))
        .route("/downloads/:file", get(download))
        .route("/:job_id", get(get_status))
        .route("/:job_id/cancel", post(cancel))
}

/// POST /jobs/settlement
pub async fn submit_settlement(
    Extension(services): Extension<AppServices>,
    Json(req): Json<SubmitSettlementRequest>,
) -> axum::response::Response {
    match services.queue.submit(&req.from, &req.to).await {
        Ok(job_id) => (
            StatusCode::ACCEPTED,
            Json(SubmitSettlementResponse {
                job_id,
                status: JobStatus::Queued,
            }),
        )
            .into_response(),
        Err(e) => queue_error_to_response(e),
    }
}

/// GET /jobs/:job_id
pub async fn get_status(
    Extension(services): Extension<AppServices>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.status(job_id).await {
        Ok(record) => Json(record).into_response(),
        Err(e) => queue_error_to_response(e),
    }
}

/// POST /jobs/:job_id/cancel
pub async fn cancel(
    Extension(services): Extension<AppServices>,
    Path(job_id): Path<String>,
) -> axum::response::Response {
    let job_id = match parse_job_id(&job_id) {
        Ok(id) => id,
        Err(resp) => return resp,
    };

    match services.queue.cancel(job_id).await {
        Ok(record) => (StatusCode::ACCEPTED, Json(CancelResponse::from(&record))).into_response(),
        Err(e) => queue_error_to_response(e),
    }
}

/// GET /jobs/downloads/:file
///
/// Serves `<job id>.csv` from the export directory.
pub async fn download(
    Extension(services): Extension<AppServices>,
    Path(file): Path<String>,
) -> axum::response::Response {
    let job_id = match services.layout.job_for_file(&file) {
        Ok(id) => id,
        Err(e) => return json_error(StatusCode::BAD_REQUEST, "invalid_file_name", e.to_string()),
    };

    let path = services.layout.path_for(job_id);
    match tokio::fs::read(&path).await {
        Ok(body) => (
            [
                (header::CONTENT_TYPE, "text/csv".to_string()),
                (
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{file}\""),
                ),
            ],
            body,
        )
            .into_response(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            json_error(StatusCode::NOT_FOUND, "not_found", format!("no export for job {job_id}"))
        }
        Err(e) => {
            tracing::error!(path = %path.display(), error = %e, "failed to read export");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "export_unreadable", e.to_string())
        }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, axum::response::Response> {
    raw.parse::<JobId>()
        .map_err(|e| json_error(StatusCode::BAD_REQUEST, "invalid_job_id", e.to_string()))
}
