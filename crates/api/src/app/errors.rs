use axum::http::StatusCode;
use axum::response::IntoResponse;
use serde_json::json;

use paysettle_infra::jobs::QueueError;

pub fn queue_error_to_response(err: QueueError) -> axum::response::Response {
    match err {
        QueueError::Validation(e) => json_error(StatusCode::BAD_REQUEST, "validation_error", e.to_string()),
        QueueError::QueueFull { .. } => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "queue_full", err.to_string())
        }
        QueueError::ShuttingDown => {
            json_error(StatusCode::SERVICE_UNAVAILABLE, "shutting_down", err.to_string())
        }
        QueueError::NotFound(_) => json_error(StatusCode::NOT_FOUND, "not_found", err.to_string()),
        QueueError::AlreadyTerminal { .. } => {
            json_error(StatusCode::CONFLICT, "already_terminal", err.to_string())
        }
        QueueError::Store(e) => {
            tracing::error!(error = %e, "job store failure");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "store_error", e.to_string())
        }
    }
}

pub fn json_error(
    status: StatusCode,
    code: &'static str,
    message: impl Into<String>,
) -> axum::response::Response {
    (
        status,
        axum::Json(json!({
            "error": code,
            "message": message.into(),
        })),
    )
        .into_response()
}
