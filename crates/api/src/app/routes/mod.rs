use axum::Router;

pub mod jobs;
pub mod system;

/// Router for the job endpoints.
pub fn router() -> Router {
    Router::new().nest("/jobs", jobs::router())
}
