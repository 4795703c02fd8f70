//! HTTP surface of the job core.
//!
//! - `POST   /api/v1/jobs`        submit `{job_type, kwargs}`
//! - `GET    /api/v1/jobs`        pending jobs in execution order
//! - `GET    /api/v1/jobs/:id`    one pending job
//! - `DELETE /api/v1/jobs/:id`    cancel a pending job
//! - `POST   /api/v1/jobs/start`  start the drain loop if it is not running
//! - `GET    /health`, `GET /metrics`

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::jobs::JobService;
use crate::telemetry::MetricsRegistry;

pub use handlers::{EnqueueRequest, StartQuery};

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub jobs: Arc<JobService>,
    pub metrics: MetricsRegistry,
}

/// Build the API router.
pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::prometheus_metrics))
        .nest("/api/v1", v1_router())
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/jobs", post(handlers::enqueue_job).get(handlers::list_jobs))
        .route("/jobs/start", post(handlers::start_queue))
        .route(
            "/jobs/:id",
            get(handlers::get_job).delete(handlers::cancel_job),
        )
}

/// API response wrapper.
#[derive(Debug, serde::Serialize, serde::Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_response_success() {
        let response = ApiResponse::success("test data");
        assert!(response.success);
        assert_eq!(response.data, Some("test data"));
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["data"], "test data");
    }
}
