//! API request handlers.
//!
//! All fallible handlers return `Result<impl IntoResponse, LabError>` so that
//! errors become HTTP responses through the `IntoResponse` implementation on
//! `LabError`.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use super::{ApiResponse, AppState};
use crate::error::LabError;
use crate::jobs::{JobId, JobKind, JobPayload};

// ═══════════════════════════════════════════════════════════════════════════════
// Health & Metrics
// ═══════════════════════════════════════════════════════════════════════════════

pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": chrono::Utc::now().to_rfc3339(),
        "queue": {
            "pending": state.jobs.queue().len(),
            "running": state.jobs.is_running(),
        }
    }))
}

pub async fn prometheus_metrics(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(axum::http::header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        state.metrics.render(),
    )
}

// ═══════════════════════════════════════════════════════════════════════════════
// Job Handlers
// ═══════════════════════════════════════════════════════════════════════════════

#[derive(Debug, Deserialize)]
pub struct EnqueueRequest {
    pub job_type: String,
    #[serde(default)]
    pub kwargs: JobPayload,
}

pub async fn enqueue_job(
    State(state): State<AppState>,
    Json(req): Json<EnqueueRequest>,
) -> Result<impl IntoResponse, LabError> {
    let kind: JobKind = req.job_type.parse()?;
    let info = state.jobs.enqueue(kind, req.kwargs).await?;
    Ok((StatusCode::CREATED, Json(ApiResponse::success(info))))
}

pub async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(ApiResponse::success(state.jobs.list()))
}

pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, LabError> {
    let info = state.jobs.peek(JobId(id))?;
    Ok(Json(ApiResponse::success(info)))
}

pub async fn cancel_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, LabError> {
    state.jobs.cancel(JobId(id))?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Default, Deserialize)]
pub struct StartQuery {
    #[serde(default)]
    pub stop_when_queue_empties: bool,
}

pub async fn start_queue(
    State(state): State<AppState>,
    Query(query): Query<StartQuery>,
) -> impl IntoResponse {
    let started = state.jobs.start_loop(query.stop_when_queue_empties);
    (
        StatusCode::ACCEPTED,
        Json(ApiResponse::success(serde_json::json!({
            "started": started,
            "running": state.jobs.is_running(),
        }))),
    )
}
