//! Worker registration and heartbeats.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use conveyor_core::worker::{Worker, WorkerRegistration};
use serde::Deserialize;
use std::time::Duration;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_workers).post(register_worker))
        .route("/{name}", delete(remove_worker))
        .route("/{name}/heartbeat", post(heartbeat))
}

async fn list_workers(State(state): State<AppState>) -> Result<Json<Vec<Worker>>, ApiError> {
    Ok(Json(state.plane.workers().await?))
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(flatten)]
    registration: WorkerRegistration,
    ttl_secs: Option<u64>,
}

async fn register_worker(
    State(state): State<AppState>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<Worker>), ApiError> {
    let ttl = req
        .ttl_secs
        .map(Duration::from_secs)
        .unwrap_or(state.worker_ttl);
    if ttl.is_zero() {
        return Err(ApiError::BadRequest("ttl_secs must be positive".to_string()));
    }
    let worker = state.plane.register_worker(req.registration, ttl).await?;
    Ok((StatusCode::CREATED, Json(worker)))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<Json<Worker>, ApiError> {
    Ok(Json(state.plane.heartbeat_worker(&name).await?))
}

async fn remove_worker(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Result<StatusCode, ApiError> {
    state.plane.remove_worker(&name).await?;
    Ok(StatusCode::NO_CONTENT)
}
