//! Build endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_core::ResourceId;
use conveyor_core::build::Build;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;
use crate::ws;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_build))
        .route("/{id}/abort", post(abort_build))
        .route("/{id}/events", get(ws::build_events))
}

async fn get_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Build>, ApiError> {
    Ok(Json(state.plane.build(ResourceId::from_uuid(id)).await?))
}

async fn abort_build(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Build>, ApiError> {
    Ok(Json(state.plane.abort_build(ResourceId::from_uuid(id)).await?))
}
