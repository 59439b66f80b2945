//! Resource version endpoints.

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_core::ResourceId;
use conveyor_core::version::ResourceVersion;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}/versions", get(list_versions))
        .route("/{id}/check", post(check_resource))
}

/// Versions in check order, oldest first.
async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ResourceVersion>>, ApiError> {
    Ok(Json(state.plane.versions(ResourceId::from_uuid(id)).await?))
}

async fn check_resource(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<ResourceVersion>>, ApiError> {
    Ok(Json(
        state.plane.check_resource(ResourceId::from_uuid(id)).await?,
    ))
}
