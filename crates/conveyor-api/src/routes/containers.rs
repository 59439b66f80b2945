//! Container listing.

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use conveyor_core::ResourceId;
use conveyor_core::container::{Container, ContainerScope};
use serde::Deserialize;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new().route("/", get(list_containers))
}

/// Exactly one filter selects the scope.
#[derive(Debug, Deserialize)]
struct ContainersQuery {
    team: Option<String>,
    pipeline_id: Option<Uuid>,
    worker: Option<String>,
}

impl TryFrom<ContainersQuery> for ContainerScope {
    type Error = ApiError;

    fn try_from(query: ContainersQuery) -> Result<Self, Self::Error> {
        match (query.team, query.pipeline_id, query.worker) {
            (Some(team), None, None) => Ok(ContainerScope::Team(team)),
            (None, Some(id), None) => Ok(ContainerScope::Pipeline(ResourceId::from_uuid(id))),
            (None, None, Some(worker)) => Ok(ContainerScope::Worker(worker)),
            _ => Err(ApiError::BadRequest(
                "exactly one of team, pipeline_id or worker is required".to_string(),
            )),
        }
    }
}

async fn list_containers(
    State(state): State<AppState>,
    Query(query): Query<ContainersQuery>,
) -> Result<Json<Vec<Container>>, ApiError> {
    let scope = ContainerScope::try_from(query)?;
    Ok(Json(state.plane.list_containers(&scope).await?))
}
