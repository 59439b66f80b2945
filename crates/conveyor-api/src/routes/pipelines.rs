//! Pipeline management endpoints.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use conveyor_config::Variables;
use conveyor_core::ResourceId;
use conveyor_core::build::Build;
use conveyor_core::pipeline::{Job, Pipeline, PipelineConfig, Resource, TaskStep};
use conveyor_scheduler::DestroyReport;
use serde::Deserialize;
use std::collections::BTreeMap;
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(list_pipelines).post(set_pipeline))
        .route("/{id}", get(get_pipeline).delete(destroy_pipeline))
        .route("/{id}/pause", post(pause_pipeline))
        .route("/{id}/unpause", post(unpause_pipeline))
        .route("/{id}/jobs", get(list_jobs))
        .route("/{id}/resources", get(list_resources))
        .route("/{id}/tasks", post(execute_task))
}

#[derive(Debug, Deserialize)]
struct ListPipelinesQuery {
    team: Option<String>,
    name: Option<String>,
}

async fn list_pipelines(
    State(state): State<AppState>,
    Query(query): Query<ListPipelinesQuery>,
) -> Result<Json<Vec<Pipeline>>, ApiError> {
    let pipelines = state
        .plane
        .pipelines()
        .await?
        .into_iter()
        .filter(|p| query.team.as_ref().is_none_or(|t| *t == p.team))
        .filter(|p| query.name.as_ref().is_none_or(|n| *n == p.name))
        .collect();
    Ok(Json(pipelines))
}

/// Either a parsed config or KDL source with its `((var))` values.
#[derive(Debug, Deserialize)]
struct SetPipelineRequest {
    #[serde(default = "default_team")]
    team: String,
    name: String,
    config: Option<PipelineConfig>,
    kdl: Option<String>,
    #[serde(default)]
    vars: BTreeMap<String, String>,
}

fn default_team() -> String {
    "main".to_string()
}

async fn set_pipeline(
    State(state): State<AppState>,
    Json(req): Json<SetPipelineRequest>,
) -> Result<Json<Pipeline>, ApiError> {
    let pipeline = match (req.config, req.kdl) {
        (Some(config), None) => state.plane.set_pipeline(&req.team, &req.name, config).await?,
        (None, Some(kdl)) => {
            let mut vars = Variables::new();
            for (name, value) in req.vars {
                vars.set(name, value);
            }
            state
                .plane
                .set_pipeline_kdl(&req.team, &req.name, &kdl, &vars)
                .await?
        }
        _ => {
            return Err(ApiError::BadRequest(
                "exactly one of config or kdl is required".to_string(),
            ));
        }
    };
    Ok(Json(pipeline))
}

async fn get_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Pipeline>, ApiError> {
    Ok(Json(state.plane.pipeline(ResourceId::from_uuid(id)).await?))
}

async fn destroy_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<DestroyReport>), ApiError> {
    let report = state
        .plane
        .destroy_pipeline(ResourceId::from_uuid(id))
        .await?;
    let status = if report.deleted {
        StatusCode::OK
    } else {
        StatusCode::ACCEPTED
    };
    Ok((status, Json(report)))
}

async fn pause_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .plane
        .set_pipeline_paused(ResourceId::from_uuid(id), true)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unpause_pipeline(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .plane
        .set_pipeline_paused(ResourceId::from_uuid(id), false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn list_jobs(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Job>>, ApiError> {
    Ok(Json(state.plane.jobs(ResourceId::from_uuid(id)).await?))
}

async fn list_resources(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Vec<Resource>>, ApiError> {
    Ok(Json(state.plane.resources(ResourceId::from_uuid(id)).await?))
}

async fn execute_task(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(task): Json<TaskStep>,
) -> Result<(StatusCode, Json<Build>), ApiError> {
    let build = state
        .plane
        .execute_task(ResourceId::from_uuid(id), task)
        .await?;
    Ok((StatusCode::CREATED, Json(build)))
}
