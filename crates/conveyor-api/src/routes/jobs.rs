//! Job endpoints: pausing, triggering and build history.

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use conveyor_core::ResourceId;
use conveyor_core::build::{Build, LeaseDenial, Page, Pagination};
use conveyor_core::pipeline::Job;
use conveyor_scheduler::{ScheduleOutcome, TriggerOutcome};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::AppState;
use crate::error::ApiError;

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/{id}", get(get_job))
        .route("/{id}/pause", post(pause_job))
        .route("/{id}/unpause", post(unpause_job))
        .route("/{id}/trigger", post(trigger_job))
        .route("/{id}/schedule", post(schedule_job))
        .route("/{id}/builds", get(list_builds))
        .route("/{id}/caches/{step}", delete(clear_task_cache))
}

async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<Job>, ApiError> {
    Ok(Json(state.plane.job(ResourceId::from_uuid(id)).await?))
}

async fn pause_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .plane
        .set_job_paused(ResourceId::from_uuid(id), true)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unpause_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<StatusCode, ApiError> {
    state
        .plane
        .set_job_paused(ResourceId::from_uuid(id), false)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn trigger_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<(StatusCode, Json<TriggerOutcome>), ApiError> {
    let outcome = state.plane.trigger_build(ResourceId::from_uuid(id)).await?;
    let status = match outcome {
        TriggerOutcome::Created { .. } => StatusCode::CREATED,
        TriggerOutcome::Queued { .. } => StatusCode::ACCEPTED,
    };
    Ok((status, Json(outcome)))
}

/// Wire form of a scheduling pass.
#[derive(Debug, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
enum ScheduleResponse {
    Created { build: Build },
    UpToDate,
    Unschedulable,
    Unsatisfiable { reason: String },
    Deferred { reason: String, denial: LeaseDenial },
}

impl From<ScheduleOutcome> for ScheduleResponse {
    fn from(outcome: ScheduleOutcome) -> Self {
        match outcome {
            ScheduleOutcome::Created(build) => Self::Created { build },
            ScheduleOutcome::UpToDate => Self::UpToDate,
            ScheduleOutcome::Unschedulable => Self::Unschedulable,
            ScheduleOutcome::Unsatisfiable(reason) => Self::Unsatisfiable { reason },
            ScheduleOutcome::Deferred(denial) => Self::Deferred {
                reason: denial.to_string(),
                denial,
            },
        }
    }
}

async fn schedule_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<Json<ScheduleResponse>, ApiError> {
    let outcome = state.plane.schedule_job(ResourceId::from_uuid(id)).await?;
    Ok(Json(outcome.into()))
}

#[derive(Debug, Deserialize)]
struct BuildsQuery {
    since: Option<u64>,
    until: Option<u64>,
    limit: Option<usize>,
}

impl From<BuildsQuery> for Page {
    fn from(query: BuildsQuery) -> Self {
        let default = Page::default();
        Page {
            since: query.since,
            until: query.until,
            limit: query.limit.unwrap_or(default.limit),
        }
    }
}

#[derive(Debug, Serialize)]
struct BuildsResponse {
    builds: Vec<Build>,
    pagination: Pagination,
}

async fn list_builds(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Query(query): Query<BuildsQuery>,
) -> Result<Json<BuildsResponse>, ApiError> {
    let (builds, pagination) = state
        .plane
        .job_builds(ResourceId::from_uuid(id), query.into())
        .await?;
    Ok(Json(BuildsResponse { builds, pagination }))
}

#[derive(Debug, Deserialize)]
struct CacheQuery {
    path: Option<String>,
}

#[derive(Debug, Serialize)]
struct ClearedCaches {
    removed: u64,
}

async fn clear_task_cache(
    State(state): State<AppState>,
    Path((id, step)): Path<(Uuid, String)>,
    Query(query): Query<CacheQuery>,
) -> Result<Json<ClearedCaches>, ApiError> {
    let removed = state
        .plane
        .clear_task_cache(ResourceId::from_uuid(id), &step, query.path.as_deref())
        .await?;
    Ok(Json(ClearedCaches { removed }))
}
