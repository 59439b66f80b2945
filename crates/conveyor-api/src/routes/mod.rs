//! API routes.

pub mod builds;
pub mod containers;
pub mod health;
pub mod jobs;
pub mod pipelines;
pub mod resources;
pub mod workers;

use crate::AppState;
use axum::Router;

/// Build the main API router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .nest("/api/v1", api_router())
        .merge(health::router())
        .with_state(state)
}

fn api_router() -> Router<AppState> {
    Router::new()
        .nest("/pipelines", pipelines::router())
        .nest("/jobs", jobs::router())
        .nest("/builds", builds::router())
        .nest("/resources", resources::router())
        .nest("/containers", containers::router())
        .nest("/workers", workers::router())
}
