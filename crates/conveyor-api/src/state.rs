//! Application state.

use conveyor_scheduler::ControlPlane;
use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub plane: Arc<ControlPlane>,
    /// TTL granted to workers registering over HTTP without one.
    pub worker_ttl: Duration,
}

impl AppState {
    pub fn new(plane: Arc<ControlPlane>) -> Self {
        Self {
            plane,
            worker_ttl: Duration::from_secs(30),
        }
    }
}
