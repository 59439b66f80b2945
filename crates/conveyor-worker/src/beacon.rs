//! Heartbeats for statically configured workers.

use chrono::Utc;
use conveyor_core::worker::{Worker, WorkerRegistration};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::registry::WorkerRegistry;

/// Keeps configured workers registered while their backend answers `ping`.
/// A worker whose backend stops answering simply expires.
pub struct WorkerBeacon {
    registry: Arc<WorkerRegistry>,
    workers: Vec<(WorkerRegistration, Duration)>,
}

impl WorkerBeacon {
    pub fn new(registry: Arc<WorkerRegistry>, workers: Vec<(WorkerRegistration, Duration)>) -> Self {
        Self { registry, workers }
    }

    /// Heartbeat every reachable worker once. Returns how many were renewed.
    pub async fn beat(&self) -> usize {
        let mut renewed = 0;
        for (reg, ttl) in &self.workers {
            let candidate = Worker::from_registration(reg.clone(), *ttl, Utc::now());
            let reachable = match self.registry.connect(&candidate) {
                Ok(client) => client.ping().await,
                Err(e) => Err(e),
            };
            if let Err(e) = reachable {
                warn!(worker = %reg.name, error = %e, "Worker did not answer ping");
                continue;
            }
            match self.registry.register(reg.clone(), *ttl).await {
                Ok(_) => renewed += 1,
                Err(e) => warn!(worker = %reg.name, error = %e, "Failed to heartbeat worker"),
            }
        }
        debug!(renewed, total = self.workers.len(), "Worker heartbeat pass");
        renewed
    }

    pub async fn run(&self, interval: Duration, shutdown: CancellationToken) {
        info!(workers = self.workers.len(), "Starting worker beacon");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    self.beat().await;
                }
            }
        }
        info!("Worker beacon stopped");
    }
}
