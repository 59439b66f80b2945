//! Reconciliation of container records against worker inventories.

use chrono::{DateTime, Utc};
use conveyor_config::system::GcConfig;
use conveyor_core::build::{Build, BuildStatus};
use conveyor_core::container::{Container, ContainerOwner, ContainerScope};
use conveyor_core::worker::Worker;
use conveyor_core::{Error, Result};
use conveyor_db::{BuildRepo, ContainerRepo, PipelineRepo, Store, TaskCacheRepo};
use conveyor_worker::WorkerRegistry;
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What one reconciliation pass did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Started builds finished because their engine stopped renewing.
    pub builds_reaped: usize,
    pub pipelines_deleted: usize,
    pub workers_pruned: usize,
    pub workers_checked: usize,
    pub workers_unreachable: usize,
    /// Live containers the registry did not know or had released.
    pub orphans_destroyed: usize,
    /// Recorded containers whose owner was gone or expired.
    pub expired_destroyed: usize,
    pub records_removed: usize,
    pub destroy_failures: usize,
}

impl ReconcileReport {
    pub fn is_idle(&self) -> bool {
        *self
            == ReconcileReport {
                workers_checked: self.workers_checked,
                ..Default::default()
            }
    }
}

/// Whether a recorded container may keep existing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Verdict {
    Keep,
    Reap,
}

pub struct GarbageCollector {
    store: Arc<dyn Store>,
    workers: Arc<WorkerRegistry>,
    config: GcConfig,
}

impl GarbageCollector {
    pub fn new(store: Arc<dyn Store>, workers: Arc<WorkerRegistry>, config: GcConfig) -> Self {
        Self {
            store,
            workers,
            config,
        }
    }

    pub async fn reconcile(&self) -> Result<ReconcileReport> {
        self.reconcile_at(Utc::now()).await
    }

    /// One full pass: finish abandoned builds and pipeline teardowns, prune
    /// long-dead workers, then diff every live worker against its records.
    pub async fn reconcile_at(&self, now: DateTime<Utc>) -> Result<ReconcileReport> {
        let mut report = ReconcileReport {
            builds_reaped: self.reap_abandoned_builds_at(now).await?,
            pipelines_deleted: self.reap_destroying_pipelines().await?,
            workers_pruned: self
                .workers
                .prune_expired_at(self.config.worker_prune_grace, now)
                .await?
                .len(),
            ..Default::default()
        };

        for worker in self.workers.alive_workers_at(now).await? {
            report.workers_checked += 1;
            if let Err(e) = self.reconcile_worker(&worker, now, &mut report).await {
                report.workers_unreachable += 1;
                warn!(worker = %worker.name, error = %e, "Skipping worker this pass");
            }
        }
        Ok(report)
    }

    async fn reconcile_worker(
        &self,
        worker: &Worker,
        now: DateTime<Utc>,
        report: &mut ReconcileReport,
    ) -> Result<()> {
        let client = self.workers.connect(worker)?;

        // Records are always written before the backend creates a
        // container, so reading them after the listing sees every handle
        // the listing can contain.
        let live = client.list_containers().await?;
        let records = self.store.containers_on_worker(&worker.name).await?;
        let recorded: BTreeSet<&str> = records.iter().map(|c| c.handle.as_str()).collect();

        for handle in live.iter().filter(|h| !recorded.contains(h.as_str())) {
            match client.destroy_container(handle).await {
                Ok(()) => {
                    report.orphans_destroyed += 1;
                    info!(worker = %worker.name, handle = %handle, "Destroyed unknown container");
                }
                Err(e) => {
                    report.destroy_failures += 1;
                    warn!(worker = %worker.name, handle = %handle, error = %e, "Failed to destroy container");
                }
            }
        }

        for container in &records {
            if self.verdict(container, now).await? == Verdict::Keep {
                continue;
            }
            if live.contains(&container.handle) {
                if let Err(e) = client.destroy_container(&container.handle).await {
                    report.destroy_failures += 1;
                    warn!(
                        worker = %worker.name,
                        handle = %container.handle,
                        error = %e,
                        "Failed to destroy container, keeping its record"
                    );
                    continue;
                }
                if container.is_released() {
                    report.orphans_destroyed += 1;
                } else {
                    report.expired_destroyed += 1;
                }
                info!(
                    worker = %worker.name,
                    handle = %container.handle,
                    owner = %container.owner,
                    "Destroyed container"
                );
            }
            self.store.delete_container(&container.handle).await?;
            report.records_removed += 1;
        }
        Ok(())
    }

    async fn verdict(&self, container: &Container, now: DateTime<Utc>) -> Result<Verdict> {
        // A running build's containers are never destroyed, released or not.
        if let ContainerOwner::BuildStep { build_id, .. } = &container.owner {
            if let Some(build) = self.store.find_build(*build_id).await? {
                if !build.status.is_terminal() {
                    return Ok(Verdict::Keep);
                }
            }
        }
        if container.is_released() || !self.owner_is_valid(container, now).await? {
            return Ok(Verdict::Reap);
        }
        Ok(Verdict::Keep)
    }

    async fn owner_is_valid(&self, container: &Container, now: DateTime<Utc>) -> Result<bool> {
        let expired = container.best_if_used_by.is_some_and(|t| t <= now);
        let valid = match &container.owner {
            ContainerOwner::BuildStep { build_id, .. } => {
                let retention = chrono::Duration::from_std(self.config.build_retention)
                    .map_err(|e| Error::InvalidInput(format!("build retention: {e}")))?;
                match self.store.find_build(*build_id).await? {
                    Some(build) => !build.retention_elapsed(retention, now),
                    None => false,
                }
            }
            ContainerOwner::ResourceCheck { resource_id } => {
                if expired {
                    return Ok(false);
                }
                match self.store.get_resource(*resource_id).await {
                    Ok(resource) => {
                        resource.active && self.pipeline_is_live(resource.pipeline_id).await?
                    }
                    Err(conveyor_db::DbError::NotFound(_)) => false,
                    Err(e) => return Err(e.into()),
                }
            }
            ContainerOwner::ResourceTypeCheck {
                pipeline_id,
                resource_type,
            } => {
                if expired {
                    return Ok(false);
                }
                match self.store.get_pipeline(*pipeline_id).await {
                    Ok(pipeline) => {
                        !pipeline.destroying && pipeline.config.resource_type(resource_type).is_some()
                    }
                    Err(conveyor_db::DbError::NotFound(_)) => false,
                    Err(e) => return Err(e.into()),
                }
            }
            ContainerOwner::TaskCache { cache_id } => {
                self.store.find_task_cache(*cache_id).await?.is_some()
            }
        };
        Ok(valid)
    }

    async fn pipeline_is_live(&self, pipeline_id: conveyor_core::ResourceId) -> Result<bool> {
        match self.store.get_pipeline(pipeline_id).await {
            Ok(pipeline) => Ok(!pipeline.destroying),
            Err(conveyor_db::DbError::NotFound(_)) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Finish every started build whose claim ran out. A build with an abort
    /// request ends aborted and gives up its step containers; any other
    /// build errors. Either way its leases are dropped.
    pub async fn reap_abandoned_builds_at(&self, now: DateTime<Utc>) -> Result<usize> {
        let mut reaped = 0;
        for build in self.store.expired_build_claims(now).await? {
            let status = if build.abort_requested {
                BuildStatus::Aborted
            } else {
                BuildStatus::Errored
            };
            if !self.store.finish_build(build.id, status).await? {
                continue;
            }
            reaped += 1;
            warn!(
                build_id = %build.id,
                build = %build.name(),
                status = %status,
                "Finished build whose claim expired"
            );
            if status == BuildStatus::Aborted {
                self.release_build_containers(&build).await?;
            }
        }
        Ok(reaped)
    }

    async fn release_build_containers(&self, build: &Build) -> Result<()> {
        let scope = ContainerScope::Pipeline(build.pipeline_id);
        for container in self.store.list_containers(&scope).await? {
            let owned = matches!(
                &container.owner,
                ContainerOwner::BuildStep { build_id, .. } if *build_id == build.id
            );
            if owned && !container.is_released() {
                self.store.release_containers(&container.owner).await?;
            }
        }
        Ok(())
    }

    /// Release the containers of every pipeline being destroyed and delete
    /// those whose builds have all finished. Safe to repeat.
    pub async fn reap_destroying_pipelines(&self) -> Result<usize> {
        let mut deleted = 0;
        for pipeline in self.store.destroying_pipelines().await? {
            self.store.release_pipeline_containers(pipeline.id).await?;
            if !self.store.in_flight_builds(pipeline.id).await?.is_empty() {
                debug!(pipeline = %pipeline.name, "Pipeline still has builds in flight");
                continue;
            }
            match self.store.delete_pipeline(pipeline.id).await {
                Ok(()) => {
                    deleted += 1;
                    info!(team = %pipeline.team, pipeline = %pipeline.name, "Deleted destroyed pipeline");
                }
                Err(conveyor_db::DbError::Conflict(_)) | Err(conveyor_db::DbError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(deleted)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        self.run_every(self.config.interval, shutdown).await
    }

    pub async fn run_every(&self, interval: Duration, shutdown: CancellationToken) {
        info!(interval_secs = interval.as_secs(), "Starting garbage collector");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.reconcile().await {
                    Ok(report) if report.is_idle() => debug!(?report, "Reconcile pass"),
                    Ok(report) => info!(?report, "Reconcile pass"),
                    Err(e) => warn!(error = %e, "Reconcile pass failed, retrying next interval"),
                },
            }
        }
        info!("Garbage collector stopped");
    }
}
