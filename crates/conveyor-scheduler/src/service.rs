//! Control plane facade.
//!
//! Wires the scheduler, the execution engine, the resource checker and the
//! garbage collector to one store and worker pool, and exposes the
//! operations the API serves.

use conveyor_config::{
    SystemConfig, Variables, check_resource_types, parse_pipeline_with_vars, validate_pipeline,
};
use conveyor_core::build::{Build, BuildStatus, Page, Pagination};
use conveyor_core::container::{Container, ContainerScope};
use conveyor_core::pipeline::{Job, Pipeline, PipelineConfig, Resource, TaskStep};
use conveyor_core::version::ResourceVersion;
use conveyor_core::worker::{Worker, WorkerRegistration};
use conveyor_core::{Error, ResourceId, Result};
use conveyor_db::{BuildRepo, DbError, PipelineRepo, Store, TaskCacheRepo, VersionRepo};
use conveyor_gc::{ContainerRegistry, GarbageCollector};
use conveyor_worker::{WorkerConnector, WorkerRegistry};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::check::ResourceChecker;
use crate::engine::{BuildEvent, ExecutionEngine};
use crate::planner::BuildPlanFactory;
use crate::scheduler::{JobScheduler, ScheduleOutcome, TriggerOutcome};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DestroyReport {
    pub aborted_builds: usize,
    pub released_containers: u64,
    /// False while builds are still winding down; the collector deletes
    /// the pipeline once they have.
    pub deleted: bool,
}

pub struct ControlPlane {
    store: Arc<dyn Store>,
    workers: Arc<WorkerRegistry>,
    containers: Arc<ContainerRegistry>,
    checker: Arc<ResourceChecker>,
    scheduler: JobScheduler,
    engine: Arc<ExecutionEngine>,
    gc: GarbageCollector,
    base_resource_types: Vec<String>,
}

impl ControlPlane {
    pub fn new(
        store: Arc<dyn Store>,
        connector: Arc<dyn WorkerConnector>,
        config: &SystemConfig,
    ) -> Self {
        let workers = Arc::new(WorkerRegistry::new(store.clone(), connector));
        let containers = Arc::new(ContainerRegistry::new(store.clone()));
        let checker = Arc::new(ResourceChecker::new(
            store.clone(),
            workers.clone(),
            containers.clone(),
            config.gc.check_container_ttl,
        ));
        let engine = Arc::new(ExecutionEngine::new(
            store.clone(),
            workers.clone(),
            containers.clone(),
            checker.clone(),
            config.engine.clone(),
        ));
        Self {
            scheduler: JobScheduler::new(store.clone(), config.scheduler.clone()),
            gc: GarbageCollector::new(store.clone(), workers.clone(), config.gc.clone()),
            store,
            workers,
            containers,
            checker,
            engine,
            base_resource_types: config.base_resource_types.clone(),
        }
    }

    pub fn registry(&self) -> Arc<WorkerRegistry> {
        self.workers.clone()
    }

    pub fn engine(&self) -> &Arc<ExecutionEngine> {
        &self.engine
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    pub fn collector(&self) -> &GarbageCollector {
        &self.gc
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.engine.subscribe()
    }

    /// Run the scheduler, engine and collector loops until `shutdown`.
    /// Builds still running are left to finish or be aborted by another
    /// instance.
    pub async fn run(&self, shutdown: CancellationToken) {
        tokio::join!(
            self.scheduler.run(shutdown.clone()),
            self.engine.clone().run(shutdown.clone()),
            self.gc.run(shutdown),
        );
    }

    // Pipelines

    pub async fn set_pipeline(
        &self,
        team: &str,
        name: &str,
        config: PipelineConfig,
    ) -> Result<Pipeline> {
        if team.trim().is_empty() || name.trim().is_empty() {
            return Err(Error::InvalidInput("team and pipeline name are required".to_string()));
        }
        validate_pipeline(&config)?;
        check_resource_types(&config, &self.base_resource_types)?;
        let pipeline = self.store.save_pipeline(team, name, &config).await?;
        info!(
            team = %team,
            pipeline = %name,
            config_version = pipeline.config_version,
            "Pipeline configured"
        );
        Ok(pipeline)
    }

    /// Interpolate `vars` into a KDL pipeline, then set it.
    pub async fn set_pipeline_kdl(
        &self,
        team: &str,
        name: &str,
        source: &str,
        vars: &Variables,
    ) -> Result<Pipeline> {
        let config = parse_pipeline_with_vars(source, vars)?;
        self.set_pipeline(team, name, config).await
    }

    pub async fn pipelines(&self) -> Result<Vec<Pipeline>> {
        Ok(self.store.list_pipelines().await?)
    }

    pub async fn pipeline(&self, id: ResourceId) -> Result<Pipeline> {
        Ok(self.store.get_pipeline(id).await?)
    }

    pub async fn find_pipeline(&self, team: &str, name: &str) -> Result<Pipeline> {
        self.store
            .find_pipeline(team, name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("pipeline {team}/{name}")))
    }

    pub async fn set_pipeline_paused(&self, id: ResourceId, paused: bool) -> Result<()> {
        self.store.set_pipeline_paused(id, paused).await?;
        info!(pipeline_id = %id, paused, "Pipeline pause changed");
        Ok(())
    }

    /// Stop everything the pipeline runs and delete it.
    ///
    /// Safe to repeat: a second call picks up whatever the first one could
    /// not finish.
    pub async fn destroy_pipeline(&self, id: ResourceId) -> Result<DestroyReport> {
        let pipeline = self.store.begin_destroy(id).await?;
        info!(team = %pipeline.team, pipeline = %pipeline.name, "Destroying pipeline");

        let in_flight = self.store.in_flight_builds(id).await?;
        for build in &in_flight {
            self.abort_build(build.id).await?;
        }
        let released_containers = self.containers.release_pipeline(id).await?;

        let deleted = match self.store.delete_pipeline(id).await {
            Ok(()) => true,
            Err(DbError::Conflict(reason)) => {
                debug!(pipeline = %pipeline.name, reason = %reason, "Pipeline deletion deferred");
                false
            }
            Err(e) => return Err(e.into()),
        };
        Ok(DestroyReport {
            aborted_builds: in_flight.len(),
            released_containers,
            deleted,
        })
    }

    // Jobs and builds

    pub async fn jobs(&self, pipeline_id: ResourceId) -> Result<Vec<Job>> {
        Ok(self.store.jobs(pipeline_id).await?)
    }

    pub async fn job(&self, id: ResourceId) -> Result<Job> {
        Ok(self.store.get_job(id).await?)
    }

    pub async fn set_job_paused(&self, id: ResourceId, paused: bool) -> Result<()> {
        self.store.set_job_paused(id, paused).await?;
        info!(job_id = %id, paused, "Job pause changed");
        Ok(())
    }

    pub async fn trigger_build(&self, job_id: ResourceId) -> Result<TriggerOutcome> {
        self.scheduler.trigger(job_id).await
    }

    pub async fn schedule_job(&self, job_id: ResourceId) -> Result<ScheduleOutcome> {
        self.scheduler.schedule(job_id).await
    }

    pub async fn job_builds(&self, job_id: ResourceId, page: Page) -> Result<(Vec<Build>, Pagination)> {
        Ok(self.store.job_builds(job_id, page).await?)
    }

    pub async fn build(&self, id: ResourceId) -> Result<Build> {
        Ok(self.store.get_build(id).await?)
    }

    /// Abort a build. Pending builds end at once; a started build is
    /// flagged and cancelled by whichever engine runs it.
    pub async fn abort_build(&self, id: ResourceId) -> Result<Build> {
        let build = self.store.request_abort(id).await?;
        if build.status == BuildStatus::Started && self.engine.abort_local(id) {
            debug!(build_id = %id, "Cancelled locally running build");
        }
        info!(build_id = %id, build = %build.name(), status = %build.status, "Build abort requested");
        Ok(build)
    }

    /// Create a one-off build running `task` in the pipeline's context.
    pub async fn execute_task(&self, pipeline_id: ResourceId, task: TaskStep) -> Result<Build> {
        let pipeline = self.store.get_pipeline(pipeline_id).await?;
        if pipeline.destroying {
            return Err(Error::PipelineDestroyed(format!(
                "{}/{}",
                pipeline.team, pipeline.name
            )));
        }
        let plan = BuildPlanFactory::one_off(&task)?;
        let build = self.store.create_one_off_build(pipeline_id, plan).await?;
        info!(build_id = %build.id, task = %task.name, "One-off build created");
        Ok(build)
    }

    // Resources

    pub async fn resources(&self, pipeline_id: ResourceId) -> Result<Vec<Resource>> {
        Ok(self.store.resources(pipeline_id).await?)
    }

    pub async fn versions(&self, resource_id: ResourceId) -> Result<Vec<ResourceVersion>> {
        Ok(self.store.versions(resource_id).await?)
    }

    pub async fn check_resource(&self, resource_id: ResourceId) -> Result<Vec<ResourceVersion>> {
        self.checker.check(resource_id).await
    }

    /// Drop a job step's task caches. Their holder containers lose their
    /// owner and go on the next reconcile.
    pub async fn clear_task_cache(
        &self,
        job_id: ResourceId,
        step: &str,
        path: Option<&str>,
    ) -> Result<u64> {
        let job = self.store.get_job(job_id).await?;
        let removed = self.store.clear_task_caches(job.id, step, path).await?;
        info!(job = %job.name, step = %step, removed, "Task caches cleared");
        Ok(removed)
    }

    // Containers and workers

    pub async fn list_containers(&self, scope: &ContainerScope) -> Result<Vec<Container>> {
        self.containers.list(scope).await
    }

    pub async fn workers(&self) -> Result<Vec<Worker>> {
        self.workers.workers().await
    }

    pub async fn register_worker(&self, reg: WorkerRegistration, ttl: Duration) -> Result<Worker> {
        self.workers.register(reg, ttl).await
    }

    pub async fn heartbeat_worker(&self, name: &str) -> Result<Worker> {
        self.workers.heartbeat(name).await
    }

    pub async fn remove_worker(&self, name: &str) -> Result<()> {
        self.workers.remove(name).await
    }
}
