//! Placement & execution engine.
//!
//! Claims pending builds, walks their plan and runs every leaf step in its
//! own tracked container on a worker chosen by the registry. Sequential
//! steps stop at the first failure and skip the rest; parallel branches all
//! run to completion. Aborts arrive either through [`ExecutionEngine::abort_local`]
//! or by polling the build's abort flag, and cancel the step tree through a
//! per-build token.

use chrono::{DateTime, Utc};
use conveyor_config::system::EngineConfig;
use conveyor_core::build::{Build, BuildOutput, BuildStatus};
use conveyor_core::container::{ContainerOwner, NewContainer, TaskCache};
use conveyor_core::plan::{GetPlan, Plan, PlanId, PlanStep, PutPlan, TaskPlan, TypeRef};
use conveyor_core::version::ResourceResponse;
use conveyor_core::worker::{ContainerSpec, LogLine, ProcessSpec, VolumeMount};
use conveyor_core::{Error, ResourceId, Result};
use conveyor_db::{BuildRepo, PipelineRepo, Store, TaskCacheRepo, VersionRepo};
use conveyor_gc::ContainerRegistry;
use conveyor_worker::{Placement, PlacementSpec, WorkerRegistry};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::check::ResourceChecker;
use crate::runner::{
    BUILD_DIR, Finished, IN_SCRIPT, OUT_SCRIPT, launch, parse_response, resource_request,
    run_process, script,
};

const FINISH_ATTEMPTS: u32 = 5;
const FINISH_INITIAL_DELAY: Duration = Duration::from_millis(100);

/// Run `op` until it succeeds, fails with a non-transient error or has been
/// tried `attempts` times, doubling the pause after each transient failure.
async fn retry_transient<T, F, Fut>(
    attempts: u32,
    initial_delay: Duration,
    what: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = initial_delay;
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt < attempts => {
                warn!(
                    attempt,
                    attempts,
                    retry_in_ms = delay.as_millis() as u64,
                    error = %e,
                    "Failed to {what}, retrying"
                );
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// How a step, or a subtree of steps, ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail", rename_all = "snake_case")]
pub enum StepOutcome {
    Succeeded,
    /// The process ran and exited non-zero.
    Failed(i32),
    /// The step could not run at all.
    Errored(String),
    Aborted,
}

impl StepOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, StepOutcome::Succeeded)
    }

    fn severity(&self) -> u8 {
        match self {
            StepOutcome::Succeeded => 0,
            StepOutcome::Failed(_) => 1,
            StepOutcome::Errored(_) => 2,
            StepOutcome::Aborted => 3,
        }
    }

    /// The more severe of two outcomes.
    fn worst(self, other: StepOutcome) -> StepOutcome {
        if other.severity() > self.severity() {
            other
        } else {
            self
        }
    }

    pub fn status(&self) -> BuildStatus {
        match self {
            StepOutcome::Succeeded => BuildStatus::Succeeded,
            StepOutcome::Failed(_) => BuildStatus::Failed,
            StepOutcome::Errored(_) => BuildStatus::Errored,
            StepOutcome::Aborted => BuildStatus::Aborted,
        }
    }
}

/// Progress of a running build.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum BuildEvent {
    StepStarted {
        build_id: ResourceId,
        plan_id: PlanId,
        step: String,
    },
    Log {
        build_id: ResourceId,
        plan_id: PlanId,
        step: String,
        line: LogLine,
    },
    StepFinished {
        build_id: ResourceId,
        plan_id: PlanId,
        step: String,
        outcome: StepOutcome,
    },
    StepSkipped {
        build_id: ResourceId,
        plan_id: PlanId,
        step: String,
    },
    BuildFinished {
        build_id: ResourceId,
        status: BuildStatus,
    },
}

impl BuildEvent {
    pub fn build_id(&self) -> ResourceId {
        match self {
            BuildEvent::StepStarted { build_id, .. }
            | BuildEvent::Log { build_id, .. }
            | BuildEvent::StepFinished { build_id, .. }
            | BuildEvent::StepSkipped { build_id, .. }
            | BuildEvent::BuildFinished { build_id, .. } => *build_id,
        }
    }
}

/// State shared by every step of one build.
struct BuildRun {
    build: Build,
    cancel: CancellationToken,
    /// Artifact name to the volume holding it.
    artifacts: Mutex<BTreeMap<String, String>>,
    /// Owners of every container this build asked for.
    owners: Mutex<Vec<ContainerOwner>>,
}

impl BuildRun {
    fn owner(&self, plan_id: PlanId, step: &str) -> ContainerOwner {
        let owner = ContainerOwner::BuildStep {
            build_id: self.build.id,
            plan_id,
            step: step.to_string(),
        };
        self.owners.lock().push(owner.clone());
        owner
    }

    /// Earlier steps' containers pull later steps toward the same worker,
    /// where their artifacts live.
    fn affinity(&self) -> Vec<ContainerOwner> {
        self.owners.lock().clone()
    }

    fn artifact_volume(&self, name: &str) -> String {
        format!("artifact-{}-{name}", self.build.id)
    }

    fn artifact(&self, name: &str) -> Result<String> {
        self.artifacts.lock().get(name).cloned().ok_or_else(|| {
            Error::Configuration(format!("no step produced an artifact named {name}"))
        })
    }

    fn new_container(&self, placement: &Placement, owner: ContainerOwner) -> NewContainer {
        NewContainer {
            worker_name: placement.worker.name.clone(),
            owner,
            team: self.build.team.clone(),
            pipeline_id: Some(self.build.pipeline_id),
            best_if_used_by: None,
        }
    }
}

fn mount(name: String, artifact: &str, read_only: bool) -> VolumeMount {
    VolumeMount {
        name,
        mount_path: format!("{BUILD_DIR}/{artifact}"),
        read_only,
    }
}

pub struct ExecutionEngine {
    store: Arc<dyn Store>,
    workers: Arc<WorkerRegistry>,
    containers: Arc<ContainerRegistry>,
    checker: Arc<ResourceChecker>,
    config: EngineConfig,
    permits: Arc<Semaphore>,
    running: Mutex<HashMap<ResourceId, CancellationToken>>,
    events: broadcast::Sender<BuildEvent>,
}

impl ExecutionEngine {
    pub fn new(
        store: Arc<dyn Store>,
        workers: Arc<WorkerRegistry>,
        containers: Arc<ContainerRegistry>,
        checker: Arc<ResourceChecker>,
        config: EngineConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(1024);
        Self {
            store,
            workers,
            containers,
            checker,
            permits: Arc::new(Semaphore::new(config.max_concurrent_builds.max(1))),
            config,
            running: Mutex::new(HashMap::new()),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    /// Cancel a build running on this engine. False if it runs elsewhere
    /// or not at all.
    pub fn abort_local(&self, build_id: ResourceId) -> bool {
        match self.running.lock().get(&build_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Move a pending build to `started` for this engine. `None` when
    /// another engine got there first or the build is no longer pending.
    pub async fn claim(&self, build_id: ResourceId) -> Result<Option<Build>> {
        if !self.store.start_build(build_id, self.claim_deadline()?).await? {
            return Ok(None);
        }
        Ok(Some(self.store.get_build(build_id).await?))
    }

    fn claim_deadline(&self) -> Result<DateTime<Utc>> {
        let ttl = chrono::Duration::from_std(self.config.claim_ttl)
            .map_err(|e| Error::InvalidInput(format!("claim ttl: {e}")))?;
        Ok(Utc::now() + ttl)
    }

    /// Claim and run every pending build, one after another.
    pub async fn run_pending(&self) -> Result<Vec<(ResourceId, BuildStatus)>> {
        let mut finished = Vec::new();
        for pending in self.store.pending_builds().await? {
            if let Some(build) = self.claim(pending.id).await? {
                let status = self.execute(build).await?;
                finished.push((pending.id, status));
            }
        }
        Ok(finished)
    }

    /// Claim loop: start pending builds while permits last.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(
            max_concurrent_builds = self.config.max_concurrent_builds,
            "Starting execution engine"
        );
        let mut ticker = tokio::time::interval(self.config.claim_interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.clone().dispatch().await {
                        warn!(error = %e, "Failed to claim pending builds");
                    }
                }
            }
        }
        info!("Execution engine stopped");
    }

    async fn dispatch(self: Arc<Self>) -> Result<usize> {
        let mut started = 0;
        for pending in self.store.pending_builds().await? {
            let Ok(permit) = self.permits.clone().try_acquire_owned() else {
                debug!("All build slots busy");
                break;
            };
            let Some(build) = self.claim(pending.id).await? else {
                continue;
            };
            let engine = self.clone();
            tokio::spawn(async move {
                let _permit = permit;
                let build_id = build.id;
                if let Err(e) = engine.execute(build).await {
                    error!(build_id = %build_id, error = %e, "Build execution failed");
                }
            });
            started += 1;
        }
        Ok(started)
    }

    /// Run a started build to a terminal status.
    pub async fn execute(&self, build: Build) -> Result<BuildStatus> {
        let build_id = build.id;
        let cancel = CancellationToken::new();
        self.running.lock().insert(build_id, cancel.clone());
        let result = self.drive(build, cancel).await;
        self.running.lock().remove(&build_id);
        result
    }

    async fn drive(&self, build: Build, cancel: CancellationToken) -> Result<BuildStatus> {
        info!(build_id = %build.id, build = %build.name(), "Executing build");
        if build.abort_requested {
            cancel.cancel();
        }

        let plan = build.plan.clone();
        let run = BuildRun {
            build,
            cancel: cancel.clone(),
            artifacts: Mutex::new(BTreeMap::new()),
            owners: Mutex::new(Vec::new()),
        };
        let outcome = match &plan {
            Some(plan) => {
                let done = CancellationToken::new();
                let steps = async {
                    let outcome = self.run_plan(&run, plan).await;
                    done.cancel();
                    outcome
                };
                let (outcome, ()) =
                    tokio::join!(steps, self.watch_abort(run.build.id, &cancel, &done));
                outcome
            }
            None => StepOutcome::Errored("build has no plan".to_string()),
        };

        let status = if cancel.is_cancelled() {
            BuildStatus::Aborted
        } else {
            outcome.status()
        };
        // If every attempt fails the claim lapses and the collector
        // finishes the build instead.
        let build_id = run.build.id;
        let finish = || async move {
            self.store
                .finish_build(build_id, status)
                .await
                .map_err(Error::from)
        };
        let recorded =
            retry_transient(FINISH_ATTEMPTS, FINISH_INITIAL_DELAY, "finish build", finish).await?;
        if !recorded {
            warn!(build_id = %build_id, status = %status, "Build was already finished");
        }

        if status == BuildStatus::Aborted {
            let owners = run.owners.lock().clone();
            for owner in &owners {
                if let Err(e) = self.containers.release(owner).await {
                    warn!(
                        build_id = %build_id,
                        owner = %owner,
                        error = %e,
                        "Failed to release step containers"
                    );
                }
            }
        }

        match status {
            BuildStatus::Succeeded => info!(build_id = %run.build.id, "Build succeeded"),
            _ => info!(build_id = %run.build.id, status = %status, "Build finished"),
        }
        let _ = self.events.send(BuildEvent::BuildFinished {
            build_id: run.build.id,
            status,
        });
        Ok(status)
    }

    /// Renew the build's claim and poll its abort flag until the steps end.
    /// Losing the claim cancels the build here; someone else has already
    /// finished it.
    async fn watch_abort(
        &self,
        build_id: ResourceId,
        cancel: &CancellationToken,
        done: &CancellationToken,
    ) {
        let mut ticker = tokio::time::interval(self.config.abort_poll_interval);
        loop {
            tokio::select! {
                _ = done.cancelled() => return,
                _ = ticker.tick() => {
                    self.renew_claim(build_id, cancel).await;
                    if cancel.is_cancelled() {
                        continue;
                    }
                    match self.store.abort_requested(build_id).await {
                        Ok(true) => {
                            info!(build_id = %build_id, "Abort requested");
                            cancel.cancel();
                        }
                        Ok(false) => {}
                        Err(e) => {
                            warn!(build_id = %build_id, error = %e, "Failed to poll abort flag");
                        }
                    }
                }
            }
        }
    }

    async fn renew_claim(&self, build_id: ResourceId, cancel: &CancellationToken) {
        let renewed = match self.claim_deadline() {
            Ok(until) => self
                .store
                .renew_build_claim(build_id, until)
                .await
                .map_err(Error::from),
            Err(e) => Err(e),
        };
        match renewed {
            Ok(true) => {}
            Ok(false) => {
                warn!(build_id = %build_id, "Lost claim on build");
                cancel.cancel();
            }
            Err(e) => warn!(build_id = %build_id, error = %e, "Failed to renew build claim"),
        }
    }

    #[async_recursion::async_recursion]
    async fn run_plan(&self, run: &BuildRun, plan: &Plan) -> StepOutcome {
        if run.cancel.is_cancelled() {
            self.skip(run, plan);
            return StepOutcome::Aborted;
        }
        match &plan.step {
            PlanStep::Do { steps } => {
                for (i, step) in steps.iter().enumerate() {
                    let outcome = self.run_plan(run, step).await;
                    if !outcome.is_success() {
                        for rest in &steps[i + 1..] {
                            self.skip(run, rest);
                        }
                        return outcome;
                    }
                }
                StepOutcome::Succeeded
            }
            PlanStep::InParallel { steps } => join_all(steps.iter().map(|s| self.run_plan(run, s)))
                .await
                .into_iter()
                .fold(StepOutcome::Succeeded, StepOutcome::worst),
            PlanStep::Get(_) | PlanStep::Task(_) | PlanStep::Put(_) => self.run_leaf(run, plan).await,
        }
    }

    fn skip(&self, run: &BuildRun, plan: &Plan) {
        for leaf in plan.leaves() {
            let step = leaf.step_name().unwrap_or_default().to_string();
            debug!(build_id = %run.build.id, step = %step, "Skipping step");
            let _ = self.events.send(BuildEvent::StepSkipped {
                build_id: run.build.id,
                plan_id: leaf.id,
                step,
            });
        }
    }

    async fn run_leaf(&self, run: &BuildRun, plan: &Plan) -> StepOutcome {
        let step = plan.step_name().unwrap_or_default().to_string();
        let _ = self.events.send(BuildEvent::StepStarted {
            build_id: run.build.id,
            plan_id: plan.id,
            step: step.clone(),
        });

        let result = match &plan.step {
            PlanStep::Get(get) => self.run_get(run, plan.id, get).await,
            PlanStep::Task(task) => self.run_task(run, plan.id, task).await,
            PlanStep::Put(put) => self.run_put(run, plan.id, put).await,
            PlanStep::Do { .. } | PlanStep::InParallel { .. } => {
                Err(Error::Internal("composite step run as a leaf".to_string()))
            }
        };
        let outcome = match result {
            Ok(outcome) => outcome,
            Err(Error::Cancelled) => StepOutcome::Aborted,
            Err(e) => {
                error!(build_id = %run.build.id, step = %step, error = %e, "Step errored");
                StepOutcome::Errored(e.to_string())
            }
        };
        if let StepOutcome::Failed(code) = outcome {
            error!(build_id = %run.build.id, step = %step, exit_code = code, "Step failed");
        }

        let _ = self.events.send(BuildEvent::StepFinished {
            build_id: run.build.id,
            plan_id: plan.id,
            step,
            outcome: outcome.clone(),
        });
        outcome
    }

    async fn place(&self, spec: PlacementSpec) -> Result<Placement> {
        let placement = self.workers.choose(&spec).await?;
        debug!(worker = %placement.worker.name, spec = %spec, "Placed step");
        Ok(placement)
    }

    /// Image that runs a resource's scripts on `placement`'s worker.
    async fn resource_image(
        &self,
        run: &BuildRun,
        type_ref: &TypeRef,
        placement: &Placement,
    ) -> Result<String> {
        if type_ref.custom.is_some() {
            let pipeline = self.store.get_pipeline(run.build.pipeline_id).await?;
            return self.checker.type_image(&pipeline, type_ref).await;
        }
        placement
            .worker
            .image_for(&type_ref.base_type)
            .map(str::to_string)
            .ok_or_else(|| {
                Error::Infrastructure(format!(
                    "worker {} has no image for {}",
                    placement.worker.name, type_ref.base_type
                ))
            })
    }

    async fn run_in(
        &self,
        run: &BuildRun,
        plan_id: PlanId,
        step: &str,
        placement: &Placement,
        handle: &str,
        process: ProcessSpec,
    ) -> Result<Finished> {
        let events = self.events.clone();
        let build_id = run.build.id;
        let step = step.to_string();
        run_process(
            placement.client.as_ref(),
            handle,
            process,
            &run.cancel,
            move |line| {
                let _ = events.send(BuildEvent::Log {
                    build_id,
                    plan_id,
                    step: step.clone(),
                    line,
                });
            },
        )
        .await
    }

    async fn run_get(&self, run: &BuildRun, plan_id: PlanId, get: &GetPlan) -> Result<StepOutcome> {
        let owner = run.owner(plan_id, &get.name);
        let placement = self
            .place(PlacementSpec {
                team: run.build.team.clone(),
                platform: None,
                tags: get.tags.clone(),
                resource_type: Some(get.resource_type.base_type.clone()),
                affinity: run.affinity(),
            })
            .await?;
        let image = self.resource_image(run, &get.resource_type, &placement).await?;

        let volume = run.artifact_volume(&get.name);
        let container = launch(
            &self.containers,
            placement.client.as_ref(),
            run.new_container(&placement, owner),
            ContainerSpec {
                handle: String::new(),
                image,
                privileged: get.resource_type.custom.as_ref().is_some_and(|c| c.privileged),
                env: Default::default(),
                working_dir: Some(BUILD_DIR.to_string()),
                volumes: vec![mount(volume.clone(), &get.name, false)],
            },
        )
        .await?;

        let request = resource_request(&get.source, Some(&get.params), Some(&get.version));
        let destination = format!("{BUILD_DIR}/{}", get.name);
        let finished = self
            .run_in(
                run,
                plan_id,
                &get.name,
                &placement,
                &container.handle,
                script(IN_SCRIPT, vec![destination], request),
            )
            .await?;
        if finished.exit_code != 0 {
            return Ok(StepOutcome::Failed(finished.exit_code));
        }
        let response: ResourceResponse = parse_response(IN_SCRIPT, &finished.stdout)?;
        debug!(
            build_id = %run.build.id,
            step = %get.name,
            version = %response.version,
            "Fetched version"
        );

        run.artifacts.lock().insert(get.name.clone(), volume);
        Ok(StepOutcome::Succeeded)
    }

    async fn run_task(
        &self,
        run: &BuildRun,
        plan_id: PlanId,
        task: &TaskPlan,
    ) -> Result<StepOutcome> {
        let owner = run.owner(plan_id, &task.name);
        let caches = self.task_caches(run, task).await?;

        let mut affinity = run.affinity();
        affinity.extend(caches.iter().map(|c| ContainerOwner::TaskCache { cache_id: c.id }));
        let placement = self
            .place(PlacementSpec {
                team: run.build.team.clone(),
                platform: task.config.platform.clone(),
                tags: task.tags.clone(),
                resource_type: None,
                affinity,
            })
            .await?;

        let mut volumes = Vec::new();
        for input in &task.config.inputs {
            volumes.push(mount(run.artifact(input)?, input, false));
        }
        for output in &task.config.outputs {
            volumes.push(mount(run.artifact_volume(output), output, false));
        }
        for cache in &caches {
            self.keep_cache(run, &placement, cache, &task.config.image).await?;
            volumes.push(mount(cache.volume_name(), &cache.path, false));
        }

        let container = launch(
            &self.containers,
            placement.client.as_ref(),
            run.new_container(&placement, owner),
            ContainerSpec {
                handle: String::new(),
                image: task.config.image.clone(),
                privileged: task.privileged,
                env: task.config.env.clone(),
                working_dir: Some(BUILD_DIR.to_string()),
                volumes,
            },
        )
        .await?;

        let process = ProcessSpec {
            path: task.config.run.path.clone(),
            args: task.config.run.args.clone(),
            env: task.config.env.clone(),
            dir: Some(
                task.config
                    .run
                    .dir
                    .as_ref()
                    .map(|d| format!("{BUILD_DIR}/{d}"))
                    .unwrap_or_else(|| BUILD_DIR.to_string()),
            ),
            stdin: None,
        };
        let finished = self
            .run_in(run, plan_id, &task.name, &placement, &container.handle, process)
            .await?;
        if finished.exit_code != 0 {
            return Ok(StepOutcome::Failed(finished.exit_code));
        }

        let mut artifacts = run.artifacts.lock();
        for output in &task.config.outputs {
            artifacts.insert(output.clone(), run.artifact_volume(output));
        }
        Ok(StepOutcome::Succeeded)
    }

    async fn task_caches(&self, run: &BuildRun, task: &TaskPlan) -> Result<Vec<TaskCache>> {
        // One-off builds have no job to key caches by.
        let Some(job_id) = run.build.job_id else {
            return Ok(Vec::new());
        };
        let mut caches = Vec::with_capacity(task.config.caches.len());
        for path in &task.config.caches {
            caches.push(
                self.store
                    .find_or_create_task_cache(run.build.pipeline_id, job_id, &task.name, path)
                    .await?,
            );
        }
        Ok(caches)
    }

    /// Make sure a container owned by `cache` holds its volume on the
    /// chosen worker, so the volume outlives the build's own containers.
    async fn keep_cache(
        &self,
        run: &BuildRun,
        placement: &Placement,
        cache: &TaskCache,
        image: &str,
    ) -> Result<()> {
        let owner = ContainerOwner::TaskCache { cache_id: cache.id };
        let held = self
            .containers
            .owned_by(&owner)
            .await?
            .iter()
            .any(|c| c.worker_name == placement.worker.name && !c.is_released());
        if held {
            return Ok(());
        }
        let container = launch(
            &self.containers,
            placement.client.as_ref(),
            run.new_container(placement, owner),
            ContainerSpec {
                handle: String::new(),
                image: image.to_string(),
                privileged: false,
                env: Default::default(),
                working_dir: None,
                volumes: vec![mount(cache.volume_name(), &cache.path, false)],
            },
        )
        .await?;
        debug!(handle = %container.handle, path = %cache.path, "Created task cache holder");
        Ok(())
    }

    async fn run_put(&self, run: &BuildRun, plan_id: PlanId, put: &PutPlan) -> Result<StepOutcome> {
        let owner = run.owner(plan_id, &put.name);
        let placement = self
            .place(PlacementSpec {
                team: run.build.team.clone(),
                platform: None,
                tags: put.tags.clone(),
                resource_type: Some(put.resource_type.base_type.clone()),
                affinity: run.affinity(),
            })
            .await?;
        let image = self.resource_image(run, &put.resource_type, &placement).await?;

        let volumes = match &put.inputs {
            Some(names) => names
                .iter()
                .map(|name| Ok(mount(run.artifact(name)?, name, true)))
                .collect::<Result<Vec<_>>>()?,
            None => run
                .artifacts
                .lock()
                .iter()
                .map(|(name, volume)| mount(volume.clone(), name, true))
                .collect(),
        };

        let container = launch(
            &self.containers,
            placement.client.as_ref(),
            run.new_container(&placement, owner),
            ContainerSpec {
                handle: String::new(),
                image,
                privileged: put.resource_type.custom.as_ref().is_some_and(|c| c.privileged),
                env: Default::default(),
                working_dir: Some(BUILD_DIR.to_string()),
                volumes,
            },
        )
        .await?;

        let request = resource_request(&put.source, Some(&put.params), None);
        let finished = self
            .run_in(
                run,
                plan_id,
                &put.name,
                &placement,
                &container.handle,
                script(OUT_SCRIPT, vec![BUILD_DIR.to_string()], request),
            )
            .await?;
        if finished.exit_code != 0 {
            return Ok(StepOutcome::Failed(finished.exit_code));
        }
        let response: ResourceResponse = parse_response(OUT_SCRIPT, &finished.stdout)?;

        let resource = self
            .store
            .find_resource(run.build.pipeline_id, &put.resource)
            .await?
            .ok_or_else(|| Error::Configuration(format!("unknown resource {}", put.resource)))?;
        let recorded = self
            .store
            .append_version(resource.id, response.version, response.metadata)
            .await?;
        self.store
            .record_build_output(
                run.build.id,
                BuildOutput {
                    name: put.name.clone(),
                    resource_id: resource.id,
                    resource_name: resource.name.clone(),
                    version: recorded.version.clone(),
                    check_order: recorded.check_order,
                    metadata: recorded.metadata,
                },
            )
            .await?;
        info!(
            build_id = %run.build.id,
            resource = %resource.name,
            version = %recorded.version,
            check_order = recorded.check_order,
            "Recorded output version"
        );
        Ok(StepOutcome::Succeeded)
    }
}
