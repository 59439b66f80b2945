//! In-memory store.
//!
//! Holds every record behind a single mutex, so each trait method is one
//! atomic step exactly like a transaction in the PostgreSQL store. Used by
//! tests and by servers started without a database URL.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use conveyor_core::ResourceId;
use conveyor_core::build::{
    Build, BuildOutput, BuildStatus, CreateBuildOutcome, LeaseClaim, LeaseDenial, NewBuild, Page,
    Pagination,
};
use conveyor_core::container::{
    Container, ContainerOwner, ContainerScope, ContainerState, NewContainer, TaskCache,
};
use conveyor_core::pipeline::{Job, Pipeline, PipelineConfig, Resource};
use conveyor_core::plan::Plan;
use conveyor_core::version::{MetadataField, ResourceVersion, Version};
use conveyor_core::worker::Worker;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, HashMap};

use crate::repo::build::paginate;
use crate::{
    BuildRepo, ContainerRepo, DbError, DbResult, PipelineRepo, TaskCacheRepo, VersionRepo,
    WorkerRepo,
};

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[derive(Default)]
struct State {
    pipelines: BTreeMap<ResourceId, Pipeline>,
    jobs: BTreeMap<ResourceId, Job>,
    resources: BTreeMap<ResourceId, Resource>,
    versions: HashMap<ResourceId, Vec<ResourceVersion>>,
    builds: BTreeMap<ResourceId, Build>,
    /// Lease scope key to the builds holding it.
    leases: BTreeMap<String, BTreeSet<ResourceId>>,
    workers: BTreeMap<String, Worker>,
    containers: BTreeMap<String, Container>,
    task_caches: BTreeMap<ResourceId, TaskCache>,
}

impl State {
    fn pipeline(&self, id: ResourceId) -> DbResult<&Pipeline> {
        self.pipelines
            .get(&id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))
    }

    fn pipeline_mut(&mut self, id: ResourceId) -> DbResult<&mut Pipeline> {
        self.pipelines
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("pipeline {}", id)))
    }

    fn job_mut(&mut self, id: ResourceId) -> DbResult<&mut Job> {
        self.jobs
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    fn build_mut(&mut self, id: ResourceId) -> DbResult<&mut Build> {
        self.builds
            .get_mut(&id)
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    fn sync_children(&mut self, pipeline_id: ResourceId, config: &PipelineConfig) {
        for job in self.jobs.values_mut().filter(|j| j.pipeline_id == pipeline_id) {
            job.active = config.job(&job.name).is_some();
        }
        for job in &config.jobs {
            let exists = self
                .jobs
                .values()
                .any(|j| j.pipeline_id == pipeline_id && j.name == job.name);
            if !exists {
                let id = ResourceId::new();
                self.jobs.insert(
                    id,
                    Job {
                        id,
                        pipeline_id,
                        name: job.name.clone(),
                        paused: false,
                        active: true,
                        manual_trigger_requested: false,
                    },
                );
            }
        }

        for resource in self
            .resources
            .values_mut()
            .filter(|r| r.pipeline_id == pipeline_id)
        {
            match config.resource(&resource.name) {
                Some(cfg) => {
                    resource.active = true;
                    resource.resource_type = cfg.resource_type.clone();
                }
                None => resource.active = false,
            }
        }
        for resource in &config.resources {
            let exists = self
                .resources
                .values()
                .any(|r| r.pipeline_id == pipeline_id && r.name == resource.name);
            if !exists {
                let id = ResourceId::new();
                self.resources.insert(
                    id,
                    Resource {
                        id,
                        pipeline_id,
                        name: resource.name.clone(),
                        resource_type: resource.resource_type.clone(),
                        active: true,
                    },
                );
            }
        }
    }

    fn lease_holders(&self, key: &str) -> Vec<ResourceId> {
        self.leases
            .get(key)
            .map(|holders| {
                holders
                    .iter()
                    .filter(|id| {
                        self.builds
                            .get(id)
                            .is_some_and(|b| !b.status.is_terminal())
                    })
                    .copied()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn drop_leases(&mut self, build_id: ResourceId) {
        for holders in self.leases.values_mut() {
            holders.remove(&build_id);
        }
        self.leases.retain(|_, holders| !holders.is_empty());
    }

    fn sorted_builds<'a>(&self, builds: impl Iterator<Item = &'a Build>) -> Vec<Build> {
        let mut out: Vec<Build> = builds.cloned().collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        out
    }

    fn job_builds_desc(&self, job_id: ResourceId) -> Vec<Build> {
        let mut out: Vec<Build> = self
            .builds
            .values()
            .filter(|b| b.job_id == Some(job_id))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.sequence.cmp(&a.sequence));
        out
    }
}

fn sorted_by_name<T: Clone>(items: impl Iterator<Item = T>, name: impl Fn(&T) -> &str) -> Vec<T> {
    let mut out: Vec<T> = items.collect();
    out.sort_by(|a, b| name(a).cmp(name(b)));
    out
}

#[async_trait]
impl PipelineRepo for MemoryStore {
    async fn save_pipeline(
        &self,
        team: &str,
        name: &str,
        config: &PipelineConfig,
    ) -> DbResult<Pipeline> {
        let mut state = self.state.lock();
        let now = Utc::now();

        let existing = state
            .pipelines
            .values()
            .find(|p| p.team == team && p.name == name)
            .map(|p| p.id);

        let id = match existing {
            Some(id) => {
                let pipeline = state.pipeline_mut(id)?;
                if pipeline.destroying {
                    return Err(DbError::PipelineDestroyed(format!("{team}/{name}")));
                }
                pipeline.config = config.clone();
                pipeline.config_version += 1;
                pipeline.updated_at = now;
                id
            }
            None => {
                let id = ResourceId::new();
                state.pipelines.insert(
                    id,
                    Pipeline {
                        id,
                        team: team.to_string(),
                        name: name.to_string(),
                        config: config.clone(),
                        config_version: 1,
                        paused: false,
                        destroying: false,
                        created_at: now,
                        updated_at: now,
                    },
                );
                id
            }
        };

        state.sync_children(id, config);
        state.pipeline(id).cloned()
    }

    async fn get_pipeline(&self, id: ResourceId) -> DbResult<Pipeline> {
        self.state.lock().pipeline(id).cloned()
    }

    async fn find_pipeline(&self, team: &str, name: &str) -> DbResult<Option<Pipeline>> {
        Ok(self
            .state
            .lock()
            .pipelines
            .values()
            .find(|p| p.team == team && p.name == name)
            .cloned())
    }

    async fn list_pipelines(&self) -> DbResult<Vec<Pipeline>> {
        let state = self.state.lock();
        let mut out: Vec<Pipeline> = state.pipelines.values().cloned().collect();
        out.sort_by(|a, b| (&a.team, &a.name).cmp(&(&b.team, &b.name)));
        Ok(out)
    }

    async fn set_pipeline_paused(&self, id: ResourceId, paused: bool) -> DbResult<()> {
        let mut state = self.state.lock();
        let pipeline = state.pipeline_mut(id)?;
        pipeline.paused = paused;
        pipeline.updated_at = Utc::now();
        Ok(())
    }

    async fn begin_destroy(&self, id: ResourceId) -> DbResult<Pipeline> {
        let mut state = self.state.lock();
        let pipeline = state.pipeline_mut(id)?;
        pipeline.destroying = true;
        pipeline.updated_at = Utc::now();
        Ok(pipeline.clone())
    }

    async fn delete_pipeline(&self, id: ResourceId) -> DbResult<()> {
        let mut state = self.state.lock();
        state.pipeline(id)?;

        let running = state
            .builds
            .values()
            .any(|b| b.pipeline_id == id && !b.status.is_terminal());
        if running {
            return Err(DbError::Conflict(format!(
                "pipeline {} still has builds in flight",
                id
            )));
        }

        state.pipelines.remove(&id);
        state.jobs.retain(|_, j| j.pipeline_id != id);

        let resources: Vec<ResourceId> = state
            .resources
            .values()
            .filter(|r| r.pipeline_id == id)
            .map(|r| r.id)
            .collect();
        for resource_id in resources {
            state.resources.remove(&resource_id);
            state.versions.remove(&resource_id);
        }

        let builds: Vec<ResourceId> = state
            .builds
            .values()
            .filter(|b| b.pipeline_id == id)
            .map(|b| b.id)
            .collect();
        for build_id in builds {
            state.builds.remove(&build_id);
            state.drop_leases(build_id);
        }

        state.task_caches.retain(|_, c| c.pipeline_id != id);
        Ok(())
    }

    async fn destroying_pipelines(&self) -> DbResult<Vec<Pipeline>> {
        Ok(self
            .state
            .lock()
            .pipelines
            .values()
            .filter(|p| p.destroying)
            .cloned()
            .collect())
    }

    async fn jobs(&self, pipeline_id: ResourceId) -> DbResult<Vec<Job>> {
        let state = self.state.lock();
        Ok(sorted_by_name(
            state
                .jobs
                .values()
                .filter(|j| j.pipeline_id == pipeline_id && j.active)
                .cloned(),
            |j| j.name.as_str(),
        ))
    }

    async fn get_job(&self, id: ResourceId) -> DbResult<Job> {
        self.state
            .lock()
            .jobs
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("job {}", id)))
    }

    async fn find_job(&self, pipeline_id: ResourceId, name: &str) -> DbResult<Option<Job>> {
        Ok(self
            .state
            .lock()
            .jobs
            .values()
            .find(|j| j.pipeline_id == pipeline_id && j.name == name)
            .cloned())
    }

    async fn set_job_paused(&self, id: ResourceId, paused: bool) -> DbResult<()> {
        self.state.lock().job_mut(id)?.paused = paused;
        Ok(())
    }

    async fn request_manual_trigger(&self, id: ResourceId) -> DbResult<()> {
        self.state.lock().job_mut(id)?.manual_trigger_requested = true;
        Ok(())
    }

    async fn resources(&self, pipeline_id: ResourceId) -> DbResult<Vec<Resource>> {
        let state = self.state.lock();
        Ok(sorted_by_name(
            state
                .resources
                .values()
                .filter(|r| r.pipeline_id == pipeline_id && r.active)
                .cloned(),
            |r| r.name.as_str(),
        ))
    }

    async fn get_resource(&self, id: ResourceId) -> DbResult<Resource> {
        self.state
            .lock()
            .resources
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("resource {}", id)))
    }

    async fn find_resource(
        &self,
        pipeline_id: ResourceId,
        name: &str,
    ) -> DbResult<Option<Resource>> {
        Ok(self
            .state
            .lock()
            .resources
            .values()
            .find(|r| r.pipeline_id == pipeline_id && r.name == name)
            .cloned())
    }
}

#[async_trait]
impl VersionRepo for MemoryStore {
    async fn versions(&self, resource_id: ResourceId) -> DbResult<Vec<ResourceVersion>> {
        Ok(self
            .state
            .lock()
            .versions
            .get(&resource_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn append_version(
        &self,
        resource_id: ResourceId,
        version: Version,
        metadata: Vec<MetadataField>,
    ) -> DbResult<ResourceVersion> {
        let mut state = self.state.lock();
        if !state.resources.contains_key(&resource_id) {
            return Err(DbError::NotFound(format!("resource {}", resource_id)));
        }

        let history = state.versions.entry(resource_id).or_default();
        if let Some(existing) = history.iter().find(|v| v.version == version) {
            return Ok(existing.clone());
        }

        let entry = ResourceVersion {
            resource_id,
            version,
            metadata,
            check_order: history.last().map(|v| v.check_order).unwrap_or(0) + 1,
            discovered_at: Utc::now(),
        };
        history.push(entry.clone());
        Ok(entry)
    }

    async fn latest_version(&self, resource_id: ResourceId) -> DbResult<Option<ResourceVersion>> {
        Ok(self
            .state
            .lock()
            .versions
            .get(&resource_id)
            .and_then(|history| history.last().cloned()))
    }
}

#[async_trait]
impl BuildRepo for MemoryStore {
    async fn create_build(
        &self,
        new: NewBuild,
        leases: &[LeaseClaim],
    ) -> DbResult<CreateBuildOutcome> {
        let mut state = self.state.lock();

        let pipeline = state.pipeline(new.pipeline_id)?;
        if pipeline.destroying {
            return Err(DbError::PipelineDestroyed(format!(
                "{}/{}",
                pipeline.team, pipeline.name
            )));
        }
        let team = pipeline.team.clone();
        let pipeline_paused = pipeline.paused;

        let job = state
            .jobs
            .get(&new.job_id)
            .filter(|j| j.pipeline_id == new.pipeline_id)
            .ok_or_else(|| DbError::NotFound(format!("job {}", new.job_id)))?;
        if !job.active || job.paused || pipeline_paused {
            return Ok(CreateBuildOutcome::LeaseDenied(LeaseDenial::Unavailable));
        }
        let job_name = job.name.clone();

        let mut claims = leases.to_vec();
        claims.sort_by(|a, b| a.scope.cmp(&b.scope));
        for claim in &claims {
            let holders = state.lease_holders(&claim.scope.key());
            if holders.len() >= claim.limit as usize {
                return Ok(CreateBuildOutcome::LeaseDenied(LeaseDenial::Held {
                    scope: claim.scope.clone(),
                    limit: claim.limit,
                    holders,
                }));
            }
        }

        let sequence = state
            .builds
            .values()
            .filter(|b| b.job_id == Some(new.job_id))
            .map(|b| b.sequence)
            .max()
            .unwrap_or(0)
            + 1;

        let build = Build {
            id: ResourceId::new(),
            team,
            pipeline_id: new.pipeline_id,
            job_id: Some(new.job_id),
            job_name: Some(job_name),
            sequence,
            status: BuildStatus::Pending,
            manually_triggered: new.manually_triggered,
            inputs: new.inputs,
            outputs: vec![],
            plan: Some(new.plan),
            abort_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            claim_expires_at: None,
        };

        for claim in &claims {
            state
                .leases
                .entry(claim.scope.key())
                .or_default()
                .insert(build.id);
        }
        if new.manually_triggered {
            state.job_mut(new.job_id)?.manual_trigger_requested = false;
        }
        state.builds.insert(build.id, build.clone());
        Ok(CreateBuildOutcome::Created(build))
    }

    async fn create_one_off_build(&self, pipeline_id: ResourceId, plan: Plan) -> DbResult<Build> {
        let mut state = self.state.lock();

        let pipeline = state.pipeline(pipeline_id)?;
        if pipeline.destroying {
            return Err(DbError::PipelineDestroyed(format!(
                "{}/{}",
                pipeline.team, pipeline.name
            )));
        }
        let team = pipeline.team.clone();

        let sequence = state
            .builds
            .values()
            .filter(|b| b.pipeline_id == pipeline_id && b.job_id.is_none())
            .map(|b| b.sequence)
            .max()
            .unwrap_or(0)
            + 1;

        let build = Build {
            id: ResourceId::new(),
            team,
            pipeline_id,
            job_id: None,
            job_name: None,
            sequence,
            status: BuildStatus::Pending,
            manually_triggered: true,
            inputs: vec![],
            outputs: vec![],
            plan: Some(plan),
            abort_requested: false,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            claim_expires_at: None,
        };
        state.builds.insert(build.id, build.clone());
        Ok(build)
    }

    async fn get_build(&self, id: ResourceId) -> DbResult<Build> {
        self.state
            .lock()
            .builds
            .get(&id)
            .cloned()
            .ok_or_else(|| DbError::NotFound(format!("build {}", id)))
    }

    async fn find_build(&self, id: ResourceId) -> DbResult<Option<Build>> {
        Ok(self.state.lock().builds.get(&id).cloned())
    }

    async fn job_builds(
        &self,
        job_id: ResourceId,
        page: Page,
    ) -> DbResult<(Vec<Build>, Pagination)> {
        let builds = self.state.lock().job_builds_desc(job_id);
        Ok(paginate(builds, page))
    }

    async fn latest_build(&self, job_id: ResourceId) -> DbResult<Option<Build>> {
        Ok(self.state.lock().job_builds_desc(job_id).into_iter().next())
    }

    async fn successful_builds(&self, job_id: ResourceId) -> DbResult<Vec<Build>> {
        Ok(self
            .state
            .lock()
            .job_builds_desc(job_id)
            .into_iter()
            .filter(|b| b.status == BuildStatus::Succeeded)
            .collect())
    }

    async fn pending_builds(&self) -> DbResult<Vec<Build>> {
        let state = self.state.lock();
        Ok(state.sorted_builds(
            state
                .builds
                .values()
                .filter(|b| b.status == BuildStatus::Pending),
        ))
    }

    async fn start_build(&self, id: ResourceId, claim_until: DateTime<Utc>) -> DbResult<bool> {
        let mut state = self.state.lock();
        let build = state.build_mut(id)?;
        if build.status != BuildStatus::Pending {
            return Ok(false);
        }
        build.status = BuildStatus::Started;
        build.started_at = Some(Utc::now());
        build.claim_expires_at = Some(claim_until);
        Ok(true)
    }

    async fn renew_build_claim(&self, id: ResourceId, until: DateTime<Utc>) -> DbResult<bool> {
        let mut state = self.state.lock();
        let build = state.build_mut(id)?;
        if build.status != BuildStatus::Started {
            return Ok(false);
        }
        build.claim_expires_at = Some(until);
        Ok(true)
    }

    async fn expired_build_claims(&self, now: DateTime<Utc>) -> DbResult<Vec<Build>> {
        let state = self.state.lock();
        Ok(state.sorted_builds(state.builds.values().filter(|b| b.claim_expired(now))))
    }

    async fn finish_build(&self, id: ResourceId, status: BuildStatus) -> DbResult<bool> {
        if !status.is_terminal() {
            return Err(DbError::Conflict(format!(
                "cannot finish build {} as {}",
                id, status
            )));
        }
        let mut state = self.state.lock();
        let build = state.build_mut(id)?;
        if !build.status.can_transition_to(status) {
            return Ok(false);
        }
        build.status = status;
        build.finished_at = Some(Utc::now());
        build.claim_expires_at = None;
        state.drop_leases(id);
        Ok(true)
    }

    async fn request_abort(&self, id: ResourceId) -> DbResult<Build> {
        let mut state = self.state.lock();
        let build = state.build_mut(id)?;
        let status = build.status;
        match status {
            BuildStatus::Pending => {
                build.status = BuildStatus::Aborted;
                build.abort_requested = true;
                build.finished_at = Some(Utc::now());
                let build = build.clone();
                state.drop_leases(id);
                Ok(build)
            }
            BuildStatus::Started => {
                build.abort_requested = true;
                Ok(build.clone())
            }
            _ => Ok(build.clone()),
        }
    }

    async fn abort_requested(&self, id: ResourceId) -> DbResult<bool> {
        Ok(self.state.lock().build_mut(id)?.abort_requested)
    }

    async fn in_flight_builds(&self, pipeline_id: ResourceId) -> DbResult<Vec<Build>> {
        let state = self.state.lock();
        Ok(state.sorted_builds(
            state
                .builds
                .values()
                .filter(|b| b.pipeline_id == pipeline_id && !b.status.is_terminal()),
        ))
    }

    async fn record_build_output(&self, id: ResourceId, output: BuildOutput) -> DbResult<()> {
        self.state.lock().build_mut(id)?.outputs.push(output);
        Ok(())
    }
}

#[async_trait]
impl WorkerRepo for MemoryStore {
    async fn save_worker(&self, worker: Worker) -> DbResult<Worker> {
        let mut state = self.state.lock();
        let saved = match state.workers.get(&worker.name) {
            Some(existing) => Worker {
                registered_at: existing.registered_at,
                ..worker
            },
            None => worker,
        };
        state.workers.insert(saved.name.clone(), saved.clone());
        Ok(saved)
    }

    async fn heartbeat_worker(&self, name: &str, now: DateTime<Utc>) -> DbResult<Worker> {
        let mut state = self.state.lock();
        let worker = state
            .workers
            .get_mut(name)
            .ok_or_else(|| DbError::NotFound(format!("worker {}", name)))?;
        worker.heartbeat_at = now;
        worker.expires_at = now + chrono::Duration::seconds(worker.ttl_secs as i64);
        Ok(worker.clone())
    }

    async fn list_workers(&self) -> DbResult<Vec<Worker>> {
        Ok(self.state.lock().workers.values().cloned().collect())
    }

    async fn get_worker(&self, name: &str) -> DbResult<Worker> {
        self.find_worker(name)
            .await?
            .ok_or_else(|| DbError::NotFound(format!("worker {}", name)))
    }

    async fn find_worker(&self, name: &str) -> DbResult<Option<Worker>> {
        Ok(self.state.lock().workers.get(name).cloned())
    }

    async fn delete_worker(&self, name: &str) -> DbResult<()> {
        let mut state = self.state.lock();
        state.workers.remove(name);
        state.containers.retain(|_, c| c.worker_name != name);
        Ok(())
    }

    async fn prune_expired_workers(&self, before: DateTime<Utc>) -> DbResult<Vec<String>> {
        let mut state = self.state.lock();
        let expired: Vec<String> = state
            .workers
            .values()
            .filter(|w| w.expires_at < before)
            .map(|w| w.name.clone())
            .collect();
        for name in &expired {
            state.workers.remove(name);
            state.containers.retain(|_, c| &c.worker_name != name);
        }
        Ok(expired)
    }
}

#[async_trait]
impl ContainerRepo for MemoryStore {
    async fn create_container(&self, handle: &str, new: NewContainer) -> DbResult<Container> {
        let mut state = self.state.lock();

        if !state.workers.contains_key(&new.worker_name) {
            return Err(DbError::NotFound(format!("worker {}", new.worker_name)));
        }
        if state.containers.contains_key(handle) {
            return Err(DbError::Duplicate(format!("container {}", handle)));
        }
        if let Some(pipeline_id) = new.pipeline_id {
            if state
                .pipelines
                .get(&pipeline_id)
                .is_none_or(|p| p.destroying)
            {
                return Err(DbError::PipelineDestroyed(pipeline_id.to_string()));
            }
        }
        if let Some(build_id) = new.owner.build_id() {
            let build = state
                .builds
                .get(&build_id)
                .ok_or_else(|| DbError::NotFound(format!("build {}", build_id)))?;
            if build.status.is_terminal() {
                return Err(DbError::Conflict(format!(
                    "build {} is already {}",
                    build_id, build.status
                )));
            }
        }

        let container = Container {
            handle: handle.to_string(),
            worker_name: new.worker_name,
            owner: new.owner,
            state: ContainerState::Creating,
            team: new.team,
            pipeline_id: new.pipeline_id,
            created_at: Utc::now(),
            best_if_used_by: new.best_if_used_by,
            released_at: None,
        };
        state
            .containers
            .insert(container.handle.clone(), container.clone());
        Ok(container)
    }

    async fn mark_container_created(&self, handle: &str) -> DbResult<()> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(handle)
            .ok_or_else(|| DbError::NotFound(format!("container {}", handle)))?;
        container.state = ContainerState::Created;
        Ok(())
    }

    async fn extend_container_expiry(&self, handle: &str, until: DateTime<Utc>) -> DbResult<()> {
        let mut state = self.state.lock();
        let container = state
            .containers
            .get_mut(handle)
            .ok_or_else(|| DbError::NotFound(format!("container {}", handle)))?;
        if let Some(current) = container.best_if_used_by {
            container.best_if_used_by = Some(current.max(until));
        }
        Ok(())
    }

    async fn find_container(&self, handle: &str) -> DbResult<Option<Container>> {
        Ok(self.state.lock().containers.get(handle).cloned())
    }

    async fn release_containers(&self, owner: &ContainerOwner) -> DbResult<u64> {
        let now = Utc::now();
        let mut released = 0;
        for container in self
            .state
            .lock()
            .containers
            .values_mut()
            .filter(|c| &c.owner == owner && c.released_at.is_none())
        {
            container.released_at = Some(now);
            released += 1;
        }
        Ok(released)
    }

    async fn release_pipeline_containers(&self, pipeline_id: ResourceId) -> DbResult<u64> {
        let now = Utc::now();
        let mut released = 0;
        for container in self
            .state
            .lock()
            .containers
            .values_mut()
            .filter(|c| c.pipeline_id == Some(pipeline_id) && c.released_at.is_none())
        {
            container.released_at = Some(now);
            released += 1;
        }
        Ok(released)
    }

    async fn containers_on_worker(&self, worker_name: &str) -> DbResult<Vec<Container>> {
        self.list_containers(&ContainerScope::Worker(worker_name.to_string()))
            .await
    }

    async fn list_containers(&self, scope: &ContainerScope) -> DbResult<Vec<Container>> {
        let mut out: Vec<Container> = self
            .state
            .lock()
            .containers
            .values()
            .filter(|c| scope.matches(c))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.handle.cmp(&b.handle)));
        Ok(out)
    }

    async fn containers_for_owner(&self, owner: &ContainerOwner) -> DbResult<Vec<Container>> {
        let mut out: Vec<Container> = self
            .state
            .lock()
            .containers
            .values()
            .filter(|c| &c.owner == owner)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.handle.cmp(&b.handle)));
        Ok(out)
    }

    async fn container_counts(&self) -> DbResult<BTreeMap<String, usize>> {
        let mut counts = BTreeMap::new();
        for container in self
            .state
            .lock()
            .containers
            .values()
            .filter(|c| !c.is_released())
        {
            *counts.entry(container.worker_name.clone()).or_default() += 1;
        }
        Ok(counts)
    }

    async fn delete_container(&self, handle: &str) -> DbResult<()> {
        self.state.lock().containers.remove(handle);
        Ok(())
    }
}

#[async_trait]
impl TaskCacheRepo for MemoryStore {
    async fn find_or_create_task_cache(
        &self,
        pipeline_id: ResourceId,
        job_id: ResourceId,
        step_name: &str,
        path: &str,
    ) -> DbResult<TaskCache> {
        let mut state = self.state.lock();
        if let Some(cache) = state
            .task_caches
            .values()
            .find(|c| c.job_id == job_id && c.step_name == step_name && c.path == path)
        {
            return Ok(cache.clone());
        }
        if !state.jobs.contains_key(&job_id) {
            return Err(DbError::NotFound(format!("job {}", job_id)));
        }

        let cache = TaskCache {
            id: ResourceId::new(),
            pipeline_id,
            job_id,
            step_name: step_name.to_string(),
            path: path.to_string(),
            created_at: Utc::now(),
        };
        state.task_caches.insert(cache.id, cache.clone());
        Ok(cache)
    }

    async fn find_task_cache(&self, id: ResourceId) -> DbResult<Option<TaskCache>> {
        Ok(self.state.lock().task_caches.get(&id).cloned())
    }

    async fn clear_task_caches(
        &self,
        job_id: ResourceId,
        step_name: &str,
        path: Option<&str>,
    ) -> DbResult<u64> {
        let mut state = self.state.lock();
        let before = state.task_caches.len();
        state.task_caches.retain(|_, c| {
            !(c.job_id == job_id
                && c.step_name == step_name
                && path.is_none_or(|p| c.path == p))
        });
        Ok((before - state.task_caches.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::build::lease_claims;
    use conveyor_core::pipeline::{GetStep, JobConfig, ResourceConfig, StepConfig, VersionPolicy};
    use conveyor_core::plan::{PlanId, PlanStep};
    use conveyor_core::worker::WorkerRegistration;

    fn claim() -> DateTime<Utc> {
        Utc::now() + chrono::Duration::minutes(5)
    }

    fn config(serial: bool, max_in_flight: Option<u32>) -> PipelineConfig {
        PipelineConfig {
            resource_types: vec![],
            resources: vec![ResourceConfig {
                name: "repo".to_string(),
                resource_type: "git".to_string(),
                source: Default::default(),
                tags: vec![],
            }],
            jobs: vec![JobConfig {
                name: "unit".to_string(),
                plan: vec![StepConfig::Get(GetStep {
                    name: "repo".to_string(),
                    resource: "repo".to_string(),
                    passed: vec![],
                    trigger: true,
                    version: VersionPolicy::Latest,
                    params: Default::default(),
                    tags: vec![],
                })],
                serial,
                serial_groups: vec![],
                max_in_flight,
            }],
        }
    }

    fn empty_plan() -> Plan {
        Plan {
            id: PlanId(1),
            step: PlanStep::Do { steps: vec![] },
        }
    }

    async fn setup(store: &MemoryStore, cfg: PipelineConfig) -> (Pipeline, Job) {
        let pipeline = store.save_pipeline("main", "app", &cfg).await.unwrap();
        let job = store.find_job(pipeline.id, "unit").await.unwrap().unwrap();
        (pipeline, job)
    }

    async fn try_create(
        store: &MemoryStore,
        pipeline: &Pipeline,
        job: &Job,
        manual: bool,
    ) -> CreateBuildOutcome {
        let job_config = pipeline.config.job(&job.name).unwrap();
        let claims = lease_claims(pipeline.id, job.id, job_config);
        store
            .create_build(
                NewBuild {
                    pipeline_id: pipeline.id,
                    job_id: job.id,
                    manually_triggered: manual,
                    inputs: vec![],
                    plan: empty_plan(),
                },
                &claims,
            )
            .await
            .unwrap()
    }

    fn created(outcome: CreateBuildOutcome) -> Build {
        match outcome {
            CreateBuildOutcome::Created(build) => build,
            CreateBuildOutcome::LeaseDenied(denial) => panic!("lease denied: {denial}"),
        }
    }

    async fn add_worker(store: &MemoryStore, name: &str) {
        let worker = Worker::from_registration(
            WorkerRegistration {
                name: name.to_string(),
                platform: "linux".to_string(),
                tags: vec![],
                resource_types: vec![],
                address: format!("memory://{name}"),
                team: None,
            },
            std::time::Duration::from_secs(30),
            Utc::now(),
        );
        store.save_worker(worker).await.unwrap();
    }

    #[tokio::test]
    async fn test_save_pipeline_syncs_jobs_and_resources() {
        let store = MemoryStore::new();
        let (pipeline, _) = setup(&store, config(false, None)).await;
        assert_eq!(pipeline.config_version, 1);
        assert_eq!(store.resources(pipeline.id).await.unwrap().len(), 1);

        let mut cfg = config(false, None);
        cfg.jobs[0].name = "lint".to_string();
        let updated = store.save_pipeline("main", "app", &cfg).await.unwrap();
        assert_eq!(updated.id, pipeline.id);
        assert_eq!(updated.config_version, 2);

        let jobs = store.jobs(pipeline.id).await.unwrap();
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].name, "lint");
        let old = store.find_job(pipeline.id, "unit").await.unwrap().unwrap();
        assert!(!old.active);
    }

    #[tokio::test]
    async fn test_append_version_is_ordered_and_idempotent() {
        let store = MemoryStore::new();
        let (pipeline, _) = setup(&store, config(false, None)).await;
        let repo = store.find_resource(pipeline.id, "repo").await.unwrap().unwrap();

        let v1 = store
            .append_version(repo.id, Version::new([("ref", "a")]), vec![])
            .await
            .unwrap();
        let v2 = store
            .append_version(repo.id, Version::new([("ref", "b")]), vec![])
            .await
            .unwrap();
        let again = store
            .append_version(repo.id, Version::new([("ref", "a")]), vec![])
            .await
            .unwrap();

        assert_eq!(v1.check_order, 1);
        assert_eq!(v2.check_order, 2);
        assert_eq!(again.check_order, 1);
        let orders: Vec<u64> = store
            .versions(repo.id)
            .await
            .unwrap()
            .iter()
            .map(|v| v.check_order)
            .collect();
        assert_eq!(orders, vec![1, 2]);
        assert_eq!(
            store.latest_version(repo.id).await.unwrap().unwrap().check_order,
            2
        );
    }

    #[tokio::test]
    async fn test_serial_job_lease() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(true, None)).await;

        let first = created(try_create(&store, &pipeline, &job, false).await);
        assert_eq!(first.sequence, 1);
        assert!(store.start_build(first.id, claim()).await.unwrap());

        match try_create(&store, &pipeline, &job, false).await {
            CreateBuildOutcome::LeaseDenied(LeaseDenial::Held { holders, limit, .. }) => {
                assert_eq!(limit, 1);
                assert_eq!(holders, vec![first.id]);
            }
            other => panic!("expected lease denial, got {other:?}"),
        }

        assert!(store.finish_build(first.id, BuildStatus::Succeeded).await.unwrap());
        let second = created(try_create(&store, &pipeline, &job, false).await);
        assert_eq!(second.sequence, 2);
    }

    #[tokio::test]
    async fn test_max_in_flight_lease() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(false, Some(2))).await;

        let a = created(try_create(&store, &pipeline, &job, false).await);
        created(try_create(&store, &pipeline, &job, false).await);
        assert!(matches!(
            try_create(&store, &pipeline, &job, false).await,
            CreateBuildOutcome::LeaseDenied(_)
        ));

        // Aborting a pending build frees its lease at once.
        let aborted = store.request_abort(a.id).await.unwrap();
        assert_eq!(aborted.status, BuildStatus::Aborted);
        created(try_create(&store, &pipeline, &job, false).await);
    }

    #[tokio::test]
    async fn test_paused_job_is_unavailable() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(false, None)).await;
        store.set_job_paused(job.id, true).await.unwrap();
        assert!(matches!(
            try_create(&store, &pipeline, &job, false).await,
            CreateBuildOutcome::LeaseDenied(LeaseDenial::Unavailable)
        ));
    }

    #[tokio::test]
    async fn test_manual_build_consumes_trigger_request() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(false, None)).await;
        store.request_manual_trigger(job.id).await.unwrap();
        assert!(store.get_job(job.id).await.unwrap().manual_trigger_requested);

        created(try_create(&store, &pipeline, &job, true).await);
        assert!(!store.get_job(job.id).await.unwrap().manual_trigger_requested);
    }

    #[tokio::test]
    async fn test_build_state_machine_is_enforced() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(false, None)).await;
        let build = created(try_create(&store, &pipeline, &job, false).await);

        assert!(!store.finish_build(build.id, BuildStatus::Succeeded).await.unwrap());
        assert!(store.start_build(build.id, claim()).await.unwrap());
        assert!(!store.start_build(build.id, claim()).await.unwrap());

        let flagged = store.request_abort(build.id).await.unwrap();
        assert_eq!(flagged.status, BuildStatus::Started);
        assert!(store.abort_requested(build.id).await.unwrap());

        assert!(store.finish_build(build.id, BuildStatus::Aborted).await.unwrap());
        assert!(!store.finish_build(build.id, BuildStatus::Failed).await.unwrap());
        assert!(store.finish_build(build.id, BuildStatus::Started).await.is_err());
    }

    #[tokio::test]
    async fn test_build_claim_renewal_and_expiry() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(false, None)).await;
        let build = created(try_create(&store, &pipeline, &job, false).await);
        let now = Utc::now();

        assert!(!store.renew_build_claim(build.id, now).await.unwrap());
        let until = now + chrono::Duration::seconds(30);
        assert!(store.start_build(build.id, until).await.unwrap());
        assert!(store.expired_build_claims(now).await.unwrap().is_empty());

        let later = now + chrono::Duration::seconds(31);
        let expired = store.expired_build_claims(later).await.unwrap();
        assert_eq!(expired.len(), 1);
        assert_eq!(expired[0].id, build.id);

        let renewed = later + chrono::Duration::seconds(30);
        assert!(store.renew_build_claim(build.id, renewed).await.unwrap());
        assert!(store.expired_build_claims(later).await.unwrap().is_empty());

        store.finish_build(build.id, BuildStatus::Errored).await.unwrap();
        assert!(!store.renew_build_claim(build.id, later).await.unwrap());
        let finished = store.get_build(build.id).await.unwrap();
        assert!(finished.claim_expires_at.is_none());
        let much_later = later + chrono::Duration::days(1);
        assert!(store.expired_build_claims(much_later).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_destroying_pipeline_refuses_new_work() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(false, None)).await;
        add_worker(&store, "w1").await;
        let build = created(try_create(&store, &pipeline, &job, false).await);

        store.begin_destroy(pipeline.id).await.unwrap();

        let job_config = pipeline.config.job("unit").unwrap();
        let err = store
            .create_build(
                NewBuild {
                    pipeline_id: pipeline.id,
                    job_id: job.id,
                    manually_triggered: false,
                    inputs: vec![],
                    plan: empty_plan(),
                },
                &lease_claims(pipeline.id, job.id, job_config),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PipelineDestroyed(_)));

        let err = store
            .create_container(
                "h1",
                NewContainer {
                    worker_name: "w1".to_string(),
                    owner: ContainerOwner::BuildStep {
                        build_id: build.id,
                        plan_id: PlanId(1),
                        step: "repo".to_string(),
                    },
                    team: "main".to_string(),
                    pipeline_id: Some(pipeline.id),
                    best_if_used_by: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::PipelineDestroyed(_)));

        // Deletion waits for in-flight builds.
        assert!(matches!(
            store.delete_pipeline(pipeline.id).await.unwrap_err(),
            DbError::Conflict(_)
        ));
        store.request_abort(build.id).await.unwrap();
        store.delete_pipeline(pipeline.id).await.unwrap();
        assert!(store.find_build(build.id).await.unwrap().is_none());
        assert!(store.find_job(pipeline.id, "unit").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_container_lifecycle_and_release_idempotence() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(false, None)).await;
        add_worker(&store, "w1").await;
        let build = created(try_create(&store, &pipeline, &job, false).await);
        let owner = ContainerOwner::BuildStep {
            build_id: build.id,
            plan_id: PlanId(1),
            step: "repo".to_string(),
        };

        let container = store
            .create_container(
                "h1",
                NewContainer {
                    worker_name: "w1".to_string(),
                    owner: owner.clone(),
                    team: "main".to_string(),
                    pipeline_id: Some(pipeline.id),
                    best_if_used_by: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(container.state, ContainerState::Creating);
        store.mark_container_created("h1").await.unwrap();
        assert_eq!(store.container_counts().await.unwrap()["w1"], 1);

        assert_eq!(store.release_containers(&owner).await.unwrap(), 1);
        assert_eq!(store.release_containers(&owner).await.unwrap(), 0);
        assert!(store.container_counts().await.unwrap().is_empty());

        let listed = store
            .list_containers(&ContainerScope::Pipeline(pipeline.id))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed[0].is_released());

        // A finished build may not gain new containers.
        store.start_build(build.id, claim()).await.unwrap();
        store.finish_build(build.id, BuildStatus::Succeeded).await.unwrap();
        let err = store
            .create_container(
                "h2",
                NewContainer {
                    worker_name: "w1".to_string(),
                    owner,
                    team: "main".to_string(),
                    pipeline_id: Some(pipeline.id),
                    best_if_used_by: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, DbError::Conflict(_)));

        store.delete_worker("w1").await.unwrap();
        assert!(store.find_container("h1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_job_builds_pagination() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(false, None)).await;
        for _ in 0..5 {
            let build = created(try_create(&store, &pipeline, &job, false).await);
            store.request_abort(build.id).await.unwrap();
        }

        let (page, pagination) = store
            .job_builds(job.id, Page { limit: 2, ..Page::default() })
            .await
            .unwrap();
        let seqs: Vec<u64> = page.iter().map(|b| b.sequence).collect();
        assert_eq!(seqs, vec![5, 4]);
        let next = pagination.next.unwrap();

        let (page, _) = store.job_builds(job.id, next).await.unwrap();
        let seqs: Vec<u64> = page.iter().map(|b| b.sequence).collect();
        assert_eq!(seqs, vec![3, 2]);

        assert_eq!(store.latest_build(job.id).await.unwrap().unwrap().sequence, 5);
    }

    #[tokio::test]
    async fn test_task_caches() {
        let store = MemoryStore::new();
        let (pipeline, job) = setup(&store, config(false, None)).await;

        let a = store
            .find_or_create_task_cache(pipeline.id, job.id, "test", "target")
            .await
            .unwrap();
        let again = store
            .find_or_create_task_cache(pipeline.id, job.id, "test", "target")
            .await
            .unwrap();
        assert_eq!(a.id, again.id);
        store
            .find_or_create_task_cache(pipeline.id, job.id, "test", "deps")
            .await
            .unwrap();

        assert_eq!(
            store
                .clear_task_caches(job.id, "test", Some("target"))
                .await
                .unwrap(),
            1
        );
        assert_eq!(store.clear_task_caches(job.id, "test", None).await.unwrap(), 1);
        assert!(store.find_task_cache(a.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_worker_heartbeat_and_prune() {
        let store = MemoryStore::new();
        add_worker(&store, "w1").await;
        let later = Utc::now() + chrono::Duration::seconds(60);

        let worker = store.heartbeat_worker("w1", later).await.unwrap();
        assert_eq!(worker.expires_at, later + chrono::Duration::seconds(30));

        let pruned = store
            .prune_expired_workers(later + chrono::Duration::seconds(31))
            .await
            .unwrap();
        assert_eq!(pruned, vec!["w1".to_string()]);
        assert!(store.find_worker("w1").await.unwrap().is_none());
        assert!(store.heartbeat_worker("w1", later).await.is_err());
    }
}
