//! Shared setup for the scheduler's unit tests.

use chrono::Utc;
use conveyor_config::system::{EngineConfig, GcConfig, SchedulerConfig};
use conveyor_core::pipeline::{
    GetStep, Job, JobConfig, Pipeline, PipelineConfig, PutStep, Resource, ResourceConfig,
    RunConfig, StepConfig, TaskConfig, TaskStep, VersionPolicy,
};
use conveyor_core::version::{ResourceVersion, Version};
use conveyor_core::worker::{WorkerRegistration, WorkerResourceType};
use conveyor_db::{MemoryStore, PipelineRepo, VersionRepo};
use conveyor_gc::ContainerRegistry;
use conveyor_worker::{InMemoryWorker, StaticConnector, WorkerRegistry};
use std::sync::Arc;
use std::time::Duration;

use crate::check::ResourceChecker;
use crate::engine::ExecutionEngine;
use crate::scheduler::JobScheduler;

pub struct Fixture {
    pub store: Arc<MemoryStore>,
    pub worker: Arc<InMemoryWorker>,
    pub workers: Arc<WorkerRegistry>,
    pub containers: Arc<ContainerRegistry>,
    pub pipeline: Pipeline,
}

impl Fixture {
    pub async fn new(config: PipelineConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let worker = Arc::new(InMemoryWorker::new("w1"));
        let connector = Arc::new(StaticConnector::new());
        connector.insert(worker.clone());
        let workers = Arc::new(WorkerRegistry::new(store.clone(), connector));
        workers
            .register_at(
                WorkerRegistration {
                    name: "w1".to_string(),
                    platform: "linux".to_string(),
                    tags: vec![],
                    resource_types: ["git", "registry-image"]
                        .into_iter()
                        .map(|t| WorkerResourceType {
                            type_name: t.to_string(),
                            image: format!("conveyor/{t}-resource"),
                        })
                        .collect(),
                    address: "memory://w1".to_string(),
                    team: None,
                },
                Duration::from_secs(7 * 24 * 3600),
                Utc::now(),
            )
            .await
            .unwrap();
        let pipeline = store.save_pipeline("main", "ci", &config).await.unwrap();

        Self {
            containers: Arc::new(ContainerRegistry::new(store.clone())),
            store,
            worker,
            workers,
            pipeline,
        }
    }

    pub async fn job(&self, name: &str) -> Job {
        self.store
            .find_job(self.pipeline.id, name)
            .await
            .unwrap()
            .unwrap()
    }

    pub async fn resource(&self, name: &str) -> Resource {
        self.store
            .find_resource(self.pipeline.id, name)
            .await
            .unwrap()
            .unwrap()
    }

    /// Record `ref` as the newest version of `resource`.
    pub async fn version(&self, resource: &str, r: &str) -> ResourceVersion {
        let resource = self.resource(resource).await;
        self.store
            .append_version(resource.id, Version::new([("ref", r)]), vec![])
            .await
            .unwrap()
    }

    pub fn checker(&self) -> Arc<ResourceChecker> {
        Arc::new(ResourceChecker::new(
            self.store.clone(),
            self.workers.clone(),
            self.containers.clone(),
            GcConfig::default().check_container_ttl,
        ))
    }

    pub fn engine(&self) -> Arc<ExecutionEngine> {
        Arc::new(ExecutionEngine::new(
            self.store.clone(),
            self.workers.clone(),
            self.containers.clone(),
            self.checker(),
            EngineConfig {
                max_concurrent_builds: 4,
                claim_interval: Duration::from_millis(10),
                claim_ttl: Duration::from_secs(60),
                abort_poll_interval: Duration::from_millis(10),
            },
        ))
    }

    pub fn scheduler(&self) -> JobScheduler {
        JobScheduler::new(self.store.clone(), SchedulerConfig::default())
    }
}

pub fn resource(name: &str, resource_type: &str) -> ResourceConfig {
    ResourceConfig {
        name: name.to_string(),
        resource_type: resource_type.to_string(),
        source: Default::default(),
        tags: vec![],
    }
}

pub fn job(name: &str, plan: Vec<StepConfig>) -> JobConfig {
    JobConfig {
        name: name.to_string(),
        plan,
        serial: false,
        serial_groups: vec![],
        max_in_flight: None,
    }
}

pub fn get(resource: &str, passed: &[&str]) -> StepConfig {
    StepConfig::Get(GetStep {
        name: resource.to_string(),
        resource: resource.to_string(),
        passed: passed.iter().map(|s| s.to_string()).collect(),
        trigger: true,
        version: VersionPolicy::Latest,
        params: Default::default(),
        tags: vec![],
    })
}

/// A task running `make` in alpine.
pub fn task(name: &str, inputs: &[&str], outputs: &[&str]) -> StepConfig {
    StepConfig::Task(TaskStep {
        name: name.to_string(),
        config: TaskConfig {
            image: "alpine".to_string(),
            run: RunConfig {
                path: "make".to_string(),
                ..Default::default()
            },
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            outputs: outputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        privileged: false,
        tags: vec![],
    })
}

pub fn put(resource: &str, inputs: Option<&[&str]>) -> StepConfig {
    StepConfig::Put(PutStep {
        name: resource.to_string(),
        resource: resource.to_string(),
        params: Default::default(),
        inputs: inputs.map(|i| i.iter().map(|s| s.to_string()).collect()),
        tags: vec![],
    })
}
