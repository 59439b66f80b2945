//! End-to-end scheduling, execution and collection against the in-memory
//! store and worker.

use chrono::Utc;
use conveyor_config::SystemConfig;
use conveyor_core::build::{BuildStatus, LeaseDenial, LeaseScope, Page};
use conveyor_core::container::{ContainerOwner, ContainerScope};
use conveyor_core::pipeline::{
    GetStep, JobConfig, Pipeline, PipelineConfig, ResourceConfig, RunConfig, StepConfig,
    TaskConfig, TaskStep, VersionPolicy,
};
use conveyor_core::version::Version;
use conveyor_core::worker::{WorkerClient, WorkerRegistration, WorkerResourceType};
use conveyor_db::{BuildRepo, MemoryStore, PipelineRepo, VersionRepo};
use conveyor_gc::ContainerRegistry;
use conveyor_scheduler::{ControlPlane, ScheduleOutcome, TriggerOutcome};
use conveyor_worker::{InMemoryWorker, StaticConnector};
use std::sync::Arc;
use std::time::Duration;

struct World {
    plane: Arc<ControlPlane>,
    store: Arc<MemoryStore>,
    worker: Arc<InMemoryWorker>,
}

async fn world() -> World {
    let store = Arc::new(MemoryStore::new());
    let worker = Arc::new(InMemoryWorker::new("w1"));
    let connector = Arc::new(StaticConnector::new());
    connector.insert(worker.clone());
    let plane = Arc::new(ControlPlane::new(
        store.clone(),
        connector,
        &SystemConfig::default(),
    ));
    plane
        .register_worker(
            WorkerRegistration {
                name: "w1".to_string(),
                platform: "linux".to_string(),
                tags: vec![],
                resource_types: vec![WorkerResourceType {
                    type_name: "git".to_string(),
                    image: "conveyor/git-resource".to_string(),
                }],
                address: "memory://w1".to_string(),
                team: None,
            },
            Duration::from_secs(7 * 24 * 3600),
        )
        .await
        .unwrap();
    World {
        plane,
        store,
        worker,
    }
}

fn get(resource: &str, passed: &[&str]) -> StepConfig {
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

fn task(name: &str, inputs: &[&str]) -> StepConfig {
    StepConfig::Task(TaskStep {
        name: name.to_string(),
        config: TaskConfig {
            image: "alpine".to_string(),
            run: RunConfig {
                path: "make".to_string(),
                args: vec![name.to_string()],
                dir: None,
            },
            inputs: inputs.iter().map(|s| s.to_string()).collect(),
            ..Default::default()
        },
        privileged: false,
        tags: vec![],
    })
}

fn job(name: &str, plan: Vec<StepConfig>) -> JobConfig {
    JobConfig {
        name: name.to_string(),
        plan,
        serial: false,
        serial_groups: vec![],
        max_in_flight: None,
    }
}

fn pipeline_config(jobs: Vec<JobConfig>) -> PipelineConfig {
    PipelineConfig {
        resource_types: vec![],
        resources: vec![ResourceConfig {
            name: "x".to_string(),
            resource_type: "git".to_string(),
            source: Default::default(),
            tags: vec![],
        }],
        jobs,
    }
}

impl World {
    async fn pipeline(&self, jobs: Vec<JobConfig>) -> Pipeline {
        self.plane
            .set_pipeline("main", "ci", pipeline_config(jobs))
            .await
            .unwrap()
    }

    async fn version(&self, pipeline: &Pipeline, r: &str) {
        let x = self.store.find_resource(pipeline.id, "x").await.unwrap().unwrap();
        self.store
            .append_version(x.id, Version::new([("ref", r)]), vec![])
            .await
            .unwrap();
    }

    async fn job_id(&self, pipeline: &Pipeline, name: &str) -> conveyor_core::ResourceId {
        self.store
            .find_job(pipeline.id, name)
            .await
            .unwrap()
            .unwrap()
            .id
    }
}

#[tokio::test]
async fn test_single_input_job_builds_once_per_version() {
    let w = world().await;
    let pipeline = w.pipeline(vec![job("j", vec![get("x", &[])])]).await;
    w.version(&pipeline, "v1").await;

    let report = w.plane.scheduler().tick().await.unwrap();
    assert_eq!(report.created, 1);
    let j = w.job_id(&pipeline, "j").await;
    let (builds, _) = w.plane.job_builds(j, Page::default()).await.unwrap();
    assert_eq!(builds.len(), 1);
    assert_eq!(builds[0].inputs.len(), 1);
    assert_eq!(builds[0].inputs[0].version, Version::new([("ref", "v1")]));

    let report = w.plane.scheduler().tick().await.unwrap();
    assert_eq!(report.created, 0);
    let (builds, _) = w.plane.job_builds(j, Page::default()).await.unwrap();
    assert_eq!(builds.len(), 1);
}

#[tokio::test]
async fn test_passed_constraint_waits_for_upstream_success() {
    let w = world().await;
    let pipeline = w
        .pipeline(vec![
            job("j", vec![get("x", &[])]),
            job("j2", vec![get("x", &["j"])]),
        ])
        .await;
    w.version(&pipeline, "v1").await;
    let j = w.job_id(&pipeline, "j").await;
    let j2 = w.job_id(&pipeline, "j2").await;

    assert!(matches!(
        w.plane.schedule_job(j2).await.unwrap(),
        ScheduleOutcome::Unsatisfiable(_)
    ));
    let ScheduleOutcome::Created(upstream) = w.plane.schedule_job(j).await.unwrap() else {
        panic!("expected a build of j");
    };
    assert!(matches!(
        w.plane.schedule_job(j2).await.unwrap(),
        ScheduleOutcome::Unsatisfiable(_)
    ));

    let finished = w.plane.engine().run_pending().await.unwrap();
    assert_eq!(finished, vec![(upstream.id, BuildStatus::Succeeded)]);

    let ScheduleOutcome::Created(build) = w.plane.schedule_job(j2).await.unwrap() else {
        panic!("expected a build of j2");
    };
    assert_eq!(build.inputs[0].version, Version::new([("ref", "v1")]));
    assert_eq!(build.inputs[0].passed.get("j"), Some(&upstream.id));
}

#[tokio::test]
async fn test_destroyed_pipeline_loses_every_container() {
    let w = world().await;
    let mut plan = vec![get("x", &[])];
    plan.extend((1..=6).map(|i| task(&format!("t{i}"), &["x"])));
    let pipeline = w.pipeline(vec![job("j", plan)]).await;
    w.version(&pipeline, "v1").await;
    w.plane.scheduler().tick().await.unwrap();

    let finished = w.plane.engine().run_pending().await.unwrap();
    assert_eq!(finished.len(), 1);
    assert_eq!(finished[0].1, BuildStatus::Succeeded);

    let scope = ContainerScope::Pipeline(pipeline.id);
    let handles: Vec<String> = w
        .plane
        .list_containers(&scope)
        .await
        .unwrap()
        .into_iter()
        .map(|c| c.handle)
        .collect();
    assert_eq!(handles.len(), 7);

    let report = w.plane.destroy_pipeline(pipeline.id).await.unwrap();
    assert!(report.deleted);

    let now = Utc::now();
    w.plane.collector().reconcile_at(now).await.unwrap();
    w.plane.collector().reconcile_at(now).await.unwrap();

    assert!(w.plane.list_containers(&scope).await.unwrap().is_empty());
    let live = w.worker.list_containers().await.unwrap();
    assert!(handles.iter().all(|h| !live.contains(h)));
}

#[tokio::test]
async fn test_serial_job_refuses_second_build_while_started() {
    let w = world().await;
    let mut serial = job("deploy", vec![get("x", &[])]);
    serial.serial = true;
    let pipeline = w.pipeline(vec![serial]).await;
    w.version(&pipeline, "v1").await;
    let deploy = w.job_id(&pipeline, "deploy").await;

    let ScheduleOutcome::Created(first) = w.plane.schedule_job(deploy).await.unwrap() else {
        panic!("expected a build");
    };
    let claim = Utc::now() + chrono::Duration::minutes(5);
    assert!(w.store.start_build(first.id, claim).await.unwrap());

    w.version(&pipeline, "v2").await;
    let other = ControlPlane::new(
        w.store.clone(),
        Arc::new(StaticConnector::new()),
        &SystemConfig::default(),
    );
    let (a, b) = tokio::join!(w.plane.schedule_job(deploy), other.schedule_job(deploy));
    for outcome in [a.unwrap(), b.unwrap()] {
        assert!(matches!(
            outcome,
            ScheduleOutcome::Deferred(LeaseDenial::Held { .. })
        ));
    }
    let (builds, _) = w.plane.job_builds(deploy, Page::default()).await.unwrap();
    assert_eq!(builds.len(), 1);
}

#[tokio::test]
async fn test_serial_group_admits_one_build_across_jobs() {
    let w = world().await;
    let mut a = job("a", vec![get("x", &[])]);
    a.serial_groups = vec!["prod".to_string()];
    let mut b = job("b", vec![get("x", &[])]);
    b.serial_groups = vec!["prod".to_string()];
    b.max_in_flight = Some(3);
    let pipeline = w.pipeline(vec![a, b]).await;
    w.version(&pipeline, "v1").await;
    let a = w.job_id(&pipeline, "a").await;
    let b = w.job_id(&pipeline, "b").await;

    let ScheduleOutcome::Created(first) = w.plane.schedule_job(a).await.unwrap() else {
        panic!("expected a build of a");
    };
    let group_held = |outcome: ScheduleOutcome| match outcome {
        ScheduleOutcome::Deferred(LeaseDenial::Held {
            scope, holders, ..
        }) => {
            assert!(matches!(scope, LeaseScope::SerialGroup { ref group, .. } if group == "prod"));
            assert_eq!(holders, vec![first.id]);
        }
        other => panic!("expected b to wait on the group, got {other:?}"),
    };

    group_held(w.plane.schedule_job(b).await.unwrap());
    let claim = Utc::now() + chrono::Duration::minutes(5);
    assert!(w.store.start_build(first.id, claim).await.unwrap());
    group_held(w.plane.schedule_job(b).await.unwrap());

    assert!(w.store.finish_build(first.id, BuildStatus::Succeeded).await.unwrap());
    assert!(matches!(
        w.plane.schedule_job(b).await.unwrap(),
        ScheduleOutcome::Created(_)
    ));
}

#[tokio::test]
async fn test_abandoned_build_does_not_block_pipeline_destroy() {
    let w = world().await;
    let pipeline = w.pipeline(vec![job("j", vec![get("x", &[])])]).await;
    w.version(&pipeline, "v1").await;
    let j = w.job_id(&pipeline, "j").await;
    let ScheduleOutcome::Created(build) = w.plane.schedule_job(j).await.unwrap() else {
        panic!("expected a build");
    };

    // Claimed by an engine that then went away.
    let now = Utc::now();
    assert!(w.store.start_build(build.id, now + chrono::Duration::minutes(1)).await.unwrap());
    let flagged = w.plane.abort_build(build.id).await.unwrap();
    assert_eq!(flagged.status, BuildStatus::Started);
    let report = w.plane.destroy_pipeline(pipeline.id).await.unwrap();
    assert!(!report.deleted);

    let report = w.plane.collector().reconcile_at(now).await.unwrap();
    assert_eq!(report.pipelines_deleted, 0);

    let later = now + chrono::Duration::days(30);
    let report = w.plane.collector().reconcile_at(later).await.unwrap();
    assert_eq!(report.builds_reaped, 1);
    assert_eq!(report.pipelines_deleted, 1);
    assert!(w.plane.pipeline(pipeline.id).await.is_err());
}

#[tokio::test]
async fn test_max_in_flight_holds_under_concurrent_triggers() {
    let w = world().await;
    let mut limited = job("unit", vec![get("x", &[])]);
    limited.max_in_flight = Some(2);
    let pipeline = w.pipeline(vec![limited]).await;
    w.version(&pipeline, "v1").await;
    let unit = w.job_id(&pipeline, "unit").await;

    let triggers = (0..6).map(|_| {
        let plane = w.plane.clone();
        tokio::spawn(async move { plane.trigger_build(unit).await })
    });
    let mut created = 0;
    for handle in triggers.collect::<Vec<_>>() {
        if let TriggerOutcome::Created { .. } = handle.await.unwrap().unwrap() {
            created += 1;
        }
    }
    assert!(created <= 2);

    let (builds, _) = w.plane.job_builds(unit, Page::default()).await.unwrap();
    let in_flight = builds.iter().filter(|b| !b.status.is_terminal()).count();
    assert!(in_flight <= 2);
    assert_eq!(in_flight, created);
}

#[tokio::test]
async fn test_finished_build_containers_reaped_after_retention() {
    let w = world().await;
    let pipeline = w
        .pipeline(vec![job("j", vec![get("x", &[]), task("t", &["x"])])])
        .await;
    w.version(&pipeline, "v1").await;
    w.plane.scheduler().tick().await.unwrap();
    w.plane.engine().run_pending().await.unwrap();

    let scope = ContainerScope::Pipeline(pipeline.id);
    let now = Utc::now();
    w.plane.collector().reconcile_at(now).await.unwrap();
    assert_eq!(w.plane.list_containers(&scope).await.unwrap().len(), 2);

    let retention = SystemConfig::default().gc.build_retention;
    let later = now + chrono::Duration::from_std(retention).unwrap() + chrono::Duration::minutes(1);
    let report = w.plane.collector().reconcile_at(later).await.unwrap();
    assert_eq!(report.expired_destroyed, 2);
    assert!(w.plane.list_containers(&scope).await.unwrap().is_empty());
    assert!(w.worker.live_handles().is_empty());
}

#[tokio::test]
async fn test_release_and_destroy_are_idempotent() {
    let w = world().await;
    let pipeline = w.pipeline(vec![job("j", vec![get("x", &[])])]).await;
    let x = w.store.find_resource(pipeline.id, "x").await.unwrap().unwrap();
    let registry = ContainerRegistry::new(w.store.clone());
    let owner = ContainerOwner::ResourceCheck { resource_id: x.id };
    registry
        .track(conveyor_core::container::NewContainer {
            worker_name: "w1".to_string(),
            owner: owner.clone(),
            team: "main".to_string(),
            pipeline_id: Some(pipeline.id),
            best_if_used_by: None,
        })
        .await
        .unwrap();

    assert_eq!(registry.release(&owner).await.unwrap(), 1);
    registry.release(&owner).await.unwrap();
    w.worker.destroy_container("never-existed").await.unwrap();
    assert!(w.worker.destroyed().is_empty());
}

#[tokio::test]
async fn test_versions_keep_their_check_order() {
    let w = world().await;
    let pipeline = w.pipeline(vec![job("j", vec![get("x", &[])])]).await;
    for r in ["a", "b", "a", "c"] {
        w.version(&pipeline, r).await;
    }
    let x = w.store.find_resource(pipeline.id, "x").await.unwrap().unwrap();
    let versions = w.store.versions(x.id).await.unwrap();
    let refs: Vec<&str> = versions.iter().filter_map(|v| v.version.get("ref")).collect();
    assert_eq!(refs, vec!["a", "b", "c"]);
    assert!(versions.windows(2).all(|p| p[0].check_order < p[1].check_order));
}
