//! Job scheduler.
//!
//! One pass per job: resolve a consistent set of input versions, apply the
//! trigger policy, expand the plan and ask the store to create the build
//! under the job's concurrency leases. Everything that stops a build from
//! being created is an ordinary outcome; only store faults and broken
//! configuration are errors.

use conveyor_config::system::SchedulerConfig;
use conveyor_core::build::{
    Build, BuildInput, CreateBuildOutcome, LeaseDenial, NewBuild, lease_claims,
};
use conveyor_core::pipeline::Job;
use conveyor_core::{Error, ResourceId, Result};
use conveyor_db::{BuildRepo, PipelineRepo, Store};
use serde::Serialize;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::inputs::InputResolver;
use crate::planner::BuildPlanFactory;

#[derive(Debug, Clone)]
pub enum ScheduleOutcome {
    Created(Build),
    /// Inputs resolved to what the latest build already used.
    UpToDate,
    /// The job or its pipeline is paused, inactive or being destroyed.
    Unschedulable,
    /// No consistent combination of input versions exists yet.
    Unsatisfiable(String),
    /// A concurrency lease is held.
    Deferred(LeaseDenial),
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TriggerOutcome {
    Created { build: Build },
    /// Recorded on the job and fulfilled by a later pass.
    Queued { reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TickReport {
    pub jobs: usize,
    pub created: usize,
    pub deferred: usize,
    pub failed: usize,
}

pub struct JobScheduler {
    store: Arc<dyn Store>,
    resolver: InputResolver,
    config: SchedulerConfig,
}

impl JobScheduler {
    pub fn new(store: Arc<dyn Store>, config: SchedulerConfig) -> Self {
        Self {
            resolver: InputResolver::new(store.clone(), config.resolver_budget),
            store,
            config,
        }
    }

    /// Run one scheduling pass for a job.
    pub async fn schedule(&self, job_id: ResourceId) -> Result<ScheduleOutcome> {
        let job = self.store.get_job(job_id).await?;
        let pipeline = self.store.get_pipeline(job.pipeline_id).await?;
        if !pipeline.is_schedulable() || job.paused || !job.active {
            debug!(job = %job.name, "Job is not schedulable");
            return Ok(ScheduleOutcome::Unschedulable);
        }
        let config = pipeline.config.job(&job.name).ok_or_else(|| {
            Error::Configuration(format!("job {} is missing from its pipeline", job.name))
        })?;

        let inputs = match self.resolver.resolve(&pipeline, config).await {
            Ok(inputs) => inputs,
            Err(Error::Constraint(reason)) => {
                debug!(job = %job.name, reason = %reason, "Inputs not satisfiable");
                return Ok(ScheduleOutcome::Unsatisfiable(reason));
            }
            Err(e) => return Err(e),
        };

        let manual = job.manual_trigger_requested;
        if !manual && !self.should_trigger(&job, &inputs).await? {
            debug!(job = %job.name, "Inputs unchanged");
            return Ok(ScheduleOutcome::UpToDate);
        }

        let plan = BuildPlanFactory::create(&pipeline.config, config, &inputs)?;
        let leases = lease_claims(pipeline.id, job.id, config);
        let outcome = self
            .store
            .create_build(
                NewBuild {
                    pipeline_id: pipeline.id,
                    job_id: job.id,
                    manually_triggered: manual,
                    inputs,
                    plan,
                },
                &leases,
            )
            .await?;

        match outcome {
            CreateBuildOutcome::Created(build) => {
                info!(
                    build_id = %build.id,
                    build = %build.name(),
                    manual,
                    "Build created"
                );
                Ok(ScheduleOutcome::Created(build))
            }
            CreateBuildOutcome::LeaseDenied(denial) => {
                debug!(job = %job.name, denial = %denial, "Build deferred");
                Ok(ScheduleOutcome::Deferred(denial))
            }
        }
    }

    /// Auto-trigger only when a `trigger` input moved since the latest
    /// build. Jobs without trigger inputs only ever run manually.
    async fn should_trigger(&self, job: &Job, inputs: &[BuildInput]) -> Result<bool> {
        let triggers: Vec<&BuildInput> = inputs.iter().filter(|i| i.trigger).collect();
        if triggers.is_empty() {
            return Ok(false);
        }
        let Some(latest) = self.store.latest_build(job.id).await? else {
            return Ok(true);
        };
        Ok(triggers.iter().any(|input| {
            latest
                .input(&input.name)
                .is_none_or(|used| used.version != input.version)
        }))
    }

    /// Request a manual build. The request sticks until a build fulfils it.
    pub async fn trigger(&self, job_id: ResourceId) -> Result<TriggerOutcome> {
        let job = self.store.get_job(job_id).await?;
        let pipeline = self.store.get_pipeline(job.pipeline_id).await?;
        if pipeline.destroying {
            return Err(Error::PipelineDestroyed(format!(
                "{}/{}",
                pipeline.team, pipeline.name
            )));
        }
        self.store.request_manual_trigger(job_id).await?;
        info!(job = %job.name, pipeline = %pipeline.name, "Manual trigger requested");

        let reason = match self.schedule(job_id).await? {
            ScheduleOutcome::Created(build) => return Ok(TriggerOutcome::Created { build }),
            ScheduleOutcome::Unschedulable => "job or pipeline is paused".to_string(),
            ScheduleOutcome::Unsatisfiable(reason) => reason,
            ScheduleOutcome::Deferred(denial) => denial.to_string(),
            ScheduleOutcome::UpToDate => "inputs unchanged".to_string(),
        };
        Ok(TriggerOutcome::Queued { reason })
    }

    /// One pass over every job of every schedulable pipeline.
    pub async fn tick(&self) -> Result<TickReport> {
        let mut report = TickReport::default();
        for pipeline in self.store.list_pipelines().await? {
            if !pipeline.is_schedulable() {
                continue;
            }
            for job in self.store.jobs(pipeline.id).await? {
                report.jobs += 1;
                match self.schedule(job.id).await {
                    Ok(ScheduleOutcome::Created(_)) => report.created += 1,
                    Ok(ScheduleOutcome::Deferred(_)) => report.deferred += 1,
                    Ok(_) => {}
                    Err(e) => {
                        report.failed += 1;
                        warn!(
                            pipeline = %pipeline.name,
                            job = %job.name,
                            error = %e,
                            "Scheduling pass failed"
                        );
                    }
                }
            }
        }
        Ok(report)
    }

    pub async fn run(&self, shutdown: CancellationToken) {
        let interval = self.config.interval;
        info!(interval_secs = interval.as_secs(), "Starting job scheduler");
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => match self.tick().await {
                    Ok(report) if report.created > 0 => info!(?report, "Scheduling pass"),
                    Ok(report) => debug!(?report, "Scheduling pass"),
                    Err(e) => warn!(error = %e, "Scheduling pass failed, retrying next tick"),
                },
            }
        }
        info!("Job scheduler stopped");
    }
}
