//! Input resolution.
//!
//! Picks one version per `get` input such that every `passed` constraint is
//! met by a single successful build of each upstream job. Inputs are visited
//! in declaration order and versions latest-first; the first complete
//! assignment wins, so the same version history always yields the same
//! answer.

use conveyor_core::build::{Build, BuildInput};
use conveyor_core::pipeline::{GetStep, JobConfig, Pipeline, Resource, VersionPolicy};
use conveyor_core::version::{ResourceVersion, Version};
use conveyor_core::{Error, ResourceId, Result};
use conveyor_db::{BuildRepo, PipelineRepo, Store, VersionRepo};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

pub struct InputResolver {
    store: Arc<dyn Store>,
    budget: u64,
}

impl InputResolver {
    pub fn new(store: Arc<dyn Store>, budget: u64) -> Self {
        Self { store, budget }
    }

    /// Resolve the inputs of `job`.
    ///
    /// Fails with `Configuration` when the job names a resource or upstream
    /// job the pipeline lacks, and with `Constraint` when no combination of
    /// recorded versions satisfies it.
    pub async fn resolve(&self, pipeline: &Pipeline, job: &JobConfig) -> Result<Vec<BuildInput>> {
        let space = self.load(pipeline, job).await?;
        let mut search = Search {
            space: &space,
            visits_left: self.budget,
        };
        let mut chosen = Vec::with_capacity(space.inputs.len());
        let mut bound = BTreeMap::new();
        if search.assign(0, &mut chosen, &mut bound)? {
            debug!(
                job = %job.name,
                visits = self.budget - search.visits_left,
                "Resolved inputs"
            );
            Ok(chosen)
        } else {
            Err(Error::Constraint(format!(
                "no version combination satisfies job {}",
                job.name
            )))
        }
    }

    async fn load<'a>(&self, pipeline: &Pipeline, job: &'a JobConfig) -> Result<Space<'a>> {
        let mut inputs = Vec::new();
        let mut upstream = BTreeMap::new();

        for get in job.inputs() {
            let resource = self
                .store
                .find_resource(pipeline.id, &get.resource)
                .await?
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "job {} gets unknown resource {}",
                        job.name, get.resource
                    ))
                })?;

            let mut versions = self.store.versions(resource.id).await?;
            versions.reverse();
            if let VersionPolicy::Pinned(pinned) = &get.version {
                versions.retain(|v| matches_pin(&v.version, pinned));
            }
            if versions.is_empty() {
                return Err(Error::Constraint(format!(
                    "no usable version of {} for input {}",
                    get.resource, get.name
                )));
            }

            for name in &get.passed {
                if upstream.contains_key(name) {
                    continue;
                }
                let upstream_job = self
                    .store
                    .find_job(pipeline.id, name)
                    .await?
                    .filter(|j| j.active)
                    .ok_or_else(|| {
                        Error::Configuration(format!(
                            "input {} of job {} passes unknown job {}",
                            get.name, job.name, name
                        ))
                    })?;
                let builds = self.store.successful_builds(upstream_job.id).await?;
                upstream.insert(name.clone(), builds);
            }

            inputs.push(Candidates {
                get,
                resource,
                versions,
            });
        }

        Ok(Space { inputs, upstream })
    }
}

/// A pinned version matches every version carrying all of its fields.
fn matches_pin(version: &Version, pinned: &Version) -> bool {
    pinned
        .as_map()
        .iter()
        .all(|(k, v)| version.get(k) == Some(v.as_str()))
}

/// Whether a build consumed or produced `version` of a resource.
fn carries(build: &Build, resource_id: ResourceId, version: &Version) -> bool {
    build
        .inputs
        .iter()
        .any(|i| i.resource_id == resource_id && i.version == *version)
        || build
            .outputs
            .iter()
            .any(|o| o.resource_id == resource_id && o.version == *version)
}

struct Candidates<'a> {
    get: &'a GetStep,
    resource: Resource,
    /// Latest first.
    versions: Vec<ResourceVersion>,
}

struct Space<'a> {
    inputs: Vec<Candidates<'a>>,
    /// Successful builds per upstream job, newest first.
    upstream: BTreeMap<String, Vec<Build>>,
}

struct Search<'s> {
    space: &'s Space<'s>,
    visits_left: u64,
}

impl<'s> Search<'s> {
    fn visit(&mut self) -> Result<()> {
        if self.visits_left == 0 {
            return Err(Error::Constraint(
                "input resolution exceeded its search budget".to_string(),
            ));
        }
        self.visits_left -= 1;
        Ok(())
    }

    /// Try to extend `chosen` with input `index` and everything after it.
    fn assign(
        &mut self,
        index: usize,
        chosen: &mut Vec<BuildInput>,
        bound: &mut BTreeMap<&'s str, &'s Build>,
    ) -> Result<bool> {
        let space = self.space;
        let Some(input) = space.inputs.get(index) else {
            return Ok(true);
        };

        for candidate in &input.versions {
            self.visit()?;
            // An upstream job already bound by an earlier input fixes the
            // version this input may use.
            let consistent = input
                .get
                .passed
                .iter()
                .filter_map(|job| bound.get(job.as_str()))
                .all(|build| carries(build, input.resource.id, &candidate.version));
            if !consistent {
                continue;
            }

            let unbound: Vec<&'s str> = input
                .get
                .passed
                .iter()
                .map(String::as_str)
                .filter(|job| !bound.contains_key(job))
                .collect();
            if self.bind(index, candidate, &unbound, chosen, bound)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Bind each of `unbound` to a build carrying `candidate`, then move on
    /// to the next input.
    fn bind(
        &mut self,
        index: usize,
        candidate: &'s ResourceVersion,
        unbound: &[&'s str],
        chosen: &mut Vec<BuildInput>,
        bound: &mut BTreeMap<&'s str, &'s Build>,
    ) -> Result<bool> {
        let space = self.space;
        let input = &space.inputs[index];

        let Some((&job, rest)) = unbound.split_first() else {
            chosen.push(BuildInput {
                name: input.get.name.clone(),
                resource_id: input.resource.id,
                resource_name: input.resource.name.clone(),
                version: candidate.version.clone(),
                check_order: candidate.check_order,
                passed: input
                    .get
                    .passed
                    .iter()
                    .filter_map(|j| bound.get(j.as_str()).map(|b| (j.clone(), b.id)))
                    .collect(),
                trigger: input.get.trigger,
            });
            if self.assign(index + 1, chosen, bound)? {
                return Ok(true);
            }
            chosen.pop();
            return Ok(false);
        };

        let builds = space.upstream.get(job).map(Vec::as_slice).unwrap_or(&[]);
        for build in builds {
            if !carries(build, input.resource.id, &candidate.version) {
                continue;
            }
            self.visit()?;
            bound.insert(job, build);
            if self.bind(index, candidate, rest, chosen, bound)? {
                return Ok(true);
            }
            bound.remove(job);
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::build::{BuildStatus, CreateBuildOutcome, NewBuild};
    use conveyor_core::pipeline::{PipelineConfig, ResourceConfig, StepConfig};
    use conveyor_core::plan::{Plan, PlanId, PlanStep};
    use conveyor_db::MemoryStore;

    fn resource(name: &str) -> ResourceConfig {
        ResourceConfig {
            name: name.to_string(),
            resource_type: "git".to_string(),
            source: Default::default(),
            tags: vec![],
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

    fn job(name: &str, plan: Vec<StepConfig>) -> JobConfig {
        JobConfig {
            name: name.to_string(),
            plan,
            serial: false,
            serial_groups: vec![],
            max_in_flight: None,
        }
    }

    fn v(r: &str) -> Version {
        Version::new([("ref", r)])
    }

    /// `a` and `b` feed `build`; `deploy` needs both through `build`.
    fn diamond() -> PipelineConfig {
        PipelineConfig {
            resource_types: vec![],
            resources: vec![resource("a"), resource("b")],
            jobs: vec![
                job("build", vec![get("a", &[]), get("b", &[])]),
                job("deploy", vec![get("a", &["build"]), get("b", &["build"])]),
            ],
        }
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        pipeline: Pipeline,
    }

    impl Fixture {
        async fn new(config: PipelineConfig) -> Self {
            let store = Arc::new(MemoryStore::new());
            let pipeline = store.save_pipeline("main", "app", &config).await.unwrap();
            Self { store, pipeline }
        }

        async fn version(&self, resource: &str, r: &str) {
            let resource = self
                .store
                .find_resource(self.pipeline.id, resource)
                .await
                .unwrap()
                .unwrap();
            self.store.append_version(resource.id, v(r), vec![]).await.unwrap();
        }

        fn resolver(&self, budget: u64) -> InputResolver {
            InputResolver::new(self.store.clone(), budget)
        }

        async fn resolve(&self, job: &str) -> Result<Vec<BuildInput>> {
            let config = self.pipeline.config.job(job).unwrap();
            self.resolver(10_000).resolve(&self.pipeline, config).await
        }

        /// Record a finished build of `job` that used `inputs`.
        async fn build(&self, job: &str, inputs: Vec<BuildInput>, status: BuildStatus) {
            let job = self.store.find_job(self.pipeline.id, job).await.unwrap().unwrap();
            let outcome = self
                .store
                .create_build(
                    NewBuild {
                        pipeline_id: self.pipeline.id,
                        job_id: job.id,
                        manually_triggered: false,
                        inputs,
                        plan: Plan {
                            id: PlanId(1),
                            step: PlanStep::Do { steps: vec![] },
                        },
                    },
                    &[],
                )
                .await
                .unwrap();
            let CreateBuildOutcome::Created(build) = outcome else {
                panic!("lease denied");
            };
            self.store
                .start_build(build.id, chrono::Utc::now() + chrono::Duration::minutes(5))
                .await
                .unwrap();
            self.store.finish_build(build.id, status).await.unwrap();
        }
    }

    fn refs(inputs: &[BuildInput]) -> Vec<(String, String)> {
        inputs
            .iter()
            .map(|i| (i.name.clone(), i.version.get("ref").unwrap_or_default().to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_latest_version_wins() {
        let f = Fixture::new(diamond()).await;
        for r in ["a1", "a2"] {
            f.version("a", r).await;
        }
        f.version("b", "b1").await;

        let inputs = f.resolve("build").await.unwrap();
        assert_eq!(
            refs(&inputs),
            vec![("a".into(), "a2".into()), ("b".into(), "b1".into())]
        );
        assert_eq!(inputs[0].check_order, 2);
        assert!(inputs[0].passed.is_empty());
    }

    #[tokio::test]
    async fn test_missing_versions_are_unsatisfiable() {
        let f = Fixture::new(diamond()).await;
        f.version("a", "a1").await;
        assert!(matches!(f.resolve("build").await, Err(Error::Constraint(_))));
    }

    #[tokio::test]
    async fn test_passed_requires_successful_upstream_build() {
        let f = Fixture::new(diamond()).await;
        f.version("a", "a1").await;
        f.version("b", "b1").await;
        assert!(matches!(f.resolve("deploy").await, Err(Error::Constraint(_))));

        let inputs = f.resolve("build").await.unwrap();
        f.build("build", inputs.clone(), BuildStatus::Failed).await;
        assert!(matches!(f.resolve("deploy").await, Err(Error::Constraint(_))));

        f.build("build", inputs, BuildStatus::Succeeded).await;
        let resolved = f.resolve("deploy").await.unwrap();
        assert_eq!(
            refs(&resolved),
            vec![("a".into(), "a1".into()), ("b".into(), "b1".into())]
        );
        assert!(resolved.iter().all(|i| i.passed.contains_key("build")));
    }

    async fn input(f: &Fixture, resource: &str, r: &str) -> BuildInput {
        let res = f
            .store
            .find_resource(f.pipeline.id, resource)
            .await
            .unwrap()
            .unwrap();
        let recorded = f
            .store
            .versions(res.id)
            .await
            .unwrap()
            .into_iter()
            .find(|rv| rv.version == v(r))
            .unwrap();
        BuildInput {
            name: resource.to_string(),
            resource_id: res.id,
            resource_name: resource.to_string(),
            version: recorded.version,
            check_order: recorded.check_order,
            passed: BTreeMap::new(),
            trigger: true,
        }
    }

    #[tokio::test]
    async fn test_passed_inputs_come_from_one_upstream_build() {
        let f = Fixture::new(diamond()).await;
        for (res, r) in [("a", "a1"), ("a", "a2"), ("b", "b1"), ("b", "b2")] {
            f.version(res, r).await;
        }
        for (a, b) in [("a1", "b1"), ("a2", "b1"), ("a1", "b2")] {
            let inputs = vec![input(&f, "a", a).await, input(&f, "b", b).await];
            f.build("build", inputs, BuildStatus::Succeeded).await;
        }

        // a2 and b2 both passed `build`, but never together.
        let resolved = f.resolve("deploy").await.unwrap();
        assert_eq!(
            refs(&resolved),
            vec![("a".into(), "a2".into()), ("b".into(), "b1".into())]
        );
        assert_eq!(resolved[0].passed["build"], resolved[1].passed["build"]);
    }

    #[tokio::test]
    async fn test_pinned_version_restricts_candidates() {
        let mut config = diamond();
        if let StepConfig::Get(g) = &mut config.jobs[0].plan[0] {
            g.version = VersionPolicy::Pinned(v("a1"));
        }
        let f = Fixture::new(config).await;
        for r in ["a1", "a2"] {
            f.version("a", r).await;
        }
        f.version("b", "b1").await;

        let inputs = f.resolve("build").await.unwrap();
        assert_eq!(inputs[0].version, v("a1"));
    }

    #[tokio::test]
    async fn test_unknown_upstream_job_is_configuration_error() {
        let config = PipelineConfig {
            resource_types: vec![],
            resources: vec![resource("a")],
            jobs: vec![job("deploy", vec![get("a", &["ghost"])])],
        };
        let f = Fixture::new(config).await;
        f.version("a", "a1").await;
        assert!(matches!(f.resolve("deploy").await, Err(Error::Configuration(_))));
    }

    #[tokio::test]
    async fn test_search_budget_is_enforced() {
        let f = Fixture::new(diamond()).await;
        for i in 0..20 {
            f.version("a", &format!("a{i}")).await;
        }
        f.version("b", "b1").await;
        // Nothing passed `build`, so every `a` candidate is visited.
        let config = f.pipeline.config.job("deploy").unwrap();
        let err = f.resolver(5).resolve(&f.pipeline, config).await;
        assert!(matches!(err, Err(Error::Constraint(m)) if m.contains("budget")));
    }
}
