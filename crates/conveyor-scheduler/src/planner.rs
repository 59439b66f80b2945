//! Build plan factory.
//!
//! Expands a job's step template into the concrete plan a build executes,
//! binding every `get` to its resolved version and every resource to the
//! type that realises it. Pure: the same config and inputs always produce
//! the same plan.

use conveyor_core::build::BuildInput;
use conveyor_core::pipeline::{GetStep, JobConfig, PipelineConfig, PutStep, StepConfig, TaskStep};
use conveyor_core::plan::{CustomType, GetPlan, Plan, PlanId, PlanStep, PutPlan, TaskPlan, TypeRef};
use conveyor_core::{Error, Result};
use std::collections::BTreeSet;

pub struct BuildPlanFactory;

impl BuildPlanFactory {
    /// Plan for one build of `job`.
    ///
    /// Fails with `Configuration` when a step references a resource or type
    /// the pipeline does not declare, and with `Constraint` when `inputs`
    /// lacks a version, or the upstream builds, a `get` requires.
    pub fn create(config: &PipelineConfig, job: &JobConfig, inputs: &[BuildInput]) -> Result<Plan> {
        let mut expander = Expander {
            config,
            inputs,
            next_id: 1,
        };
        let root = expander.id();
        let steps = job
            .plan
            .iter()
            .map(|step| expander.expand(step))
            .collect::<Result<Vec<_>>>()?;
        Ok(Plan {
            id: root,
            step: PlanStep::Do { steps },
        })
    }

    /// Plan of a one-off build running a single task.
    pub fn one_off(task: &TaskStep) -> Result<Plan> {
        if task.config.image.is_empty() || task.config.run.path.is_empty() {
            return Err(Error::InvalidInput(format!(
                "task {} needs an image and a command",
                task.name
            )));
        }
        Ok(Plan {
            id: PlanId(1),
            step: PlanStep::Task(task_plan(task)),
        })
    }
}

/// How `type_name` is realised: a base type directly, or a custom type
/// bottoming out in one.
pub fn resolve_type(config: &PipelineConfig, type_name: &str) -> Result<TypeRef> {
    let Some(custom) = config.resource_type(type_name) else {
        return Ok(TypeRef {
            name: type_name.to_string(),
            base_type: type_name.to_string(),
            custom: None,
        });
    };

    let mut seen = BTreeSet::from([type_name]);
    let mut base = custom.base_type.as_str();
    while let Some(next) = config.resource_type(base) {
        if !seen.insert(base) {
            return Err(Error::Configuration(format!(
                "resource type {type_name} refers to itself"
            )));
        }
        base = next.base_type.as_str();
    }

    Ok(TypeRef {
        name: type_name.to_string(),
        base_type: base.to_string(),
        custom: Some(CustomType {
            source: custom.source.clone(),
            privileged: custom.privileged,
        }),
    })
}

fn task_plan(task: &TaskStep) -> TaskPlan {
    TaskPlan {
        name: task.name.clone(),
        config: task.config.clone(),
        privileged: task.privileged,
        tags: task.tags.clone(),
    }
}

struct Expander<'a> {
    config: &'a PipelineConfig,
    inputs: &'a [BuildInput],
    next_id: u32,
}

impl Expander<'_> {
    fn id(&mut self) -> PlanId {
        let id = PlanId(self.next_id);
        self.next_id += 1;
        id
    }

    fn expand(&mut self, step: &StepConfig) -> Result<Plan> {
        let id = self.id();
        let step = match step {
            StepConfig::Get(get) => PlanStep::Get(self.get(get)?),
            StepConfig::Task(task) => PlanStep::Task(task_plan(task)),
            StepConfig::Put(put) => PlanStep::Put(self.put(put)?),
            StepConfig::Do { steps } => PlanStep::Do {
                steps: self.expand_all(steps)?,
            },
            StepConfig::InParallel { steps } => PlanStep::InParallel {
                steps: self.expand_all(steps)?,
            },
        };
        Ok(Plan { id, step })
    }

    fn expand_all(&mut self, steps: &[StepConfig]) -> Result<Vec<Plan>> {
        steps.iter().map(|s| self.expand(s)).collect()
    }

    fn get(&self, get: &GetStep) -> Result<GetPlan> {
        let resource = self.config.resource(&get.resource).ok_or_else(|| {
            Error::Configuration(format!("get {} uses unknown resource {}", get.name, get.resource))
        })?;
        let input = self
            .inputs
            .iter()
            .find(|i| i.name == get.name)
            .ok_or_else(|| Error::Constraint(format!("no version resolved for input {}", get.name)))?;
        if let Some(missing) = get.passed.iter().find(|j| !input.passed.contains_key(*j)) {
            return Err(Error::Constraint(format!(
                "input {} has no build of upstream job {missing}",
                get.name
            )));
        }

        Ok(GetPlan {
            name: get.name.clone(),
            resource: resource.name.clone(),
            resource_type: resolve_type(self.config, &resource.resource_type)?,
            source: resource.source.clone(),
            params: get.params.clone(),
            version: input.version.clone(),
            tags: merged_tags(&resource.tags, &get.tags),
        })
    }

    fn put(&self, put: &PutStep) -> Result<PutPlan> {
        let resource = self.config.resource(&put.resource).ok_or_else(|| {
            Error::Configuration(format!("put {} uses unknown resource {}", put.name, put.resource))
        })?;
        Ok(PutPlan {
            name: put.name.clone(),
            resource: resource.name.clone(),
            resource_type: resolve_type(self.config, &resource.resource_type)?,
            source: resource.source.clone(),
            params: put.params.clone(),
            inputs: put.inputs.clone(),
            tags: merged_tags(&resource.tags, &put.tags),
        })
    }
}

fn merged_tags(resource: &[String], step: &[String]) -> Vec<String> {
    let mut tags: Vec<String> = resource.iter().chain(step).cloned().collect();
    tags.sort();
    tags.dedup();
    tags
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::ResourceId;
    use conveyor_core::pipeline::{
        ResourceConfig, ResourceTypeConfig, RunConfig, TaskConfig, VersionPolicy,
    };
    use conveyor_core::version::Version;
    use std::collections::BTreeMap;

    fn config() -> PipelineConfig {
        PipelineConfig {
            resource_types: vec![ResourceTypeConfig {
                name: "slack".to_string(),
                base_type: "registry-image".to_string(),
                source: BTreeMap::from([("repository".to_string(), "acme/slack".into())]),
                privileged: false,
                tags: vec![],
            }],
            resources: vec![
                ResourceConfig {
                    name: "repo".to_string(),
                    resource_type: "git".to_string(),
                    source: BTreeMap::from([("uri".to_string(), "https://example.com".into())]),
                    tags: vec!["linux".to_string()],
                },
                ResourceConfig {
                    name: "notify".to_string(),
                    resource_type: "slack".to_string(),
                    source: Default::default(),
                    tags: vec![],
                },
            ],
            jobs: vec![],
        }
    }

    fn get(name: &str, resource: &str, passed: &[&str]) -> StepConfig {
        StepConfig::Get(GetStep {
            name: name.to_string(),
            resource: resource.to_string(),
            passed: passed.iter().map(|s| s.to_string()).collect(),
            trigger: true,
            version: VersionPolicy::Latest,
            params: Default::default(),
            tags: vec!["fast".to_string()],
        })
    }

    fn task(name: &str) -> StepConfig {
        StepConfig::Task(TaskStep {
            name: name.to_string(),
            config: TaskConfig {
                image: "alpine".to_string(),
                run: RunConfig {
                    path: "make".to_string(),
                    ..Default::default()
                },
                inputs: vec!["repo".to_string()],
                ..Default::default()
            },
            privileged: false,
            tags: vec![],
        })
    }

    fn job(plan: Vec<StepConfig>) -> JobConfig {
        JobConfig {
            name: "unit".to_string(),
            plan,
            serial: false,
            serial_groups: vec![],
            max_in_flight: None,
        }
    }

    fn input(name: &str, passed: &[&str]) -> BuildInput {
        BuildInput {
            name: name.to_string(),
            resource_id: ResourceId::new(),
            resource_name: "repo".to_string(),
            version: Version::new([("ref", "abc")]),
            check_order: 1,
            passed: passed
                .iter()
                .map(|j| (j.to_string(), ResourceId::new()))
                .collect(),
            trigger: true,
        }
    }

    #[test]
    fn test_plan_binds_versions_and_numbers_nodes() {
        let job = job(vec![
            StepConfig::InParallel {
                steps: vec![get("repo", "repo", &[])],
            },
            task("test"),
            StepConfig::Put(PutStep {
                name: "notify".to_string(),
                resource: "notify".to_string(),
                params: Default::default(),
                inputs: None,
                tags: vec![],
            }),
        ]);
        let plan = BuildPlanFactory::create(&config(), &job, &[input("repo", &[])]).unwrap();

        let leaves = plan.leaves();
        assert_eq!(leaves.len(), 3);
        let ids: Vec<u32> = leaves.iter().map(|p| p.id.0).collect();
        assert_eq!(ids, vec![3, 4, 5]);

        let PlanStep::Get(get) = &leaves[0].step else {
            panic!("expected get");
        };
        assert_eq!(get.version.get("ref"), Some("abc"));
        assert_eq!(get.resource_type.base_type, "git");
        assert_eq!(get.tags, vec!["fast".to_string(), "linux".to_string()]);
        assert_eq!(get.source["uri"], "https://example.com");

        let PlanStep::Put(put) = &leaves[2].step else {
            panic!("expected put");
        };
        assert_eq!(put.resource_type.base_type, "registry-image");
        assert!(put.resource_type.custom.is_some());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let job = job(vec![get("repo", "repo", &[]), task("test")]);
        let inputs = [input("repo", &[])];
        assert_eq!(
            BuildPlanFactory::create(&config(), &job, &inputs).unwrap(),
            BuildPlanFactory::create(&config(), &job, &inputs).unwrap()
        );
    }

    #[test]
    fn test_unknown_resource_is_configuration_error() {
        let job = job(vec![get("missing", "missing", &[])]);
        let err = BuildPlanFactory::create(&config(), &job, &[input("missing", &[])]);
        assert!(matches!(err, Err(Error::Configuration(_))));
    }

    #[test]
    fn test_missing_passed_metadata_is_constraint_error() {
        let job = job(vec![get("repo", "repo", &["build"])]);
        let err = BuildPlanFactory::create(&config(), &job, &[input("repo", &[])]);
        assert!(matches!(err, Err(Error::Constraint(_))));

        let err = BuildPlanFactory::create(&config(), &job, &[]);
        assert!(matches!(err, Err(Error::Constraint(_))));

        assert!(BuildPlanFactory::create(&config(), &job, &[input("repo", &["build"])]).is_ok());
    }

    #[test]
    fn test_custom_type_cycle_is_rejected() {
        let mut config = config();
        config.resource_types[0].base_type = "slack".to_string();
        assert!(matches!(
            resolve_type(&config, "slack"),
            Err(Error::Configuration(_))
        ));
    }

    #[test]
    fn test_one_off_requires_command() {
        let StepConfig::Task(mut step) = task("adhoc") else {
            unreachable!()
        };
        assert!(BuildPlanFactory::one_off(&step).is_ok());
        step.config.run.path.clear();
        assert!(matches!(
            BuildPlanFactory::one_off(&step),
            Err(Error::InvalidInput(_))
        ));
    }
}
