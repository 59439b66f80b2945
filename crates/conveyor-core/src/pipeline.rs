//! Pipeline, job and resource configuration and their persisted records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::ResourceId;
use crate::version::Version;

/// Free-form `source`/`params` blocks handed to resource scripts untouched.
pub type Params = BTreeMap<String, serde_json::Value>;

/// The declarative configuration of a pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineConfig {
    #[serde(default)]
    pub resource_types: Vec<ResourceTypeConfig>,
    #[serde(default)]
    pub resources: Vec<ResourceConfig>,
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
}

impl PipelineConfig {
    pub fn job(&self, name: &str) -> Option<&JobConfig> {
        self.jobs.iter().find(|j| j.name == name)
    }

    pub fn resource(&self, name: &str) -> Option<&ResourceConfig> {
        self.resources.iter().find(|r| r.name == name)
    }

    pub fn resource_type(&self, name: &str) -> Option<&ResourceTypeConfig> {
        self.resource_types.iter().find(|t| t.name == name)
    }
}

/// A custom resource type: an image fetched through a base resource type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceTypeConfig {
    pub name: String,
    /// Type used to fetch the image, e.g. `registry-image`.
    #[serde(rename = "type")]
    pub base_type: String,
    #[serde(default)]
    pub source: Params,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub resource_type: String,
    #[serde(default)]
    pub source: Params,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobConfig {
    pub name: String,
    #[serde(default)]
    pub plan: Vec<StepConfig>,
    /// Only one build of this job may be pending or started at a time.
    #[serde(default)]
    pub serial: bool,
    /// Named groups sharing a single build lease across jobs.
    #[serde(default)]
    pub serial_groups: Vec<String>,
    #[serde(default)]
    pub max_in_flight: Option<u32>,
}

impl JobConfig {
    /// Every `get` step in plan declaration order, including nested ones.
    pub fn inputs(&self) -> Vec<&GetStep> {
        let mut out = Vec::new();
        for step in &self.plan {
            step.collect_gets(&mut out);
        }
        out
    }

    /// Every `put` step in plan declaration order, including nested ones.
    pub fn outputs(&self) -> Vec<&PutStep> {
        let mut out = Vec::new();
        for step in &self.plan {
            step.collect_puts(&mut out);
        }
        out
    }

    /// Effective per-job build limit, if any.
    pub fn job_limit(&self) -> Option<u32> {
        if self.serial {
            Some(1)
        } else {
            self.max_in_flight
        }
    }
}

/// One node of a job's plan template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepConfig {
    Get(GetStep),
    Task(TaskStep),
    Put(PutStep),
    /// Run the children one after another.
    Do { steps: Vec<StepConfig> },
    /// Run the children concurrently.
    InParallel { steps: Vec<StepConfig> },
}

impl StepConfig {
    fn collect_gets<'a>(&'a self, out: &mut Vec<&'a GetStep>) {
        match self {
            StepConfig::Get(get) => out.push(get),
            StepConfig::Do { steps } | StepConfig::InParallel { steps } => {
                for step in steps {
                    step.collect_gets(out);
                }
            }
            StepConfig::Task(_) | StepConfig::Put(_) => {}
        }
    }

    fn collect_puts<'a>(&'a self, out: &mut Vec<&'a PutStep>) {
        match self {
            StepConfig::Put(put) => out.push(put),
            StepConfig::Do { steps } | StepConfig::InParallel { steps } => {
                for step in steps {
                    step.collect_puts(out);
                }
            }
            StepConfig::Task(_) | StepConfig::Get(_) => {}
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetStep {
    /// Artifact name the fetched bits are exposed under.
    pub name: String,
    pub resource: String,
    /// Upstream jobs the version must have passed through.
    #[serde(default)]
    pub passed: Vec<String>,
    /// Whether new versions of this input trigger the job.
    #[serde(default)]
    pub trigger: bool,
    #[serde(default)]
    pub version: VersionPolicy,
    #[serde(default)]
    pub params: Params,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VersionPolicy {
    #[default]
    Latest,
    Pinned(Version),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStep {
    pub name: String,
    pub config: TaskConfig,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub platform: Option<String>,
    pub image: String,
    pub run: RunConfig,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    /// Paths persisted across builds of the same job and step.
    #[serde(default)]
    pub caches: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub path: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutStep {
    pub name: String,
    pub resource: String,
    #[serde(default)]
    pub params: Params,
    /// Artifacts to mount; all of them when absent.
    #[serde(default)]
    pub inputs: Option<Vec<String>>,
    #[serde(default)]
    pub tags: Vec<String>,
}

/// A pipeline as persisted by the store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pipeline {
    pub id: ResourceId,
    pub team: String,
    pub name: String,
    pub config: PipelineConfig,
    /// Bumped on every config save.
    pub config_version: u64,
    pub paused: bool,
    /// Set once destruction has begun; nothing new may be created under it.
    pub destroying: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pipeline {
    pub fn is_schedulable(&self) -> bool {
        !self.paused && !self.destroying
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: ResourceId,
    pub pipeline_id: ResourceId,
    pub name: String,
    pub paused: bool,
    /// False once the job disappears from the pipeline config.
    pub active: bool,
    pub manual_trigger_requested: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Resource {
    pub id: ResourceId,
    pub pipeline_id: ResourceId,
    pub name: String,
    pub resource_type: String,
    pub active: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get(name: &str) -> StepConfig {
        StepConfig::Get(GetStep {
            name: name.to_string(),
            resource: name.to_string(),
            passed: vec![],
            trigger: true,
            version: VersionPolicy::Latest,
            params: Params::new(),
            tags: vec![],
        })
    }

    #[test]
    fn test_inputs_flatten_nested_steps_in_order() {
        let job = JobConfig {
            name: "unit".to_string(),
            plan: vec![
                StepConfig::InParallel {
                    steps: vec![get("a"), get("b")],
                },
                StepConfig::Do {
                    steps: vec![get("c")],
                },
            ],
            serial: false,
            serial_groups: vec![],
            max_in_flight: None,
        };

        let names: Vec<_> = job.inputs().iter().map(|g| g.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_job_limits() {
        let mut job = JobConfig {
            name: "deploy".to_string(),
            plan: vec![],
            serial: true,
            serial_groups: vec!["prod".to_string()],
            max_in_flight: Some(3),
        };
        assert_eq!(job.job_limit(), Some(1));

        job.serial = false;
        assert_eq!(job.job_limit(), Some(3));

        job.max_in_flight = None;
        assert_eq!(job.job_limit(), None);
    }

    #[test]
    fn test_step_config_json_shape() {
        let json = serde_json::to_value(get("repo")).unwrap();
        assert_eq!(json["kind"], "get");
        assert_eq!(json["resource"], "repo");
        assert_eq!(json["version"], "latest");
    }
}
