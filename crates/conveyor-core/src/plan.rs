//! Build plans.
//!
//! A plan is the immutable, fully-resolved step tree a build executes. It is
//! produced once per build and never edited afterwards.

use derive_more::Display;
use serde::{Deserialize, Serialize};

use crate::pipeline::{Params, TaskConfig};
use crate::version::Version;

/// Identifies a node of a plan; unique within one build.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Display,
)]
#[display("{_0}")]
#[serde(transparent)]
pub struct PlanId(pub u32);

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: PlanId,
    pub step: PlanStep,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PlanStep {
    Get(GetPlan),
    Task(TaskPlan),
    Put(PutPlan),
    /// Each child depends on the one before it.
    Do { steps: Vec<Plan> },
    /// Children are independent of each other.
    InParallel { steps: Vec<Plan> },
}

/// How a resource type is realised on a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeRef {
    /// Name the resource refers to.
    pub name: String,
    /// Base type a worker must support to run it.
    pub base_type: String,
    /// Present when `name` is a pipeline-declared custom type.
    pub custom: Option<CustomType>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomType {
    pub source: Params,
    pub privileged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GetPlan {
    pub name: String,
    pub resource: String,
    pub resource_type: TypeRef,
    pub source: Params,
    pub params: Params,
    pub version: Version,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPlan {
    pub name: String,
    pub config: TaskConfig,
    pub privileged: bool,
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PutPlan {
    pub name: String,
    pub resource: String,
    pub resource_type: TypeRef,
    pub source: Params,
    pub params: Params,
    pub inputs: Option<Vec<String>>,
    pub tags: Vec<String>,
}

impl Plan {
    /// Leaf steps (get/task/put) in declaration order.
    pub fn leaves(&self) -> Vec<&Plan> {
        let mut out = Vec::new();
        self.collect_leaves(&mut out);
        out
    }

    fn collect_leaves<'a>(&'a self, out: &mut Vec<&'a Plan>) {
        match &self.step {
            PlanStep::Do { steps } | PlanStep::InParallel { steps } => {
                for step in steps {
                    step.collect_leaves(out);
                }
            }
            _ => out.push(self),
        }
    }

    /// Name of a leaf step; composite steps have none.
    pub fn step_name(&self) -> Option<&str> {
        match &self.step {
            PlanStep::Get(get) => Some(&get.name),
            PlanStep::Task(task) => Some(&task.name),
            PlanStep::Put(put) => Some(&put.name),
            PlanStep::Do { .. } | PlanStep::InParallel { .. } => None,
        }
    }
}
