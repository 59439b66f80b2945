//! Container records and the owners that justify them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::ResourceId;
use crate::plan::PlanId;

/// The entity whose validity keeps a container alive.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ContainerOwner {
    BuildStep {
        build_id: ResourceId,
        plan_id: PlanId,
        step: String,
    },
    ResourceCheck {
        resource_id: ResourceId,
    },
    TaskCache {
        cache_id: ResourceId,
    },
    ResourceTypeCheck {
        pipeline_id: ResourceId,
        resource_type: String,
    },
}

impl ContainerOwner {
    pub fn build_id(&self) -> Option<ResourceId> {
        match self {
            ContainerOwner::BuildStep { build_id, .. } => Some(*build_id),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ContainerOwner::BuildStep { .. } => "build_step",
            ContainerOwner::ResourceCheck { .. } => "resource_check",
            ContainerOwner::TaskCache { .. } => "task_cache",
            ContainerOwner::ResourceTypeCheck { .. } => "resource_type_check",
        }
    }
}

impl fmt::Display for ContainerOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerOwner::BuildStep {
                build_id,
                plan_id,
                step,
            } => write!(f, "build {} step {step} (plan {plan_id})", build_id.short()),
            ContainerOwner::ResourceCheck { resource_id } => {
                write!(f, "check of resource {}", resource_id.short())
            }
            ContainerOwner::TaskCache { cache_id } => {
                write!(f, "task cache {}", cache_id.short())
            }
            ContainerOwner::ResourceTypeCheck { resource_type, .. } => {
                write!(f, "check of resource type {resource_type}")
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerState {
    /// Recorded, backend create call not yet confirmed.
    Creating,
    Created,
}

impl ContainerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContainerState::Creating => "creating",
            ContainerState::Created => "created",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    /// Globally unique, chosen by the registry before creation.
    pub handle: String,
    pub worker_name: String,
    pub owner: ContainerOwner,
    pub state: ContainerState,
    pub team: String,
    pub pipeline_id: Option<ResourceId>,
    pub created_at: DateTime<Utc>,
    /// Check and cache containers may be reused until this instant.
    pub best_if_used_by: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
}

impl Container {
    pub fn is_released(&self) -> bool {
        self.released_at.is_some()
    }

    pub fn is_reusable_at(&self, now: DateTime<Utc>) -> bool {
        self.state == ContainerState::Created
            && !self.is_released()
            && self.best_if_used_by.is_none_or(|t| t > now)
    }
}

#[derive(Debug, Clone)]
pub struct NewContainer {
    pub worker_name: String,
    pub owner: ContainerOwner,
    pub team: String,
    pub pipeline_id: Option<ResourceId>,
    pub best_if_used_by: Option<DateTime<Utc>>,
}

/// Read-only projections of the registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ContainerScope {
    Team(String),
    Pipeline(ResourceId),
    Worker(String),
}

impl ContainerScope {
    pub fn matches(&self, container: &Container) -> bool {
        match self {
            ContainerScope::Team(team) => &container.team == team,
            ContainerScope::Pipeline(id) => container.pipeline_id == Some(*id),
            ContainerScope::Worker(name) => &container.worker_name == name,
        }
    }
}

/// A cache volume persisted across builds of the same job and step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskCache {
    pub id: ResourceId,
    pub pipeline_id: ResourceId,
    pub job_id: ResourceId,
    pub step_name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
}

impl TaskCache {
    pub fn volume_name(&self) -> String {
        format!("cache-{}", self.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_owner_json_is_tagged() {
        let owner = ContainerOwner::ResourceTypeCheck {
            pipeline_id: ResourceId::new(),
            resource_type: "custom-git".to_string(),
        };
        let json = serde_json::to_value(&owner).unwrap();
        assert_eq!(json["kind"], "resource_type_check");
        let back: ContainerOwner = serde_json::from_value(json).unwrap();
        assert_eq!(back, owner);
        assert_eq!(owner.kind(), "resource_type_check");
    }

    #[test]
    fn test_reusable_until_expiry() {
        let now = Utc::now();
        let mut container = Container {
            handle: "h".to_string(),
            worker_name: "w".to_string(),
            owner: ContainerOwner::ResourceCheck {
                resource_id: ResourceId::new(),
            },
            state: ContainerState::Created,
            team: "main".to_string(),
            pipeline_id: None,
            created_at: now,
            best_if_used_by: Some(now + chrono::Duration::minutes(5)),
            released_at: None,
        };
        assert!(container.is_reusable_at(now));
        assert!(!container.is_reusable_at(now + chrono::Duration::minutes(6)));

        container.released_at = Some(now);
        assert!(!container.is_reusable_at(now));
    }
}
