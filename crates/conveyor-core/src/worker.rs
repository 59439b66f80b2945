//! Workers and the container backend they expose.
//!
//! Every worker runs a garden-like API: create a container, run processes
//! in it, destroy it, list what exists. Backends implement [`WorkerClient`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::Result;

/// Image a worker uses for one of its built-in resource types.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerResourceType {
    #[serde(rename = "type")]
    pub type_name: String,
    pub image: String,
}

/// What a worker announces when it registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerRegistration {
    pub name: String,
    #[serde(default = "default_platform")]
    pub platform: String,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub resource_types: Vec<WorkerResourceType>,
    /// How the control plane reaches the worker's container backend.
    pub address: String,
    /// Restricts the worker to one team's builds.
    #[serde(default)]
    pub team: Option<String>,
}

fn default_platform() -> String {
    "linux".to_string()
}

/// A registered worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Worker {
    pub name: String,
    pub platform: String,
    pub tags: Vec<String>,
    pub resource_types: Vec<WorkerResourceType>,
    pub address: String,
    pub team: Option<String>,
    /// Heartbeat time-to-live, in seconds.
    pub ttl_secs: u64,
    pub registered_at: DateTime<Utc>,
    pub heartbeat_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Worker {
    pub fn from_registration(
        reg: WorkerRegistration,
        ttl: std::time::Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let ttl_secs = ttl.as_secs().max(1);
        Self {
            name: reg.name,
            platform: reg.platform,
            tags: reg.tags,
            resource_types: reg.resource_types,
            address: reg.address,
            team: reg.team,
            ttl_secs,
            registered_at: now,
            heartbeat_at: now,
            expires_at: now + chrono::Duration::seconds(ttl_secs as i64),
        }
    }

    pub fn is_alive_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }

    pub fn supports_type(&self, type_name: &str) -> bool {
        self.resource_types.iter().any(|t| t.type_name == type_name)
    }

    pub fn image_for(&self, type_name: &str) -> Option<&str> {
        self.resource_types
            .iter()
            .find(|t| t.type_name == type_name)
            .map(|t| t.image.as_str())
    }

    /// Whether every requested tag is carried by this worker.
    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }
}

/// A volume mount specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    /// Name of the volume on the worker.
    pub name: String,
    /// Path to mount in the container.
    pub mount_path: String,
    pub read_only: bool,
}

/// Specification for a container to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub handle: String,
    pub image: String,
    pub privileged: bool,
    pub env: BTreeMap<String, String>,
    pub working_dir: Option<String>,
    pub volumes: Vec<VolumeMount>,
}

/// A process to run inside an existing container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSpec {
    pub path: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub dir: Option<String>,
    /// Written to the process's stdin, then closed.
    pub stdin: Option<String>,
}

/// A line of process output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    pub timestamp: DateTime<Utc>,
    pub stream: LogStream,
    pub content: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogStream {
    Stdout,
    Stderr,
    System,
}

/// A running process: its output, and its exit status once it ends.
pub struct ProcessRun {
    pub output: BoxStream<'static, LogLine>,
    pub exit: BoxFuture<'static, Result<i32>>,
}

/// Container backend exposed by each worker.
#[async_trait]
pub trait WorkerClient: Send + Sync {
    /// Name of the worker this client talks to.
    fn worker_name(&self) -> &str;

    async fn ping(&self) -> Result<()>;

    /// Create a container under `spec.handle`, returning the handle.
    async fn create_container(&self, spec: ContainerSpec) -> Result<String>;

    async fn run_step(&self, handle: &str, process: ProcessSpec) -> Result<ProcessRun>;

    /// Destroy a container. An absent handle is success.
    async fn destroy_container(&self, handle: &str) -> Result<()>;

    async fn list_containers(&self) -> Result<BTreeSet<String>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_expiry_and_capabilities() {
        let now = Utc::now();
        let worker = Worker::from_registration(
            WorkerRegistration {
                name: "w1".to_string(),
                platform: "linux".to_string(),
                tags: vec!["gpu".to_string()],
                resource_types: vec![WorkerResourceType {
                    type_name: "git".to_string(),
                    image: "conveyor/git-resource".to_string(),
                }],
                address: "memory://w1".to_string(),
                team: None,
            },
            std::time::Duration::from_secs(30),
            now,
        );

        assert!(worker.is_alive_at(now + chrono::Duration::seconds(29)));
        assert!(!worker.is_alive_at(now + chrono::Duration::seconds(30)));
        assert!(worker.supports_type("git"));
        assert_eq!(worker.image_for("git"), Some("conveyor/git-resource"));
        assert!(worker.has_tags(&[]));
        assert!(worker.has_tags(&["gpu".to_string()]));
        assert!(!worker.has_tags(&["arm".to_string()]));
    }
}
