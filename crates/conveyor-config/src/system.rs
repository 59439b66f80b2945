//! System configuration parsing.
//!
//! ```kdl
//! listen "0.0.0.0:8080"
//! database-url "postgres://conveyor@localhost/conveyor"
//! base-resource-types "git" "registry-image" "time"
//!
//! scheduler {
//!     interval "10s"
//! }
//!
//! gc {
//!     build-retention "30m"
//! }
//!
//! worker "local" address="unix:///var/run/docker.sock" ttl="30s" {
//!     tags "docker"
//!     resource-type "git" image="conveyor/git-resource"
//! }
//! ```

use crate::kdl_util::{
    get_all_string_args, get_first_string_arg, get_string_list_prop, get_string_prop,
    get_u64_arg, parse_duration,
};
use crate::{ConfigError, ConfigResult};
use conveyor_core::worker::{WorkerRegistration, WorkerResourceType};
use kdl::{KdlDocument, KdlNode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// System-wide configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SystemConfig {
    /// Address the HTTP API binds to.
    pub listen: String,
    /// PostgreSQL connection string; the in-memory store is used when absent.
    pub database_url: Option<String>,
    /// Resource types every worker is expected to provide.
    pub base_resource_types: Vec<String>,
    pub scheduler: SchedulerConfig,
    pub engine: EngineConfig,
    pub gc: GcConfig,
    /// Docker workers registered at startup and kept alive by the beacon.
    pub workers: Vec<StaticWorkerConfig>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    pub interval: Duration,
    /// Maximum candidate versions the input resolver visits per job.
    pub resolver_budget: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineConfig {
    pub max_concurrent_builds: usize,
    pub claim_interval: Duration,
    /// Renewed on every abort poll; a started build whose engine stops
    /// renewing for this long is reaped by the collector.
    pub claim_ttl: Duration,
    pub abort_poll_interval: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GcConfig {
    pub interval: Duration,
    /// How long a finished build's containers stay around for inspection.
    pub build_retention: Duration,
    /// Reuse window for resource check containers.
    pub check_container_ttl: Duration,
    /// Expired workers are removed once they miss heartbeats for this long.
    pub worker_prune_grace: Duration,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticWorkerConfig {
    pub registration: WorkerRegistration,
    pub ttl: Duration,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            database_url: None,
            base_resource_types: vec![
                "git".to_string(),
                "registry-image".to_string(),
                "time".to_string(),
            ],
            scheduler: SchedulerConfig::default(),
            engine: EngineConfig::default(),
            gc: GcConfig::default(),
            workers: Vec::new(),
        }
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10),
            resolver_budget: 10_000,
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_builds: 32,
            claim_interval: Duration::from_secs(1),
            claim_ttl: Duration::from_secs(60),
            abort_poll_interval: Duration::from_secs(1),
        }
    }
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            build_retention: Duration::from_secs(10 * 60),
            check_container_ttl: Duration::from_secs(60 * 60),
            worker_prune_grace: Duration::from_secs(5 * 60),
        }
    }
}

impl SystemConfig {
    /// Apply `CONVEYOR_DATABASE_URL` and `CONVEYOR_LISTEN` overrides.
    pub fn apply_env(&mut self) {
        self.apply_overrides(
            std::env::var("CONVEYOR_DATABASE_URL").ok(),
            std::env::var("CONVEYOR_LISTEN").ok(),
        );
    }

    fn apply_overrides(&mut self, database_url: Option<String>, listen: Option<String>) {
        if let Some(url) = database_url.filter(|u| !u.is_empty()) {
            self.database_url = Some(url);
        }
        if let Some(listen) = listen.filter(|l| !l.is_empty()) {
            self.listen = listen;
        }
    }
}

/// Parse system configuration from KDL text. Missing fields keep their
/// defaults.
pub fn parse_system_config(kdl: &str) -> ConfigResult<SystemConfig> {
    let doc: KdlDocument = kdl.parse()?;
    let mut config = SystemConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "listen" => {
                config.listen = get_first_string_arg(node)
                    .ok_or_else(|| ConfigError::MissingField("listen address".to_string()))?;
            }
            "database-url" => config.database_url = get_first_string_arg(node),
            "base-resource-types" => config.base_resource_types = get_all_string_args(node),
            "scheduler" => parse_scheduler(node, &mut config.scheduler)?,
            "engine" => parse_engine(node, &mut config.engine)?,
            "gc" => parse_gc(node, &mut config.gc)?,
            "worker" => config.workers.push(parse_worker(node)?),
            _ => {}
        }
    }

    let mut names = std::collections::HashSet::new();
    for worker in &config.workers {
        if !names.insert(worker.registration.name.as_str()) {
            return Err(ConfigError::Duplicate(format!(
                "worker '{}'",
                worker.registration.name
            )));
        }
    }

    Ok(config)
}

/// Load system configuration from a file, or defaults when `path` is
/// `None`, then apply environment overrides.
pub fn load_system_config(path: Option<&Path>) -> ConfigResult<SystemConfig> {
    let mut config = match path {
        Some(path) => parse_system_config(&std::fs::read_to_string(path)?)?,
        None => SystemConfig::default(),
    };
    config.apply_env();
    Ok(config)
}

fn child_duration(child: &KdlNode, field: &str) -> ConfigResult<Duration> {
    let raw = get_first_string_arg(child).ok_or_else(|| ConfigError::InvalidValue {
        field: field.to_string(),
        message: "expected a duration string such as \"10s\"".to_string(),
    })?;
    parse_duration(field, &raw)
}

fn parse_scheduler(node: &KdlNode, out: &mut SchedulerConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "interval" => out.interval = child_duration(child, "scheduler.interval")?,
                "resolver-budget" => out.resolver_budget = get_u64_arg(child)?,
                _ => {}
            }
        }
    }
    Ok(())
}

fn parse_engine(node: &KdlNode, out: &mut EngineConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "max-concurrent-builds" => {
                    out.max_concurrent_builds = get_u64_arg(child)?.max(1) as usize;
                }
                "claim-interval" => {
                    out.claim_interval = child_duration(child, "engine.claim-interval")?;
                }
                "claim-ttl" => out.claim_ttl = child_duration(child, "engine.claim-ttl")?,
                "abort-poll-interval" => {
                    out.abort_poll_interval = child_duration(child, "engine.abort-poll-interval")?;
                }
                _ => {}
            }
        }
    }
    if out.claim_ttl <= out.abort_poll_interval {
        return Err(ConfigError::InvalidValue {
            field: "engine.claim-ttl".to_string(),
            message: "must be longer than engine.abort-poll-interval".to_string(),
        });
    }
    Ok(())
}

fn parse_gc(node: &KdlNode, out: &mut GcConfig) -> ConfigResult<()> {
    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "interval" => out.interval = child_duration(child, "gc.interval")?,
                "build-retention" => {
                    out.build_retention = child_duration(child, "gc.build-retention")?;
                }
                "check-container-ttl" => {
                    out.check_container_ttl = child_duration(child, "gc.check-container-ttl")?;
                }
                "worker-prune-grace" => {
                    out.worker_prune_grace = child_duration(child, "gc.worker-prune-grace")?;
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn parse_worker(node: &KdlNode) -> ConfigResult<StaticWorkerConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("worker name".to_string()))?;
    let address = get_string_prop(node, "address")
        .ok_or_else(|| ConfigError::MissingField(format!("address for worker '{name}'")))?;
    let ttl = match get_string_prop(node, "ttl") {
        Some(raw) => parse_duration("worker.ttl", &raw)?,
        None => Duration::from_secs(30),
    };

    let mut resource_types = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "resource-type" {
                let type_name = get_first_string_arg(child).ok_or_else(|| {
                    ConfigError::MissingField(format!("resource-type name on worker '{name}'"))
                })?;
                let image = get_string_prop(child, "image").ok_or_else(|| {
                    ConfigError::MissingField(format!(
                        "image for resource-type '{type_name}' on worker '{name}'"
                    ))
                })?;
                resource_types.push(WorkerResourceType { type_name, image });
            }
        }
    }

    Ok(StaticWorkerConfig {
        registration: WorkerRegistration {
            platform: get_string_prop(node, "platform").unwrap_or_else(|| "linux".to_string()),
            tags: get_string_list_prop(node, "tags"),
            team: get_string_prop(node, "team"),
            name,
            address,
            resource_types,
        },
        ttl,
    })
}
