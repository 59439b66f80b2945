//! Builds, their state machine, and the concurrency leases guarding creation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::ResourceId;
use crate::pipeline::JobConfig;
use crate::plan::Plan;
use crate::version::{MetadataField, Version};

/// Status of a build.
///
/// `pending -> started -> {succeeded | failed | errored}`, and
/// `pending | started -> aborted`. Terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildStatus {
    Pending,
    Started,
    Succeeded,
    Failed,
    Errored,
    Aborted,
}

impl BuildStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, BuildStatus::Pending | BuildStatus::Started)
    }

    pub fn can_transition_to(&self, next: BuildStatus) -> bool {
        use BuildStatus::*;
        matches!(
            (self, next),
            (Pending, Started)
                | (Pending, Aborted)
                | (Started, Succeeded)
                | (Started, Failed)
                | (Started, Errored)
                | (Started, Aborted)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BuildStatus::Pending => "pending",
            BuildStatus::Started => "started",
            BuildStatus::Succeeded => "succeeded",
            BuildStatus::Failed => "failed",
            BuildStatus::Errored => "errored",
            BuildStatus::Aborted => "aborted",
        }
    }
}

impl fmt::Display for BuildStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BuildStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s {
            "pending" => Ok(BuildStatus::Pending),
            "started" => Ok(BuildStatus::Started),
            "succeeded" => Ok(BuildStatus::Succeeded),
            "failed" => Ok(BuildStatus::Failed),
            "errored" => Ok(BuildStatus::Errored),
            "aborted" => Ok(BuildStatus::Aborted),
            other => Err(crate::Error::InvalidInput(format!(
                "unknown build status: {other}"
            ))),
        }
    }
}

/// A resolved input: the exact version a build consumes under a name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInput {
    pub name: String,
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub version: Version,
    pub check_order: u64,
    /// Upstream build that satisfied each passed constraint, by job name.
    #[serde(default)]
    pub passed: BTreeMap<String, ResourceId>,
    #[serde(default)]
    pub trigger: bool,
}

/// A version produced by a successful `put`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub name: String,
    pub resource_id: ResourceId,
    pub resource_name: String,
    pub version: Version,
    pub check_order: u64,
    #[serde(default)]
    pub metadata: Vec<MetadataField>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: ResourceId,
    pub team: String,
    pub pipeline_id: ResourceId,
    /// `None` for one-off builds.
    pub job_id: Option<ResourceId>,
    pub job_name: Option<String>,
    /// Per-job sequence number; one-off builds number within their pipeline.
    pub sequence: u64,
    pub status: BuildStatus,
    pub manually_triggered: bool,
    pub inputs: Vec<BuildInput>,
    pub outputs: Vec<BuildOutput>,
    pub plan: Option<Plan>,
    pub abort_requested: bool,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    /// While started, the engine running the build must renew its claim
    /// before this time or the build is reaped.
    #[serde(default)]
    pub claim_expires_at: Option<DateTime<Utc>>,
}

impl Build {
    pub fn is_one_off(&self) -> bool {
        self.job_id.is_none()
    }

    pub fn name(&self) -> String {
        match &self.job_name {
            Some(job) => format!("{job}/{}", self.sequence),
            None => format!("one-off/{}", self.sequence),
        }
    }

    pub fn input(&self, name: &str) -> Option<&BuildInput> {
        self.inputs.iter().find(|i| i.name == name)
    }

    /// Check orders of every version of `resource_id` this build consumed or
    /// produced.
    pub fn check_orders_for(&self, resource_id: ResourceId) -> impl Iterator<Item = u64> + '_ {
        self.inputs
            .iter()
            .filter(move |i| i.resource_id == resource_id)
            .map(|i| i.check_order)
            .chain(
                self.outputs
                    .iter()
                    .filter(move |o| o.resource_id == resource_id)
                    .map(|o| o.check_order),
            )
    }

    /// Whether the build is started and nobody renewed its claim in time.
    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.status == BuildStatus::Started
            && self.claim_expires_at.is_none_or(|until| until <= now)
    }

    /// Whether the build has been terminal for longer than `retention`.
    pub fn retention_elapsed(&self, retention: chrono::Duration, now: DateTime<Utc>) -> bool {
        match (self.status.is_terminal(), self.finished_at) {
            (true, Some(finished)) => finished + retention <= now,
            (true, None) => true,
            (false, _) => false,
        }
    }
}

/// Everything the store needs to persist a scheduled build.
#[derive(Debug, Clone)]
pub struct NewBuild {
    pub pipeline_id: ResourceId,
    pub job_id: ResourceId,
    pub manually_triggered: bool,
    pub inputs: Vec<BuildInput>,
    pub plan: Plan,
}

/// What a lease serialises.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LeaseScope {
    Job {
        job_id: ResourceId,
    },
    SerialGroup {
        pipeline_id: ResourceId,
        group: String,
    },
}

impl LeaseScope {
    /// Stable key used for lease rows and advisory locks.
    pub fn key(&self) -> String {
        match self {
            LeaseScope::Job { job_id } => format!("job:{job_id}"),
            LeaseScope::SerialGroup { pipeline_id, group } => {
                format!("group:{pipeline_id}:{group}")
            }
        }
    }
}

impl fmt::Display for LeaseScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaseClaim {
    pub scope: LeaseScope,
    /// Maximum number of builds holding this scope at once.
    pub limit: u32,
}

/// Builds allowed across all jobs of one serial group. A job's own
/// `max_in_flight` only bounds its job scope.
pub const SERIAL_GROUP_LIMIT: u32 = 1;

/// Leases a build of `job` must acquire before it may exist.
pub fn lease_claims(pipeline_id: ResourceId, job_id: ResourceId, job: &JobConfig) -> Vec<LeaseClaim> {
    let mut claims = Vec::new();
    if let Some(limit) = job.job_limit() {
        claims.push(LeaseClaim {
            scope: LeaseScope::Job { job_id },
            limit,
        });
    }
    for group in &job.serial_groups {
        claims.push(LeaseClaim {
            scope: LeaseScope::SerialGroup {
                pipeline_id,
                group: group.clone(),
            },
            limit: SERIAL_GROUP_LIMIT,
        });
    }
    claims.sort_by(|a, b| a.scope.cmp(&b.scope));
    claims
}

/// Why the store refused to create a build. Normal control flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum LeaseDenial {
    Held {
        scope: LeaseScope,
        limit: u32,
        holders: Vec<ResourceId>,
    },
    /// The job or its pipeline was paused or deactivated concurrently.
    Unavailable,
}

impl fmt::Display for LeaseDenial {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LeaseDenial::Held { scope, limit, holders } => write!(
                f,
                "lease {scope} at limit {limit} ({} holder(s))",
                holders.len()
            ),
            LeaseDenial::Unavailable => f.write_str("job is paused or inactive"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum CreateBuildOutcome {
    Created(Build),
    LeaseDenied(LeaseDenial),
}

/// A window over a job's builds by sequence number, newest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    /// Only builds with a sequence number lower than this.
    pub since: Option<u64>,
    /// Only builds with a sequence number higher than this.
    pub until: Option<u64>,
    pub limit: usize,
}

impl Default for Page {
    fn default() -> Self {
        Self {
            since: None,
            until: None,
            limit: 50,
        }
    }
}

impl Page {
    pub fn contains(&self, sequence: u64) -> bool {
        self.since.is_none_or(|s| sequence < s) && self.until.is_none_or(|u| sequence > u)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pagination {
    /// Newer builds.
    pub previous: Option<Page>,
    /// Older builds.
    pub next: Option<Page>,
}
