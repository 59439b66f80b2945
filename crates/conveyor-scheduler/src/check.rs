//! On-demand resource checks.
//!
//! A check runs the resource type's `check` script inside a container owned
//! by the resource and reused until its best-if-used-by time. Custom
//! resource types are turned into an image by checking the type itself in a
//! container owned by the pipeline's type.

use chrono::{DateTime, Utc};
use conveyor_core::container::{ContainerOwner, NewContainer};
use conveyor_core::pipeline::{Params, Pipeline};
use conveyor_core::plan::TypeRef;
use conveyor_core::version::{ResourceVersion, Version};
use conveyor_core::worker::{ContainerSpec, WorkerClient};
use conveyor_core::{Error, ResourceId, Result};
use conveyor_db::{PipelineRepo, Store, VersionRepo};
use conveyor_gc::ContainerRegistry;
use conveyor_worker::{PlacementSpec, WorkerRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::planner::resolve_type;
use crate::runner::{BUILD_DIR, CHECK_SCRIPT, launch, parse_response, resource_request, run_process, script};

pub struct ResourceChecker {
    store: Arc<dyn Store>,
    workers: Arc<WorkerRegistry>,
    containers: Arc<ContainerRegistry>,
    container_ttl: Duration,
}

impl ResourceChecker {
    pub fn new(
        store: Arc<dyn Store>,
        workers: Arc<WorkerRegistry>,
        containers: Arc<ContainerRegistry>,
        container_ttl: Duration,
    ) -> Self {
        Self {
            store,
            workers,
            containers,
            container_ttl,
        }
    }

    pub async fn check(&self, resource_id: ResourceId) -> Result<Vec<ResourceVersion>> {
        self.check_at(resource_id, Utc::now()).await
    }

    /// Run the resource's check and append what it reports.
    ///
    /// Returns the versions that were not in the history before.
    pub async fn check_at(
        &self,
        resource_id: ResourceId,
        now: DateTime<Utc>,
    ) -> Result<Vec<ResourceVersion>> {
        let resource = self.store.get_resource(resource_id).await?;
        if !resource.active {
            return Err(Error::InvalidInput(format!(
                "resource {} is no longer part of its pipeline",
                resource.name
            )));
        }
        let pipeline = self.store.get_pipeline(resource.pipeline_id).await?;
        if pipeline.destroying {
            return Err(Error::PipelineDestroyed(format!(
                "{}/{}",
                pipeline.team, pipeline.name
            )));
        }
        let config = pipeline.config.resource(&resource.name).ok_or_else(|| {
            Error::Configuration(format!("resource {} missing from its pipeline", resource.name))
        })?;
        let type_ref = resolve_type(&pipeline.config, &config.resource_type)?;

        let owner = ContainerOwner::ResourceCheck { resource_id };
        let (client, handle) = match self.reusable(&owner, now).await? {
            Some(found) => found,
            None => {
                let image = match &type_ref.custom {
                    Some(_) => Some(self.type_image_at(&pipeline, &type_ref, now).await?),
                    None => None,
                };
                let spec = PlacementSpec {
                    team: pipeline.team.clone(),
                    tags: config.tags.clone(),
                    resource_type: Some(type_ref.base_type.clone()),
                    ..Default::default()
                };
                let privileged = type_ref.custom.as_ref().is_some_and(|c| c.privileged);
                self.create(&pipeline, owner, &spec, &type_ref, image, privileged, now)
                    .await?
            }
        };

        let latest = self.store.latest_version(resource.id).await?;
        let request = resource_request(&config.source, None, latest.as_ref().map(|v| &v.version));
        let versions = self
            .run_check(client.as_ref(), &handle, &resource.name, request)
            .await?;

        let floor = latest.map_or(0, |v| v.check_order);
        let mut discovered = Vec::new();
        for version in versions {
            let recorded = self.store.append_version(resource.id, version, vec![]).await?;
            if recorded.check_order > floor {
                discovered.push(recorded);
            }
        }
        if !discovered.is_empty() {
            info!(
                resource = %resource.name,
                discovered = discovered.len(),
                "Discovered new versions"
            );
        }
        Ok(discovered)
    }

    pub async fn type_image(&self, pipeline: &Pipeline, type_ref: &TypeRef) -> Result<String> {
        self.type_image_at(pipeline, type_ref, Utc::now()).await
    }

    /// Image for a custom resource type, found by checking the type's own
    /// source with its base type.
    pub async fn type_image_at(
        &self,
        pipeline: &Pipeline,
        type_ref: &TypeRef,
        now: DateTime<Utc>,
    ) -> Result<String> {
        let Some(custom) = &type_ref.custom else {
            return Err(Error::Internal(format!(
                "{} is not a custom resource type",
                type_ref.name
            )));
        };

        let owner = ContainerOwner::ResourceTypeCheck {
            pipeline_id: pipeline.id,
            resource_type: type_ref.name.clone(),
        };
        let (client, handle) = match self.reusable(&owner, now).await? {
            Some(found) => found,
            None => {
                let spec = PlacementSpec {
                    team: pipeline.team.clone(),
                    resource_type: Some(type_ref.base_type.clone()),
                    ..Default::default()
                };
                self.create(pipeline, owner, &spec, type_ref, None, false, now)
                    .await?
            }
        };

        let request = resource_request(&custom.source, None, None);
        let versions = self
            .run_check(client.as_ref(), &handle, &type_ref.name, request)
            .await?;
        image_reference(&custom.source, versions.last())
    }

    /// A live, unexpired container of `owner` on a worker that is still
    /// alive. Reuse pushes its expiry a full ttl past `now` so the collector
    /// leaves it alone while the check runs.
    async fn reusable(
        &self,
        owner: &ContainerOwner,
        now: DateTime<Utc>,
    ) -> Result<Option<(Arc<dyn WorkerClient>, String)>> {
        let Some(container) = self.containers.find_reusable_at(owner, now).await? else {
            return Ok(None);
        };
        let alive = self.workers.alive_workers_at(now).await?;
        let Some(worker) = alive.iter().find(|w| w.name == container.worker_name) else {
            debug!(handle = %container.handle, "Check container's worker is gone");
            return Ok(None);
        };
        let client = self.workers.connect(worker)?;
        self.containers
            .extend_expiry(&container.handle, now + self.ttl()?)
            .await?;
        Ok(Some((client, container.handle)))
    }

    fn ttl(&self) -> Result<chrono::Duration> {
        chrono::Duration::from_std(self.container_ttl)
            .map_err(|e| Error::InvalidInput(format!("check container ttl: {e}")))
    }

    async fn create(
        &self,
        pipeline: &Pipeline,
        owner: ContainerOwner,
        spec: &PlacementSpec,
        type_ref: &TypeRef,
        image: Option<String>,
        privileged: bool,
        now: DateTime<Utc>,
    ) -> Result<(Arc<dyn WorkerClient>, String)> {
        let placement = self.workers.choose_at(spec, now).await?;
        let image = match image {
            Some(image) => image,
            None => placement
                .worker
                .image_for(&type_ref.base_type)
                .map(str::to_string)
                .ok_or_else(|| {
                    Error::Infrastructure(format!(
                        "worker {} has no image for {}",
                        placement.worker.name, type_ref.base_type
                    ))
                })?,
        };
        let ttl = self.ttl()?;

        let container = launch(
            &self.containers,
            placement.client.as_ref(),
            NewContainer {
                worker_name: placement.worker.name.clone(),
                owner,
                team: pipeline.team.clone(),
                pipeline_id: Some(pipeline.id),
                best_if_used_by: Some(now + ttl),
            },
            ContainerSpec {
                handle: String::new(),
                image,
                privileged,
                env: Default::default(),
                working_dir: Some(BUILD_DIR.to_string()),
                volumes: vec![],
            },
        )
        .await?;
        Ok((placement.client, container.handle))
    }

    async fn run_check(
        &self,
        client: &dyn WorkerClient,
        handle: &str,
        subject: &str,
        request: String,
    ) -> Result<Vec<Version>> {
        let finished = run_process(
            client,
            handle,
            script(CHECK_SCRIPT, vec![], request),
            &CancellationToken::new(),
            |line| debug!(subject, line = %line.content, "check output"),
        )
        .await?;
        if finished.exit_code != 0 {
            return Err(Error::Infrastructure(format!(
                "check of {subject} exited with {}",
                finished.exit_code
            )));
        }
        parse_response(CHECK_SCRIPT, &finished.stdout)
    }
}

/// `repository@digest` when the check reported a digest, otherwise
/// `repository:tag`.
fn image_reference(source: &Params, version: Option<&Version>) -> Result<String> {
    let repository = source
        .get("repository")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::Configuration("custom resource type needs a repository".to_string()))?;
    if let Some(digest) = version.and_then(|v| v.get("digest")) {
        return Ok(format!("{repository}@{digest}"));
    }
    let tag = source.get("tag").and_then(|v| v.as_str()).unwrap_or("latest");
    Ok(format!("{repository}:{tag}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{Fixture, resource};
    use conveyor_config::system::GcConfig;
    use conveyor_core::pipeline::{PipelineConfig, ResourceTypeConfig};
    use serde_json::json;

    #[test]
    fn test_image_reference() {
        let source = Params::from([("repository".to_string(), json!("acme/slack"))]);
        assert_eq!(image_reference(&source, None).unwrap(), "acme/slack:latest");
        let digest = Version::new([("digest", "sha256:abc")]);
        assert_eq!(
            image_reference(&source, Some(&digest)).unwrap(),
            "acme/slack@sha256:abc"
        );
        assert!(image_reference(&Params::new(), None).is_err());
    }

    #[tokio::test]
    async fn test_check_appends_new_versions_and_reuses_container() {
        let f = Fixture::new(PipelineConfig {
            resources: vec![resource("repo", "git")],
            ..Default::default()
        })
        .await;
        let repo = f.resource("repo").await;
        let checker = f.checker();
        let now = Utc::now();

        f.worker
            .set_check_versions(vec![Version::new([("ref", "a")]), Version::new([("ref", "b")])]);
        let found = checker.check_at(repo.id, now).await.unwrap();
        assert_eq!(found.len(), 2);
        assert_eq!(found[1].check_order, 2);

        f.worker.set_check_versions(vec![
            Version::new([("ref", "b")]),
            Version::new([("ref", "c")]),
        ]);
        let found = checker.check_at(repo.id, now).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].version.get("ref"), Some("c"));

        let owner = ContainerOwner::ResourceCheck { resource_id: repo.id };
        assert_eq!(f.containers.owned_by(&owner).await.unwrap().len(), 1);

        // Past the container's best-if-used-by a new one is made.
        let later = now + chrono::Duration::hours(2);
        checker.check_at(repo.id, later).await.unwrap();
        assert_eq!(f.containers.owned_by(&owner).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_reused_container_outlives_its_first_expiry() {
        let f = Fixture::new(PipelineConfig {
            resources: vec![resource("repo", "git")],
            ..Default::default()
        })
        .await;
        let repo = f.resource("repo").await;
        let checker = f.checker();
        let gc = conveyor_gc::GarbageCollector::new(
            f.store.clone(),
            f.workers.clone(),
            GcConfig::default(),
        );
        let ttl = chrono::Duration::from_std(GcConfig::default().check_container_ttl).unwrap();
        let now = Utc::now();

        checker.check_at(repo.id, now).await.unwrap();
        let owner = ContainerOwner::ResourceCheck { resource_id: repo.id };
        let handle = f.containers.owned_by(&owner).await.unwrap()[0].handle.clone();

        // Reused a minute before it would have expired.
        let reuse = now + ttl - chrono::Duration::minutes(1);
        checker.check_at(repo.id, reuse).await.unwrap();
        let containers = f.containers.owned_by(&owner).await.unwrap();
        assert_eq!(containers.len(), 1);
        assert_eq!(containers[0].best_if_used_by, Some(reuse + ttl));

        let report = gc.reconcile_at(now + ttl + chrono::Duration::minutes(1)).await.unwrap();
        assert_eq!(report.expired_destroyed, 0);
        assert!(f.worker.live_handles().contains(&handle));
    }

    #[tokio::test]
    async fn test_failed_check_is_infrastructure_error() {
        let f = Fixture::new(PipelineConfig {
            resources: vec![resource("repo", "git")],
            ..Default::default()
        })
        .await;
        let repo = f.resource("repo").await;
        f.worker.set_exit_code(CHECK_SCRIPT, 1);
        assert!(matches!(
            f.checker().check(repo.id).await,
            Err(Error::Infrastructure(_))
        ));
    }

    #[tokio::test]
    async fn test_custom_type_resolves_through_type_check() {
        let f = Fixture::new(PipelineConfig {
            resource_types: vec![ResourceTypeConfig {
                name: "slack".to_string(),
                base_type: "registry-image".to_string(),
                source: Params::from([("repository".to_string(), json!("acme/slack"))]),
                privileged: true,
                tags: vec![],
            }],
            resources: vec![resource("notify", "slack")],
            ..Default::default()
        })
        .await;
        let notify = f.resource("notify").await;
        f.worker
            .set_check_versions(vec![Version::new([("digest", "sha256:abc")])]);

        f.checker().check(notify.id).await.unwrap();

        let type_owner = ContainerOwner::ResourceTypeCheck {
            pipeline_id: f.pipeline.id,
            resource_type: "slack".to_string(),
        };
        assert_eq!(f.containers.owned_by(&type_owner).await.unwrap().len(), 1);
        let check = &f
            .containers
            .owned_by(&ContainerOwner::ResourceCheck { resource_id: notify.id })
            .await
            .unwrap()[0];
        let spec = f.worker.container(&check.handle).unwrap();
        assert_eq!(spec.image, "acme/slack@sha256:abc");
        assert!(spec.privileged);
    }
}
