//! Worker pool registry.
//!
//! Workers live in the store so every control-plane instance sees the same
//! pool. A worker is a placement candidate only while its heartbeat is
//! within TTL; expiry never touches the container records it hosts.

use chrono::{DateTime, Utc};
use conveyor_core::container::ContainerOwner;
use conveyor_core::worker::{Worker, WorkerClient, WorkerRegistration};
use conveyor_core::{Error, Result};
use conveyor_db::{ContainerRepo, Store, WorkerRepo};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

use crate::connector::WorkerConnector;

/// What a step needs from the worker it runs on.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PlacementSpec {
    pub team: String,
    pub platform: Option<String>,
    /// Every tag must be carried by the worker.
    pub tags: Vec<String>,
    /// Base resource type the worker must provide an image for.
    pub resource_type: Option<String>,
    /// Owners whose containers make a worker preferable.
    pub affinity: Vec<ContainerOwner>,
}

impl PlacementSpec {
    pub fn for_team(team: impl Into<String>) -> Self {
        Self {
            team: team.into(),
            ..Default::default()
        }
    }

    fn admits(&self, worker: &Worker) -> bool {
        worker.team.as_ref().is_none_or(|t| *t == self.team)
            && self.platform.as_ref().is_none_or(|p| *p == worker.platform)
            && worker.has_tags(&self.tags)
            && self
                .resource_type
                .as_ref()
                .is_none_or(|t| worker.supports_type(t))
    }
}

impl std::fmt::Display for PlacementSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "team={}", self.team)?;
        if let Some(platform) = &self.platform {
            write!(f, " platform={platform}")?;
        }
        if !self.tags.is_empty() {
            write!(f, " tags={}", self.tags.join(","))?;
        }
        if let Some(resource_type) = &self.resource_type {
            write!(f, " type={resource_type}")?;
        }
        Ok(())
    }
}

/// A chosen worker and a client for its container backend.
#[derive(Clone)]
pub struct Placement {
    pub worker: Worker,
    pub client: Arc<dyn WorkerClient>,
}

pub struct WorkerRegistry {
    store: Arc<dyn Store>,
    connector: Arc<dyn WorkerConnector>,
}

impl WorkerRegistry {
    pub fn new(store: Arc<dyn Store>, connector: Arc<dyn WorkerConnector>) -> Self {
        Self { store, connector }
    }

    pub async fn register(&self, reg: WorkerRegistration, ttl: Duration) -> Result<Worker> {
        self.register_at(reg, ttl, Utc::now()).await
    }

    pub async fn register_at(
        &self,
        reg: WorkerRegistration,
        ttl: Duration,
        now: DateTime<Utc>,
    ) -> Result<Worker> {
        if reg.name.trim().is_empty() {
            return Err(Error::InvalidInput("worker name is empty".to_string()));
        }
        let worker = self
            .store
            .save_worker(Worker::from_registration(reg, ttl, now))
            .await?;
        debug!(worker = %worker.name, expires_at = %worker.expires_at, "Worker registered");
        Ok(worker)
    }

    pub async fn heartbeat(&self, name: &str) -> Result<Worker> {
        self.heartbeat_at(name, Utc::now()).await
    }

    pub async fn heartbeat_at(&self, name: &str, now: DateTime<Utc>) -> Result<Worker> {
        Ok(self.store.heartbeat_worker(name, now).await?)
    }

    /// Remove a worker and forget the containers recorded against it.
    pub async fn remove(&self, name: &str) -> Result<()> {
        self.store.delete_worker(name).await?;
        info!(worker = %name, "Worker removed");
        Ok(())
    }

    pub async fn workers(&self) -> Result<Vec<Worker>> {
        Ok(self.store.list_workers().await?)
    }

    pub async fn alive_workers_at(&self, now: DateTime<Utc>) -> Result<Vec<Worker>> {
        Ok(self
            .store
            .list_workers()
            .await?
            .into_iter()
            .filter(|w| w.is_alive_at(now))
            .collect())
    }

    /// Alive workers admitted by `spec`, best first.
    pub async fn select_candidates(&self, spec: &PlacementSpec) -> Result<Vec<Worker>> {
        self.select_candidates_at(spec, Utc::now()).await
    }

    /// Workers already holding a container of one of the affinity owners
    /// come first, then the least loaded ones. Ties break on name.
    pub async fn select_candidates_at(
        &self,
        spec: &PlacementSpec,
        now: DateTime<Utc>,
    ) -> Result<Vec<Worker>> {
        let mut candidates: Vec<Worker> = self
            .alive_workers_at(now)
            .await?
            .into_iter()
            .filter(|w| spec.admits(w))
            .collect();
        if candidates.is_empty() {
            return Ok(candidates);
        }

        let mut affine = BTreeSet::new();
        for owner in &spec.affinity {
            for container in self.store.containers_for_owner(owner).await? {
                if !container.is_released() {
                    affine.insert(container.worker_name);
                }
            }
        }
        let load = self.store.container_counts().await?;

        candidates.sort_by(|a, b| {
            let a_key = (
                !affine.contains(&a.name),
                load.get(&a.name).copied().unwrap_or(0),
            );
            let b_key = (
                !affine.contains(&b.name),
                load.get(&b.name).copied().unwrap_or(0),
            );
            a_key.cmp(&b_key).then_with(|| a.name.cmp(&b.name))
        });
        Ok(candidates)
    }

    /// Pick the best candidate for `spec` and connect to it.
    pub async fn choose(&self, spec: &PlacementSpec) -> Result<Placement> {
        self.choose_at(spec, Utc::now()).await
    }

    pub async fn choose_at(&self, spec: &PlacementSpec, now: DateTime<Utc>) -> Result<Placement> {
        let worker = self
            .select_candidates_at(spec, now)
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| Error::Infrastructure(format!("no worker satisfies {spec}")))?;
        let client = self.connector.connect(&worker)?;
        Ok(Placement { worker, client })
    }

    /// Client for a named worker, alive or not.
    pub async fn client(&self, name: &str) -> Result<Arc<dyn WorkerClient>> {
        let worker = self.store.get_worker(name).await?;
        self.connector.connect(&worker)
    }

    pub fn connect(&self, worker: &Worker) -> Result<Arc<dyn WorkerClient>> {
        self.connector.connect(worker)
    }

    /// Drop workers expired for longer than `grace`, along with their
    /// container records, which are unreachable from now on.
    pub async fn prune_expired_at(
        &self,
        grace: Duration,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>> {
        let grace = chrono::Duration::from_std(grace)
            .map_err(|e| Error::InvalidInput(format!("prune grace: {e}")))?;
        let pruned = self.store.prune_expired_workers(now - grace).await?;
        for name in &pruned {
            self.connector.forget(name);
            info!(worker = %name, "Pruned expired worker");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::StaticConnector;
    use crate::memory::InMemoryWorker;
    use conveyor_core::ResourceId;
    use conveyor_core::container::NewContainer;
    use conveyor_core::worker::WorkerResourceType;
    use conveyor_db::MemoryStore;

    fn registration(name: &str, tags: &[&str]) -> WorkerRegistration {
        WorkerRegistration {
            name: name.to_string(),
            platform: "linux".to_string(),
            tags: tags.iter().map(|t| t.to_string()).collect(),
            resource_types: vec![WorkerResourceType {
                type_name: "git".to_string(),
                image: "conveyor/git-resource".to_string(),
            }],
            address: format!("memory://{name}"),
            team: None,
        }
    }

    fn registry() -> (Arc<MemoryStore>, WorkerRegistry) {
        let store = Arc::new(MemoryStore::new());
        let connector = Arc::new(StaticConnector::new());
        for name in ["w1", "w2", "w3"] {
            connector.insert(Arc::new(InMemoryWorker::new(name)));
        }
        let registry = WorkerRegistry::new(store.clone(), connector);
        (store, registry)
    }

    #[tokio::test]
    async fn test_expired_workers_are_not_candidates() {
        let (_, registry) = registry();
        let now = Utc::now();
        registry
            .register_at(registration("w1", &[]), Duration::from_secs(30), now)
            .await
            .unwrap();

        let spec = PlacementSpec::for_team("main");
        let soon = now + chrono::Duration::seconds(10);
        assert_eq!(registry.select_candidates_at(&spec, soon).await.unwrap().len(), 1);

        let late = now + chrono::Duration::seconds(31);
        assert!(registry.select_candidates_at(&spec, late).await.unwrap().is_empty());

        registry.heartbeat_at("w1", late).await.unwrap();
        assert_eq!(registry.select_candidates_at(&spec, late).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_candidates_filter_on_tags_type_and_team() {
        let (_, registry) = registry();
        let now = Utc::now();
        let ttl = Duration::from_secs(60);
        registry.register_at(registration("w1", &["gpu"]), ttl, now).await.unwrap();
        registry.register_at(registration("w2", &[]), ttl, now).await.unwrap();
        let mut private = registration("w3", &["gpu"]);
        private.team = Some("ops".to_string());
        registry.register_at(private, ttl, now).await.unwrap();

        let spec = PlacementSpec {
            tags: vec!["gpu".to_string()],
            ..PlacementSpec::for_team("main")
        };
        let names: Vec<String> = registry
            .select_candidates_at(&spec, now)
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.name)
            .collect();
        assert_eq!(names, vec!["w1"]);

        let spec = PlacementSpec {
            resource_type: Some("s3".to_string()),
            ..PlacementSpec::for_team("main")
        };
        assert!(registry.select_candidates_at(&spec, now).await.unwrap().is_empty());
        assert!(matches!(
            registry.choose_at(&spec, now).await,
            Err(Error::Infrastructure(_))
        ));
    }

    #[tokio::test]
    async fn test_affinity_is_preferred_but_not_required() {
        let (store, registry) = registry();
        let now = Utc::now();
        let ttl = Duration::from_secs(60);
        registry.register_at(registration("w1", &[]), ttl, now).await.unwrap();
        registry.register_at(registration("w2", &[]), ttl, now).await.unwrap();

        let owner = ContainerOwner::ResourceCheck {
            resource_id: ResourceId::new(),
        };
        store
            .create_container(
                "h1",
                NewContainer {
                    worker_name: "w2".to_string(),
                    owner: owner.clone(),
                    team: "main".to_string(),
                    pipeline_id: None,
                    best_if_used_by: None,
                },
            )
            .await
            .unwrap();

        let spec = PlacementSpec {
            affinity: vec![owner],
            ..PlacementSpec::for_team("main")
        };
        let placement = registry.choose_at(&spec, now).await.unwrap();
        assert_eq!(placement.worker.name, "w2");
        assert_eq!(placement.client.worker_name(), "w2");

        // Without affinity the less loaded worker wins.
        let placement = registry
            .choose_at(&PlacementSpec::for_team("main"), now)
            .await
            .unwrap();
        assert_eq!(placement.worker.name, "w1");
    }

    #[tokio::test]
    async fn test_prune_drops_long_expired_workers() {
        let (store, registry) = registry();
        let now = Utc::now();
        registry
            .register_at(registration("w1", &[]), Duration::from_secs(30), now)
            .await
            .unwrap();

        let grace = Duration::from_secs(60);
        let pruned = registry
            .prune_expired_at(grace, now + chrono::Duration::seconds(60))
            .await
            .unwrap();
        assert!(pruned.is_empty());

        let pruned = registry
            .prune_expired_at(grace, now + chrono::Duration::seconds(91))
            .await
            .unwrap();
        assert_eq!(pruned, vec!["w1".to_string()]);
        assert!(store.find_worker("w1").await.unwrap().is_none());
    }
}
