//! The authoritative record of which owner justifies each container.

use chrono::{DateTime, Utc};
use conveyor_core::ResourceId;
use conveyor_core::Result;
use conveyor_core::container::{Container, ContainerOwner, ContainerScope, NewContainer};
use conveyor_db::{ContainerRepo, Store};
use std::sync::Arc;
use tracing::{debug, info};

pub struct ContainerRegistry {
    store: Arc<dyn Store>,
}

impl ContainerRegistry {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Record a container before it is created on its worker.
    ///
    /// The returned record carries a fresh handle to pass to the backend.
    /// Fails if the owner's pipeline is being destroyed or its build is
    /// already finished.
    pub async fn track(&self, new: NewContainer) -> Result<Container> {
        let handle = uuid::Uuid::now_v7().to_string();
        let container = self.store.create_container(&handle, new).await?;
        debug!(
            handle = %container.handle,
            worker = %container.worker_name,
            owner = %container.owner,
            "Tracking container"
        );
        Ok(container)
    }

    pub async fn mark_created(&self, handle: &str) -> Result<()> {
        Ok(self.store.mark_container_created(handle).await?)
    }

    /// Drop a record whose container is known not to exist.
    pub async fn forget(&self, handle: &str) -> Result<()> {
        Ok(self.store.delete_container(handle).await?)
    }

    /// Mark every container of `owner` eligible for destruction. Releasing
    /// twice is harmless.
    pub async fn release(&self, owner: &ContainerOwner) -> Result<u64> {
        let released = self.store.release_containers(owner).await?;
        if released > 0 {
            info!(owner = %owner, released, "Released containers");
        }
        Ok(released)
    }

    pub async fn release_pipeline(&self, pipeline_id: ResourceId) -> Result<u64> {
        let released = self.store.release_pipeline_containers(pipeline_id).await?;
        if released > 0 {
            info!(pipeline_id = %pipeline_id, released, "Released pipeline containers");
        }
        Ok(released)
    }

    pub async fn list(&self, scope: &ContainerScope) -> Result<Vec<Container>> {
        Ok(self.store.list_containers(scope).await?)
    }

    pub async fn owned_by(&self, owner: &ContainerOwner) -> Result<Vec<Container>> {
        Ok(self.store.containers_for_owner(owner).await?)
    }

    /// Keep a reused container from expiring before `until`.
    pub async fn extend_expiry(&self, handle: &str, until: DateTime<Utc>) -> Result<()> {
        self.store.extend_container_expiry(handle, until).await?;
        debug!(handle = %handle, until = %until, "Extended container expiry");
        Ok(())
    }

    /// A created, unreleased and unexpired container of `owner`, if any.
    pub async fn find_reusable_at(
        &self,
        owner: &ContainerOwner,
        now: DateTime<Utc>,
    ) -> Result<Option<Container>> {
        Ok(self
            .store
            .containers_for_owner(owner)
            .await?
            .into_iter()
            .find(|c| c.is_reusable_at(now)))
    }
}
