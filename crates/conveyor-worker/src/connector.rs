//! Resolving a registered worker to a client for its container backend.

use conveyor_core::worker::{Worker, WorkerClient};
use conveyor_core::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::docker::DockerWorker;

pub trait WorkerConnector: Send + Sync {
    fn connect(&self, worker: &Worker) -> Result<Arc<dyn WorkerClient>>;

    /// Drop any cached client for a worker that left the pool.
    fn forget(&self, _name: &str) {}
}

/// A fixed set of clients keyed by worker name.
#[derive(Default)]
pub struct StaticConnector {
    clients: Mutex<BTreeMap<String, Arc<dyn WorkerClient>>>,
}

impl StaticConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, client: Arc<dyn WorkerClient>) {
        self.clients
            .lock()
            .insert(client.worker_name().to_string(), client);
    }
}

impl WorkerConnector for StaticConnector {
    fn connect(&self, worker: &Worker) -> Result<Arc<dyn WorkerClient>> {
        self.clients
            .lock()
            .get(&worker.name)
            .cloned()
            .ok_or_else(|| Error::Infrastructure(format!("no client for worker {}", worker.name)))
    }
}

/// Connects to Docker daemons at the workers' advertised addresses.
///
/// Clients are cached per worker and rebuilt when the address changes.
#[derive(Default)]
pub struct DockerConnector {
    clients: Mutex<BTreeMap<String, (String, Arc<dyn WorkerClient>)>>,
}

impl DockerConnector {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WorkerConnector for DockerConnector {
    fn connect(&self, worker: &Worker) -> Result<Arc<dyn WorkerClient>> {
        let mut clients = self.clients.lock();
        if let Some((address, client)) = clients.get(&worker.name) {
            if *address == worker.address {
                return Ok(client.clone());
            }
        }
        let client: Arc<dyn WorkerClient> =
            Arc::new(DockerWorker::connect(&worker.name, &worker.address)?);
        clients.insert(
            worker.name.clone(),
            (worker.address.clone(), client.clone()),
        );
        Ok(client)
    }

    fn forget(&self, name: &str) {
        self.clients.lock().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryWorker;
    use chrono::Utc;
    use conveyor_core::worker::WorkerRegistration;

    fn worker(name: &str) -> Worker {
        Worker::from_registration(
            WorkerRegistration {
                name: name.to_string(),
                platform: "linux".to_string(),
                tags: vec![],
                resource_types: vec![],
                address: format!("memory://{name}"),
                team: None,
            },
            std::time::Duration::from_secs(30),
            Utc::now(),
        )
    }

    #[test]
    fn test_static_connector_resolves_by_name() {
        let connector = StaticConnector::new();
        connector.insert(Arc::new(InMemoryWorker::new("w1")));

        assert_eq!(connector.connect(&worker("w1")).unwrap().worker_name(), "w1");
        assert!(matches!(
            connector.connect(&worker("w2")),
            Err(Error::Infrastructure(_))
        ));
    }
}
