//! Worker pool for Conveyor CI.
//!
//! Provides:
//! - The worker registry: registration, heartbeats, placement
//! - Connectors resolving workers to container backends
//! - Docker and in-memory container backends
//! - A heartbeat beacon for statically configured workers

pub mod beacon;
pub mod connector;
pub mod docker;
pub mod memory;
pub mod registry;

pub use beacon::WorkerBeacon;
pub use connector::{DockerConnector, StaticConnector, WorkerConnector};
pub use docker::DockerWorker;
pub use memory::InMemoryWorker;
pub use registry::{Placement, PlacementSpec, WorkerRegistry};
