//! Container lifecycle for Conveyor CI.
//!
//! The [`ContainerRegistry`] records why every container exists; the
//! [`GarbageCollector`] reconciles those records against what workers
//! actually run and destroys whatever lost its owner.

pub mod collector;
pub mod registry;

pub use collector::{GarbageCollector, ReconcileReport};
pub use registry::ContainerRegistry;
