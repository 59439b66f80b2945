//! Core domain types and traits for the Conveyor CI orchestrator.
//!
//! This crate contains:
//! - Resource identifiers and the error taxonomy
//! - Pipeline, job and resource configuration
//! - Resource versions and builds
//! - Build plans (the executable step tree)
//! - Workers, containers and the container backend trait

pub mod build;
pub mod container;
pub mod error;
pub mod id;
pub mod pipeline;
pub mod plan;
pub mod version;
pub mod worker;

pub use error::{Error, Result};
pub use id::ResourceId;
