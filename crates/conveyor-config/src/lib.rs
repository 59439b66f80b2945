//! KDL configuration parsing for the Conveyor CI orchestrator.
//!
//! This crate handles parsing of:
//! - Pipeline definitions (resources, resource types, jobs and their plans)
//! - System configuration for the server
//! - `((var))` interpolation applied before parsing
//! - Static validation of pipeline references

mod kdl_util;
pub mod error;
pub mod pipeline;
pub mod system;
pub mod validate;
pub mod variables;

pub use error::{ConfigError, ConfigResult};
pub use pipeline::{parse_pipeline, parse_pipeline_with_vars};
pub use system::{SystemConfig, load_system_config, parse_system_config};
pub use validate::{check_resource_types, validate_pipeline};
pub use variables::Variables;
