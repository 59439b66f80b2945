//! CLI command implementations.

pub mod builds;
pub mod client;
pub mod jobs;
pub mod pipelines;
pub mod resources;
pub mod workers;

use anyhow::{Context, Result};
use conveyor_config::{SystemConfig, Variables, check_resource_types, parse_pipeline_with_vars, validate_pipeline};

/// Check a pipeline file locally without contacting the server.
pub fn validate(path: &str, vars: &[String], strict: bool) -> Result<()> {
    let content =
        std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    let vars = Variables::from_assignments(vars)?;
    let config = parse_pipeline_with_vars(&content, &vars)
        .with_context(|| format!("failed to parse {path}"))?;
    validate_pipeline(&config)?;
    if strict {
        check_resource_types(&config, &SystemConfig::default().base_resource_types)?;
    }
    println!(
        "Configuration is valid: {} resources, {} jobs",
        config.resources.len(),
        config.jobs.len()
    );
    Ok(())
}
