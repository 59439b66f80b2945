//! Static checks over a parsed pipeline.

use crate::{ConfigError, ConfigResult};
use conveyor_core::pipeline::{JobConfig, PipelineConfig, StepConfig};
use std::collections::{HashMap, HashSet};

/// Check names, references and `passed` constraints.
///
/// Resource types are only checked against each other here; whether a base
/// type exists depends on the workers, see [`check_resource_types`].
pub fn validate_pipeline(config: &PipelineConfig) -> ConfigResult<()> {
    check_unique("resource-type", config.resource_types.iter().map(|t| t.name.as_str()))?;
    check_unique("resource", config.resources.iter().map(|r| r.name.as_str()))?;
    check_unique("job", config.jobs.iter().map(|j| j.name.as_str()))?;

    for job in &config.jobs {
        validate_job(config, job)?;
    }

    if let Err(cycle) = detect_passed_cycle(&config.jobs) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    if let Err(cycle) = detect_type_cycle(config) {
        return Err(ConfigError::CycleDetected(cycle));
    }

    Ok(())
}

/// Every resource must use a known type, and every custom type must bottom
/// out in one of `base_types`.
pub fn check_resource_types<S: AsRef<str>>(
    config: &PipelineConfig,
    base_types: &[S],
) -> ConfigResult<()> {
    let is_base = |name: &str| base_types.iter().any(|b| b.as_ref() == name);

    for resource in &config.resources {
        if config.resource_type(&resource.resource_type).is_none()
            && !is_base(&resource.resource_type)
        {
            return Err(ConfigError::InvalidReference(format!(
                "resource '{}' uses unknown type '{}'",
                resource.name, resource.resource_type
            )));
        }
    }

    for custom in &config.resource_types {
        let mut current = custom.base_type.as_str();
        let mut seen = HashSet::new();
        while let Some(next) = config.resource_type(current) {
            if !seen.insert(current) {
                return Err(ConfigError::CycleDetected(format!(
                    "resource type '{}' refers to itself",
                    custom.name
                )));
            }
            current = next.base_type.as_str();
        }
        if !is_base(current) {
            return Err(ConfigError::InvalidReference(format!(
                "resource type '{}' is fetched with unknown type '{current}'",
                custom.name
            )));
        }
    }

    Ok(())
}

fn check_unique<'a>(kind: &str, names: impl Iterator<Item = &'a str>) -> ConfigResult<()> {
    let mut seen = HashSet::new();
    for name in names {
        if !seen.insert(name) {
            return Err(ConfigError::Duplicate(format!("{kind} '{name}'")));
        }
    }
    Ok(())
}

fn validate_job(config: &PipelineConfig, job: &JobConfig) -> ConfigResult<()> {
    if job.plan.is_empty() {
        return Err(ConfigError::MissingField(format!("plan for job '{}'", job.name)));
    }

    let mut step_names = HashSet::new();
    for step in &job.plan {
        collect_step_names(&job.name, step, &mut step_names)?;
    }

    for get in job.inputs() {
        if config.resource(&get.resource).is_none() {
            return Err(ConfigError::InvalidReference(format!(
                "job '{}' gets unknown resource '{}'",
                job.name, get.resource
            )));
        }

        for upstream in &get.passed {
            if upstream == &job.name {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' lists itself in passed for '{}'",
                    job.name, get.name
                )));
            }
            let upstream_job = config.job(upstream).ok_or_else(|| {
                ConfigError::InvalidReference(format!(
                    "job '{}' requires '{}' to pass unknown job '{upstream}'",
                    job.name, get.name
                ))
            })?;
            if !touches_resource(upstream_job, &get.resource) {
                return Err(ConfigError::InvalidReference(format!(
                    "job '{}' requires '{}' to pass '{upstream}', which never uses resource '{}'",
                    job.name, get.name, get.resource
                )));
            }
        }
    }

    for put in job.outputs() {
        if config.resource(&put.resource).is_none() {
            return Err(ConfigError::InvalidReference(format!(
                "job '{}' puts to unknown resource '{}'",
                job.name, put.resource
            )));
        }
    }

    Ok(())
}

fn collect_step_names<'a>(
    job: &str,
    step: &'a StepConfig,
    seen: &mut HashSet<&'a str>,
) -> ConfigResult<()> {
    let name = match step {
        StepConfig::Get(get) => &get.name,
        StepConfig::Task(task) => &task.name,
        StepConfig::Put(put) => &put.name,
        StepConfig::Do { steps } | StepConfig::InParallel { steps } => {
            for child in steps {
                collect_step_names(job, child, seen)?;
            }
            return Ok(());
        }
    };
    if !seen.insert(name.as_str()) {
        return Err(ConfigError::Duplicate(format!("step '{name}' in job '{job}'")));
    }
    Ok(())
}

fn touches_resource(job: &JobConfig, resource: &str) -> bool {
    job.inputs().iter().any(|g| g.resource == resource)
        || job.outputs().iter().any(|p| p.resource == resource)
}

/// Detect cycles in the `passed` graph using DFS.
fn detect_passed_cycle(jobs: &[JobConfig]) -> Result<(), String> {
    let upstreams: HashMap<&str, Vec<&str>> = jobs
        .iter()
        .map(|job| {
            let deps = job
                .inputs()
                .iter()
                .flat_map(|g| g.passed.iter().map(String::as_str))
                .collect();
            (job.name.as_str(), deps)
        })
        .collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();

    for job in jobs {
        if !visited.contains(job.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(job.name.as_str(), &upstreams, &mut visited, &mut rec_stack)
            {
                return Err(cycle);
            }
        }
    }
    Ok(())
}

fn dfs_detect_cycle<'a>(
    node: &'a str,
    graph: &HashMap<&'a str, Vec<&'a str>>,
    visited: &mut HashSet<&'a str>,
    rec_stack: &mut HashSet<&'a str>,
) -> Option<String> {
    visited.insert(node);
    rec_stack.insert(node);

    if let Some(deps) = graph.get(node) {
        for &dep in deps {
            if !visited.contains(dep) {
                if let Some(cycle) = dfs_detect_cycle(dep, graph, visited, rec_stack) {
                    return Some(cycle);
                }
            } else if rec_stack.contains(dep) {
                return Some(format!("{node} -> {dep}"));
            }
        }
    }

    rec_stack.remove(node);
    None
}

fn detect_type_cycle(config: &PipelineConfig) -> Result<(), String> {
    let graph: HashMap<&str, Vec<&str>> = config
        .resource_types
        .iter()
        .map(|t| (t.name.as_str(), vec![t.base_type.as_str()]))
        .collect();

    let mut visited = HashSet::new();
    let mut rec_stack = HashSet::new();
    for t in &config.resource_types {
        if !visited.contains(t.name.as_str()) {
            if let Some(cycle) =
                dfs_detect_cycle(t.name.as_str(), &graph, &mut visited, &mut rec_stack)
            {
                return Err(format!("resource types {cycle}"));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parse_pipeline;

    #[test]
    fn test_passed_must_reference_existing_job() {
        let kdl = r#"
            resource "repo" type="git"
            job "deploy" {
                plan {
                    get "repo" { passed "build" }
                }
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidReference(_)
        ));
    }

    #[test]
    fn test_passed_job_must_use_resource() {
        let kdl = r#"
            resource "repo" type="git"
            resource "other" type="git"
            job "build" {
                plan {
                    get "other"
                }
            }
            job "deploy" {
                plan {
                    get "repo" { passed "build" }
                }
            }
        "#;
        let err = parse_pipeline(kdl).unwrap_err();
        assert!(err.to_string().contains("never uses resource"));
    }

    #[test]
    fn test_detect_passed_cycle() {
        let kdl = r#"
            resource "repo" type="git"
            job "a" {
                plan {
                    get "repo" { passed "b" }
                }
            }
            job "b" {
                plan {
                    get "repo" { passed "a" }
                }
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::CycleDetected(_)
        ));
    }

    #[test]
    fn test_duplicate_names() {
        let kdl = r#"
            resource "repo" type="git"
            resource "repo" type="git"
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));

        let kdl = r#"
            resource "repo" type="git"
            job "j" {
                plan {
                    get "repo"
                    in-parallel {
                        get "repo"
                    }
                }
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::Duplicate(_)
        ));
    }

    #[test]
    fn test_empty_plan_rejected() {
        let kdl = r#"
            job "j"
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_resource_type_cycle() {
        let kdl = r#"
            resource-type "a" type="b"
            resource-type "b" type="a"
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::CycleDetected(_)
        ));
    }

    #[test]
    fn test_check_resource_types() {
        let kdl = r#"
            resource-type "pr" type="registry-image"
            resource "a" type="git"
            resource "b" type="pr"
            job "j" {
                plan {
                    get "a"
                    get "b"
                }
            }
        "#;
        let config = parse_pipeline(kdl).unwrap();
        assert!(check_resource_types(&config, &["git", "registry-image"]).is_ok());
        assert!(check_resource_types(&config, &["git"]).is_err());
        assert!(check_resource_types(&config, &["registry-image"]).is_err());
    }
}
