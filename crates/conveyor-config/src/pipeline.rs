//! Pipeline configuration parsing.
//!
//! ```kdl
//! resource-type "pull-request" type="registry-image" {
//!     source { repository "example/pr-resource" }
//! }
//!
//! resource "repo" type="git" {
//!     source { uri "https://example.com/app.git" }
//! }
//!
//! job "unit" max-in-flight=2 {
//!     plan {
//!         get "repo" trigger=#true
//!         task "test" {
//!             image "rust:1.85"
//!             run "cargo" "test" dir="repo"
//!             inputs "repo"
//!         }
//!     }
//! }
//! ```

use crate::kdl_util::{
    get_all_string_args, get_bool_prop, get_first_string_arg, get_flag_arg,
    get_string_list_prop, get_string_prop, get_u64_prop, node_to_params, value_to_json,
};
use crate::validate::validate_pipeline;
use crate::{ConfigError, ConfigResult, Variables};
use conveyor_core::pipeline::{
    GetStep, JobConfig, PipelineConfig, PutStep, ResourceConfig, ResourceTypeConfig, RunConfig,
    StepConfig, TaskConfig, TaskStep, VersionPolicy,
};
use conveyor_core::version::Version;
use kdl::{KdlDocument, KdlNode};
use std::collections::BTreeMap;

/// Parse and validate a pipeline configuration from KDL text.
pub fn parse_pipeline(kdl: &str) -> ConfigResult<PipelineConfig> {
    let doc: KdlDocument = kdl.parse()?;

    let mut config = PipelineConfig::default();

    for node in doc.nodes() {
        match node.name().value() {
            "resource-type" => config.resource_types.push(parse_resource_type(node)?),
            "resource" => config.resources.push(parse_resource(node)?),
            "job" => config.jobs.push(parse_job(node)?),
            _ => {} // Ignore unknown nodes
        }
    }

    validate_pipeline(&config)?;
    Ok(config)
}

/// Substitute `((var))` placeholders, then parse.
pub fn parse_pipeline_with_vars(kdl: &str, vars: &Variables) -> ConfigResult<PipelineConfig> {
    let text = vars.interpolate(kdl)?;
    parse_pipeline(&text)
}

fn parse_resource_type(node: &KdlNode) -> ConfigResult<ResourceTypeConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource-type name".to_string()))?;
    let base_type = get_string_prop(node, "type").ok_or_else(|| {
        ConfigError::MissingField(format!("type for resource-type '{name}'"))
    })?;

    let mut source = BTreeMap::new();
    let mut privileged = get_bool_prop(node, "privileged").unwrap_or(false);

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "source" => source = node_to_params(child),
                "privileged" => privileged = get_flag_arg(child),
                _ => {}
            }
        }
    }

    Ok(ResourceTypeConfig {
        tags: get_string_list_prop(node, "tags"),
        name,
        base_type,
        source,
        privileged,
    })
}

fn parse_resource(node: &KdlNode) -> ConfigResult<ResourceConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("resource name".to_string()))?;
    let resource_type = get_string_prop(node, "type")
        .ok_or_else(|| ConfigError::MissingField(format!("type for resource '{name}'")))?;

    let source = node
        .children()
        .and_then(|c| c.nodes().iter().find(|n| n.name().value() == "source"))
        .map(node_to_params)
        .unwrap_or_default();

    Ok(ResourceConfig {
        tags: get_string_list_prop(node, "tags"),
        name,
        resource_type,
        source,
    })
}

fn parse_job(node: &KdlNode) -> ConfigResult<JobConfig> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("job name".to_string()))?;

    let serial = get_bool_prop(node, "serial").unwrap_or(false);
    let max_in_flight = match get_u64_prop(node, "max-in-flight")? {
        None => None,
        Some(0) => {
            return Err(ConfigError::InvalidValue {
                field: "max-in-flight".to_string(),
                message: format!("job '{name}' must allow at least one build"),
            });
        }
        Some(n) => Some(u32::try_from(n).map_err(|_| ConfigError::InvalidValue {
            field: "max-in-flight".to_string(),
            message: format!("{n} is too large"),
        })?),
    };

    let mut plan = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            if child.name().value() == "plan" {
                plan.extend(parse_steps(child)?);
            }
        }
    }

    Ok(JobConfig {
        serial_groups: get_string_list_prop(node, "serial-groups"),
        name,
        plan,
        serial,
        max_in_flight,
    })
}

fn parse_steps(node: &KdlNode) -> ConfigResult<Vec<StepConfig>> {
    let mut steps = Vec::new();
    if let Some(children) = node.children() {
        for child in children.nodes() {
            steps.push(parse_step(child)?);
        }
    }
    Ok(steps)
}

fn parse_step(node: &KdlNode) -> ConfigResult<StepConfig> {
    match node.name().value() {
        "get" => parse_get(node).map(StepConfig::Get),
        "task" => parse_task(node).map(StepConfig::Task),
        "put" => parse_put(node).map(StepConfig::Put),
        "do" => Ok(StepConfig::Do {
            steps: parse_steps(node)?,
        }),
        "in-parallel" => Ok(StepConfig::InParallel {
            steps: parse_steps(node)?,
        }),
        other => Err(ConfigError::InvalidValue {
            field: "step".to_string(),
            message: format!("unknown step kind: {other}"),
        }),
    }
}

fn parse_get(node: &KdlNode) -> ConfigResult<GetStep> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("get step name".to_string()))?;
    let resource = get_string_prop(node, "resource").unwrap_or_else(|| name.clone());
    let trigger = get_bool_prop(node, "trigger").unwrap_or(false);

    let mut version = VersionPolicy::Latest;
    let mut params = BTreeMap::new();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "params" => params = node_to_params(child),
                "version" => version = parse_version_policy(&name, child)?,
                _ => {}
            }
        }
    }

    Ok(GetStep {
        passed: get_string_list_prop(node, "passed"),
        tags: get_string_list_prop(node, "tags"),
        name,
        resource,
        trigger,
        version,
        params,
    })
}

fn parse_version_policy(step: &str, node: &KdlNode) -> ConfigResult<VersionPolicy> {
    if node.children().is_none() {
        return match get_first_string_arg(node).as_deref() {
            None | Some("latest") => Ok(VersionPolicy::Latest),
            Some(other) => Err(ConfigError::InvalidValue {
                field: format!("version of get '{step}'"),
                message: format!("expected \"latest\" or a version block, got '{other}'"),
            }),
        };
    }

    let mut pairs = Vec::new();
    for (key, value) in node_to_params(node) {
        let value = match value {
            serde_json::Value::String(s) => s,
            other => other.to_string(),
        };
        pairs.push((key, value));
    }
    if pairs.is_empty() {
        return Err(ConfigError::InvalidValue {
            field: format!("version of get '{step}'"),
            message: "pinned version is empty".to_string(),
        });
    }
    Ok(VersionPolicy::Pinned(Version::new(pairs)))
}

fn parse_task(node: &KdlNode) -> ConfigResult<TaskStep> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("task name".to_string()))?;

    let mut privileged = get_bool_prop(node, "privileged").unwrap_or(false);
    let mut config = TaskConfig::default();

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "image" => config.image = get_first_string_arg(child).unwrap_or_default(),
                "platform" => config.platform = get_first_string_arg(child),
                "run" => {
                    let mut args = get_all_string_args(child).into_iter();
                    config.run = RunConfig {
                        path: args.next().unwrap_or_default(),
                        args: args.collect(),
                        dir: get_string_prop(child, "dir"),
                    };
                }
                "env" => {
                    if let Some(vars) = child.children() {
                        for var in vars.nodes() {
                            let value = var
                                .entries()
                                .iter()
                                .find(|e| e.name().is_none())
                                .map(|e| match value_to_json(e.value()) {
                                    serde_json::Value::String(s) => s,
                                    other => other.to_string(),
                                })
                                .unwrap_or_default();
                            config.env.insert(var.name().value().to_string(), value);
                        }
                    }
                }
                "privileged" => privileged = get_flag_arg(child),
                _ => {}
            }
        }
    }

    config.inputs = get_string_list_prop(node, "inputs");
    config.outputs = get_string_list_prop(node, "outputs");
    config.caches = get_string_list_prop(node, "caches");

    if config.image.is_empty() {
        return Err(ConfigError::MissingField(format!("image for task '{name}'")));
    }
    if config.run.path.is_empty() {
        return Err(ConfigError::MissingField(format!("run path for task '{name}'")));
    }

    Ok(TaskStep {
        tags: get_string_list_prop(node, "tags"),
        name,
        config,
        privileged,
    })
}

fn parse_put(node: &KdlNode) -> ConfigResult<PutStep> {
    let name = get_first_string_arg(node)
        .ok_or_else(|| ConfigError::MissingField("put step name".to_string()))?;
    let resource = get_string_prop(node, "resource").unwrap_or_else(|| name.clone());

    let mut params = BTreeMap::new();
    let mut inputs = None;

    if let Some(children) = node.children() {
        for child in children.nodes() {
            match child.name().value() {
                "params" => params = node_to_params(child),
                "inputs" => inputs = Some(get_all_string_args(child)),
                _ => {}
            }
        }
    }

    Ok(PutStep {
        tags: get_string_list_prop(node, "tags"),
        name,
        resource,
        params,
        inputs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PIPELINE: &str = r#"
        resource-type "pr" type="registry-image" {
            source { repository "example/pr-resource" }
        }

        resource "repo" type="git" {
            source {
                uri "https://example.com/app.git"
                branch "main"
            }
        }

        resource "image" type="registry-image" {
            source { repository "example/app" }
        }

        job "unit" max-in-flight=2 {
            plan {
                get "repo" trigger=#true
                task "test" {
                    image "rust:1.85"
                    run "cargo" "test" dir="repo"
                    inputs "repo"
                    caches "repo/target"
                    env {
                        RUST_LOG "debug"
                    }
                }
            }
        }

        job "publish" serial=#true {
            serial-groups "deploy"
            plan {
                in-parallel {
                    get "repo" trigger=#true {
                        passed "unit"
                    }
                }
                put "image" {
                    params { build "repo" }
                    inputs "repo"
                }
            }
        }
    "#;

    #[test]
    fn test_parse_full_pipeline() {
        let config = parse_pipeline(PIPELINE).unwrap();

        assert_eq!(config.resource_types.len(), 1);
        assert_eq!(config.resource_types[0].base_type, "registry-image");
        assert_eq!(config.resources.len(), 2);
        assert_eq!(
            config.resource("repo").unwrap().source["branch"],
            "main"
        );

        let unit = config.job("unit").unwrap();
        assert_eq!(unit.max_in_flight, Some(2));
        assert!(!unit.serial);
        let StepConfig::Task(task) = &unit.plan[1] else {
            panic!("expected a task step");
        };
        assert_eq!(task.config.run.path, "cargo");
        assert_eq!(task.config.run.args, vec!["test"]);
        assert_eq!(task.config.run.dir.as_deref(), Some("repo"));
        assert_eq!(task.config.inputs, vec!["repo"]);
        assert_eq!(task.config.caches, vec!["repo/target"]);
        assert_eq!(task.config.env["RUST_LOG"], "debug");

        let publish = config.job("publish").unwrap();
        assert!(publish.serial);
        assert_eq!(publish.serial_groups, vec!["deploy"]);
        let gets = publish.inputs();
        assert_eq!(gets.len(), 1);
        assert_eq!(gets[0].passed, vec!["unit"]);
        assert!(gets[0].trigger);
        let puts = publish.outputs();
        assert_eq!(puts[0].resource, "image");
        assert_eq!(puts[0].inputs, Some(vec!["repo".to_string()]));
    }

    #[test]
    fn test_pinned_version() {
        let kdl = r#"
            resource "repo" type="git"
            job "j" {
                plan {
                    get "src" resource="repo" {
                        version { ref "abc123" }
                    }
                }
            }
        "#;
        let config = parse_pipeline(kdl).unwrap();
        let get = config.jobs[0].inputs()[0].clone();
        assert_eq!(get.resource, "repo");
        assert_eq!(
            get.version,
            VersionPolicy::Pinned(Version::new([("ref", "abc123")]))
        );
    }

    #[test]
    fn test_task_requires_image() {
        let kdl = r#"
            job "j" {
                plan {
                    task "t" {
                        run "true"
                    }
                }
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::MissingField(_)
        ));
    }

    #[test]
    fn test_unknown_step_kind() {
        let kdl = r#"
            job "j" {
                plan {
                    deploy "x"
                }
            }
        "#;
        assert!(matches!(
            parse_pipeline(kdl).unwrap_err(),
            ConfigError::InvalidValue { .. }
        ));
    }

    #[test]
    fn test_zero_max_in_flight_rejected() {
        let kdl = r#"
            job "j" max-in-flight=0 {
                plan {
                    task "t" {
                        image "alpine"
                        run "true"
                    }
                }
            }
        "#;
        assert!(parse_pipeline(kdl).is_err());
    }

    #[test]
    fn test_parse_with_vars() {
        let kdl = r#"
            resource "repo" type="git" {
                source { uri "((uri))" }
            }
            job "j" {
                plan {
                    get "repo"
                }
            }
        "#;
        let vars = Variables::new().with("uri", "https://example.com/x.git");
        let config = parse_pipeline_with_vars(kdl, &vars).unwrap();
        assert_eq!(
            config.resources[0].source["uri"],
            "https://example.com/x.git"
        );

        assert!(matches!(
            parse_pipeline_with_vars(kdl, &Variables::new()).unwrap_err(),
            ConfigError::UnresolvedVariable(_)
        ));
    }
}
