//! Pipeline commands.

use anyhow::{Context, Result};
use conveyor_config::Variables;
use conveyor_core::build::Build;
use conveyor_core::pipeline::{Pipeline, RunConfig, TaskConfig, TaskStep};
use serde_json::{Value, json};

use super::client::ApiClient;

pub async fn list(client: &ApiClient, team: Option<String>) -> Result<()> {
    let query: Vec<(&str, String)> = team.into_iter().map(|t| ("team", t)).collect();
    let pipelines: Vec<Pipeline> = client.get_query("pipelines", &query).await?;
    for p in pipelines {
        let state = if p.destroying {
            "destroying"
        } else if p.paused {
            "paused"
        } else {
            "active"
        };
        println!("{}/{}\t{}\tv{}\t{}", p.team, p.name, state, p.config_version, p.id);
    }
    Ok(())
}

pub async fn set(
    client: &ApiClient,
    team: &str,
    name: &str,
    config_path: &str,
    vars: &[String],
) -> Result<()> {
    let kdl = std::fs::read_to_string(config_path)
        .with_context(|| format!("failed to read {config_path}"))?;
    // Reject malformed assignments before sending anything.
    Variables::from_assignments(vars)?;
    let vars: serde_json::Map<String, Value> = vars
        .iter()
        .filter_map(|pair| pair.split_once('='))
        .map(|(k, v)| (k.trim().to_string(), Value::String(v.to_string())))
        .collect();
    let pipeline: Pipeline = client
        .post_json(
            "pipelines",
            &json!({ "team": team, "name": name, "kdl": kdl, "vars": vars }),
        )
        .await?;
    println!(
        "Pipeline {}/{} configured (version {})",
        pipeline.team, pipeline.name, pipeline.config_version
    );
    Ok(())
}

pub async fn set_paused(client: &ApiClient, team: &str, name: &str, paused: bool) -> Result<()> {
    let pipeline = client.find_pipeline(team, name).await?;
    let action = if paused { "pause" } else { "unpause" };
    let _: Value = client
        .post(&format!("pipelines/{}/{action}", pipeline.id))
        .await?;
    println!("{action}d pipeline {team}/{name}");
    Ok(())
}

pub async fn destroy(client: &ApiClient, team: &str, name: &str) -> Result<()> {
    let pipeline = client.find_pipeline(team, name).await?;
    let report: Value = client.delete(&format!("pipelines/{}", pipeline.id)).await?;
    println!(
        "Pipeline {team}/{name}: aborted {} builds, released {} containers",
        report["aborted_builds"], report["released_containers"]
    );
    if report["deleted"] != Value::Bool(true) {
        println!("Deletion will finish once running builds stop");
    }
    Ok(())
}

/// Run a single task as a one-off build in the pipeline's context.
pub async fn execute(
    client: &ApiClient,
    team: &str,
    name: &str,
    image: &str,
    command: &[String],
    privileged: bool,
) -> Result<()> {
    let Some((path, args)) = command.split_first() else {
        anyhow::bail!("a command to run is required");
    };
    let pipeline = client.find_pipeline(team, name).await?;
    let task = TaskStep {
        name: "one-off".to_string(),
        config: TaskConfig {
            image: image.to_string(),
            run: RunConfig {
                path: path.clone(),
                args: args.to_vec(),
                dir: None,
            },
            ..TaskConfig::default()
        },
        privileged,
        tags: Vec::new(),
    };
    let build: Build = client
        .post_json(&format!("pipelines/{}/tasks", pipeline.id), &task)
        .await?;
    println!("Created build {} ({})", build.name(), build.id);
    Ok(())
}
