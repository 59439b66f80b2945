//! Worker and container commands.

use anyhow::{Result, bail};
use conveyor_core::container::Container;
use conveyor_core::worker::Worker;

use super::client::ApiClient;

pub async fn list(client: &ApiClient) -> Result<()> {
    let workers: Vec<Worker> = client.get("workers").await?;
    for w in workers {
        println!(
            "{}\t{}\t{}\texpires {}",
            w.name,
            w.platform,
            w.team.as_deref().unwrap_or("-"),
            w.expires_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
    Ok(())
}

pub async fn containers(
    client: &ApiClient,
    team: Option<String>,
    pipeline: Option<String>,
    worker: Option<String>,
) -> Result<()> {
    let query = match (team, pipeline, worker) {
        (Some(team), None, None) => vec![("team", team)],
        (None, Some(pipeline), None) => vec![("pipeline_id", pipeline)],
        (None, None, Some(worker)) => vec![("worker", worker)],
        _ => bail!("pass exactly one of --team, --pipeline-id or --worker"),
    };
    let containers: Vec<Container> = client.get_query("containers", &query).await?;
    for c in containers {
        let released = if c.is_released() { "released" } else { "" };
        println!(
            "{}\t{}\t{:?}\t{:?}\t{released}",
            c.handle, c.worker_name, c.state, c.owner
        );
    }
    Ok(())
}
