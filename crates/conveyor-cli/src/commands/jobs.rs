//! Job commands.

use anyhow::Result;
use conveyor_core::build::{Build, Pagination};
use serde::Deserialize;
use serde_json::Value;

use super::client::{ApiClient, Target, segment};

pub async fn set_paused(client: &ApiClient, team: &str, target: &Target, paused: bool) -> Result<()> {
    let job = client.find_job(team, target).await?;
    let action = if paused { "pause" } else { "unpause" };
    let _: Value = client.post(&format!("jobs/{}/{action}", job.id)).await?;
    println!("{action}d job {target}");
    Ok(())
}

pub async fn trigger(client: &ApiClient, team: &str, target: &Target) -> Result<()> {
    let job = client.find_job(team, target).await?;
    let outcome: Value = client.post(&format!("jobs/{}/trigger", job.id)).await?;
    match outcome["outcome"].as_str() {
        Some("created") => println!(
            "Started build {}/{}",
            target,
            outcome["build"]["sequence"]
        ),
        _ => println!(
            "Build queued: {}",
            outcome["reason"].as_str().unwrap_or("waiting for inputs")
        ),
    }
    Ok(())
}

/// Run one scheduling pass for the job and report what it decided.
pub async fn schedule(client: &ApiClient, team: &str, target: &Target) -> Result<()> {
    let job = client.find_job(team, target).await?;
    let outcome: Value = client.post(&format!("jobs/{}/schedule", job.id)).await?;
    let kind = outcome["outcome"].as_str().unwrap_or("unknown");
    match outcome.get("reason").and_then(Value::as_str) {
        Some(reason) => println!("{target}: {kind} ({reason})"),
        None => println!("{target}: {kind}"),
    }
    Ok(())
}

#[derive(Deserialize)]
struct BuildsResponse {
    builds: Vec<Build>,
    pagination: Pagination,
}

pub async fn builds(
    client: &ApiClient,
    team: &str,
    target: &Target,
    since: Option<u64>,
    until: Option<u64>,
    limit: usize,
) -> Result<()> {
    let job = client.find_job(team, target).await?;
    let mut query = vec![("limit", limit.to_string())];
    query.extend(since.map(|s| ("since", s.to_string())));
    query.extend(until.map(|u| ("until", u.to_string())));
    let page: BuildsResponse = client
        .get_query(&format!("jobs/{}/builds", job.id), &query)
        .await?;
    for build in &page.builds {
        println!("{}\t{}\t{}", build.sequence, build.status, build.id);
    }
    if let Some(next) = page.pagination.next.and_then(|p| p.since) {
        println!("(older builds: --since {next})");
    }
    Ok(())
}

pub async fn clear_task_cache(
    client: &ApiClient,
    team: &str,
    target: &Target,
    step: &str,
    path: Option<String>,
) -> Result<()> {
    let job = client.find_job(team, target).await?;
    let query: Vec<(&str, String)> = path.into_iter().map(|p| ("path", p)).collect();
    let cleared: Value = client
        .delete_query(&format!("jobs/{}/caches/{}", job.id, segment(step)), &query)
        .await?;
    println!("Removed {} task caches", cleared["removed"]);
    Ok(())
}
