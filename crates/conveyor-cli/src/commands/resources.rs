//! Resource commands.

use anyhow::Result;
use conveyor_core::version::ResourceVersion;

use super::client::{ApiClient, Target};

pub async fn check(client: &ApiClient, team: &str, target: &Target) -> Result<()> {
    let resource = client.find_resource(team, target).await?;
    let found: Vec<ResourceVersion> = client
        .post(&format!("resources/{}/check", resource.id))
        .await?;
    println!("{target}: {} new versions", found.len());
    print_versions(&found);
    Ok(())
}

pub async fn versions(client: &ApiClient, team: &str, target: &Target) -> Result<()> {
    let resource = client.find_resource(team, target).await?;
    let versions: Vec<ResourceVersion> = client
        .get(&format!("resources/{}/versions", resource.id))
        .await?;
    print_versions(&versions);
    Ok(())
}

fn print_versions(versions: &[ResourceVersion]) {
    for v in versions {
        println!("{}\t{}", v.check_order, v.version);
    }
}
