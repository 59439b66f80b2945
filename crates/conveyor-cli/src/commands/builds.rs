//! Build commands.

use anyhow::Result;
use conveyor_core::build::Build;

use super::client::ApiClient;

pub async fn show(client: &ApiClient, id: &str) -> Result<()> {
    let build: Build = client.get(&format!("builds/{id}")).await?;
    println!("{} ({})", build.name(), build.id);
    println!("status: {}", build.status);
    for input in &build.inputs {
        println!("  in  {}: {}", input.name, input.version);
    }
    for output in &build.outputs {
        println!("  out {}: {}", output.name, output.version);
    }
    Ok(())
}

pub async fn abort(client: &ApiClient, id: &str) -> Result<()> {
    let build: Build = client.post(&format!("builds/{id}/abort")).await?;
    println!("Abort requested for {} (now {})", build.name(), build.status);
    Ok(())
}
