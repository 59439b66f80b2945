//! Running processes in tracked containers.

use conveyor_core::container::{Container, NewContainer};
use conveyor_core::pipeline::Params;
use conveyor_core::version::Version;
use conveyor_core::worker::{ContainerSpec, LogLine, LogStream, ProcessSpec, WorkerClient};
use conveyor_core::{Error, Result};
use conveyor_gc::ContainerRegistry;
use futures::StreamExt;
use serde::de::DeserializeOwned;
use serde_json::json;
use tokio_util::sync::CancellationToken;

pub const CHECK_SCRIPT: &str = "/opt/resource/check";
pub const IN_SCRIPT: &str = "/opt/resource/in";
pub const OUT_SCRIPT: &str = "/opt/resource/out";

/// Directory steps run in; artifacts are mounted beneath it.
pub const BUILD_DIR: &str = "/tmp/build";

/// Record a container, then create it on the worker and mark it created.
///
/// The record always exists before the backend is asked for the container,
/// so a reconcile pass never mistakes it for an orphan.
pub async fn launch(
    containers: &ContainerRegistry,
    client: &dyn WorkerClient,
    new: NewContainer,
    mut spec: ContainerSpec,
) -> Result<Container> {
    let container = containers.track(new).await?;
    spec.handle = container.handle.clone();
    client.create_container(spec).await?;
    containers.mark_created(&container.handle).await?;
    Ok(container)
}

pub struct Finished {
    pub exit_code: i32,
    pub stdout: Vec<String>,
}

/// Run `process` to completion, handing every output line to `on_line`.
///
/// Returns `Cancelled` as soon as `cancel` fires.
pub async fn run_process(
    client: &dyn WorkerClient,
    handle: &str,
    process: ProcessSpec,
    cancel: &CancellationToken,
    mut on_line: impl FnMut(LogLine) + Send,
) -> Result<Finished> {
    let run = client.run_step(handle, process).await?;
    let mut output = run.output;
    let exit = run.exit;

    let completed = async {
        let mut stdout = Vec::new();
        while let Some(line) = output.next().await {
            if line.stream == LogStream::Stdout {
                stdout.push(line.content.clone());
            }
            on_line(line);
        }
        let exit_code = exit.await?;
        Ok(Finished { exit_code, stdout })
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(Error::Cancelled),
        finished = completed => finished,
    }
}

/// Parse the JSON document a resource script printed last on stdout.
pub fn parse_response<T: DeserializeOwned>(script: &str, stdout: &[String]) -> Result<T> {
    let last = stdout
        .iter()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| Error::Infrastructure(format!("{script} printed nothing")))?;
    serde_json::from_str(last)
        .map_err(|e| Error::Infrastructure(format!("{script} printed invalid output: {e}")))
}

/// The request a resource script reads from stdin.
pub fn resource_request(source: &Params, params: Option<&Params>, version: Option<&Version>) -> String {
    let mut request = json!({ "source": source });
    if let Some(params) = params {
        request["params"] = json!(params);
    }
    if let Some(version) = version {
        request["version"] = json!(version);
    }
    request.to_string()
}

pub fn script(path: &str, args: Vec<String>, stdin: String) -> ProcessSpec {
    ProcessSpec {
        path: path.to_string(),
        args,
        env: Default::default(),
        dir: Some(BUILD_DIR.to_string()),
        stdin: Some(stdin),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::version::ResourceResponse;
    use conveyor_worker::InMemoryWorker;

    fn spec() -> ContainerSpec {
        ContainerSpec {
            handle: String::new(),
            image: "alpine".to_string(),
            privileged: false,
            env: Default::default(),
            working_dir: None,
            volumes: vec![],
        }
    }

    #[test]
    fn test_request_shape() {
        let source = Params::from([("uri".to_string(), json!("git://x"))]);
        let request: serde_json::Value = serde_json::from_str(&resource_request(
            &source,
            None,
            Some(&Version::new([("ref", "abc")])),
        ))
        .unwrap();
        assert_eq!(request["source"]["uri"], "git://x");
        assert_eq!(request["version"]["ref"], "abc");
        assert!(request.get("params").is_none());
    }

    #[test]
    fn test_parse_response_uses_last_line() {
        let stdout = vec![
            "progress".to_string(),
            r#"{"version":{"ref":"abc"}}"#.to_string(),
            String::new(),
        ];
        let response: ResourceResponse = parse_response(IN_SCRIPT, &stdout).unwrap();
        assert_eq!(response.version.get("ref"), Some("abc"));

        let err = parse_response::<ResourceResponse>(IN_SCRIPT, &["nope".to_string()]);
        assert!(matches!(err, Err(Error::Infrastructure(_))));
    }

    #[tokio::test]
    async fn test_cancel_interrupts_hanging_process() {
        let worker = InMemoryWorker::new("w1");
        let mut spec = spec();
        spec.handle = "h1".to_string();
        worker.create_container(spec).await.unwrap();
        worker.hang("sleep");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let process = ProcessSpec {
            path: "sleep".to_string(),
            args: vec![],
            env: Default::default(),
            dir: None,
            stdin: None,
        };
        let result = run_process(&worker, "h1", process, &cancel, |_| {}).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }
}
