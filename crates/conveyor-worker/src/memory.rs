//! In-memory container backend.
//!
//! Runs no processes. Resource scripts under `/opt/resource` answer the
//! way a well-behaved resource type would, and every other command exits
//! with a configurable code. Used by tests and local development.

use async_trait::async_trait;
use chrono::Utc;
use conveyor_core::version::Version;
use conveyor_core::worker::{
    ContainerSpec, LogLine, LogStream, ProcessRun, ProcessSpec, WorkerClient,
};
use conveyor_core::{Error, Result};
use futures::{FutureExt, StreamExt, future, stream};
use parking_lot::Mutex;
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

pub const CHECK_SCRIPT: &str = "/opt/resource/check";
pub const IN_SCRIPT: &str = "/opt/resource/in";
pub const OUT_SCRIPT: &str = "/opt/resource/out";

pub struct InMemoryWorker {
    name: String,
    state: Mutex<State>,
}

#[derive(Default)]
struct State {
    containers: BTreeMap<String, ContainerSpec>,
    destroyed: Vec<String>,
    runs: Vec<(String, ProcessSpec)>,
    exit_codes: BTreeMap<String, i32>,
    hanging: BTreeSet<String>,
    check_versions: Vec<Version>,
    puts: u64,
    fail_creates: bool,
    unreachable: bool,
}

impl InMemoryWorker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(State::default()),
        }
    }

    /// Make every process started with `path` exit with `code`.
    pub fn set_exit_code(&self, path: &str, code: i32) {
        self.state.lock().exit_codes.insert(path.to_string(), code);
    }

    /// Make every process started with `path` run until it is dropped.
    pub fn hang(&self, path: &str) {
        self.state.lock().hanging.insert(path.to_string());
    }

    /// Versions reported by `check`, oldest first.
    pub fn set_check_versions(&self, versions: Vec<Version>) {
        self.state.lock().check_versions = versions;
    }

    pub fn fail_creates(&self, fail: bool) {
        self.state.lock().fail_creates = fail;
    }

    /// Fail every call, as if the worker's daemon were down.
    pub fn set_unreachable(&self, unreachable: bool) {
        self.state.lock().unreachable = unreachable;
    }

    pub fn live_handles(&self) -> BTreeSet<String> {
        self.state.lock().containers.keys().cloned().collect()
    }

    pub fn container(&self, handle: &str) -> Option<ContainerSpec> {
        self.state.lock().containers.get(handle).cloned()
    }

    pub fn destroyed(&self) -> Vec<String> {
        self.state.lock().destroyed.clone()
    }

    /// Every process started so far with the handle it ran in.
    pub fn runs(&self) -> Vec<(String, ProcessSpec)> {
        self.state.lock().runs.clone()
    }

    /// Put a container on the worker behind the registry's back.
    pub fn inject_container(&self, spec: ContainerSpec) {
        self.state.lock().containers.insert(spec.handle.clone(), spec);
    }

    fn check_reachable(&self) -> Result<()> {
        if self.state.lock().unreachable {
            return Err(Error::Infrastructure(format!(
                "worker {} is unreachable",
                self.name
            )));
        }
        Ok(())
    }
}

fn line(stream: LogStream, content: impl Into<String>) -> LogLine {
    LogLine {
        timestamp: Utc::now(),
        stream,
        content: content.into(),
    }
}

fn script_version(stdin: Option<&str>) -> Result<serde_json::Value> {
    let request: serde_json::Value = serde_json::from_str(stdin.unwrap_or("{}"))
        .map_err(|e| Error::InvalidInput(format!("resource request: {e}")))?;
    Ok(request.get("version").cloned().unwrap_or_else(|| json!({})))
}

#[async_trait]
impl WorkerClient for InMemoryWorker {
    fn worker_name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        self.check_reachable()
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if state.fail_creates {
            return Err(Error::Infrastructure(format!(
                "worker {} refused to create {}",
                self.name, spec.handle
            )));
        }
        let handle = spec.handle.clone();
        state.containers.insert(handle.clone(), spec);
        Ok(handle)
    }

    async fn run_step(&self, handle: &str, process: ProcessSpec) -> Result<ProcessRun> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if !state.containers.contains_key(handle) {
            return Err(Error::Infrastructure(format!("container {} not found", handle)));
        }
        state.runs.push((handle.to_string(), process.clone()));

        let mut lines = Vec::new();
        let code = match process.path.as_str() {
            CHECK_SCRIPT => {
                let versions = serde_json::to_string(&state.check_versions)
                    .map_err(|e| Error::Internal(e.to_string()))?;
                lines.push(line(LogStream::Stdout, versions));
                0
            }
            IN_SCRIPT => {
                let version = script_version(process.stdin.as_deref())?;
                lines.push(line(LogStream::Stderr, "fetching"));
                lines.push(line(
                    LogStream::Stdout,
                    json!({ "version": version, "metadata": [] }).to_string(),
                ));
                0
            }
            OUT_SCRIPT => {
                state.puts += 1;
                lines.push(line(LogStream::Stderr, "pushing"));
                lines.push(line(
                    LogStream::Stdout,
                    json!({
                        "version": { "ref": format!("put-{}", state.puts) },
                        "metadata": [{ "name": "worker", "value": self.name }],
                    })
                    .to_string(),
                ));
                0
            }
            path => {
                lines.push(line(LogStream::Stdout, format!("running {path}")));
                0
            }
        };
        let code = state.exit_codes.get(&process.path).copied().unwrap_or(code);

        let exit = if state.hanging.contains(&process.path) {
            future::pending::<Result<i32>>().boxed()
        } else {
            future::ready(Ok(code)).boxed()
        };
        Ok(ProcessRun {
            output: stream::iter(lines).boxed(),
            exit,
        })
    }

    async fn destroy_container(&self, handle: &str) -> Result<()> {
        self.check_reachable()?;
        let mut state = self.state.lock();
        if state.containers.remove(handle).is_some() {
            state.destroyed.push(handle.to_string());
        }
        Ok(())
    }

    async fn list_containers(&self) -> Result<BTreeSet<String>> {
        self.check_reachable()?;
        Ok(self.live_handles())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(handle: &str) -> ContainerSpec {
        ContainerSpec {
            handle: handle.to_string(),
            image: "alpine".to_string(),
            privileged: false,
            env: BTreeMap::new(),
            working_dir: None,
            volumes: vec![],
        }
    }

    fn process(path: &str, stdin: Option<&str>) -> ProcessSpec {
        ProcessSpec {
            path: path.to_string(),
            args: vec![],
            env: BTreeMap::new(),
            dir: None,
            stdin: stdin.map(String::from),
        }
    }

    async fn stdout_of(run: ProcessRun) -> (Vec<String>, i32) {
        let lines: Vec<String> = run
            .output
            .filter(|l| future::ready(l.stream == LogStream::Stdout))
            .map(|l| l.content)
            .collect()
            .await;
        (lines, run.exit.await.unwrap())
    }

    #[tokio::test]
    async fn test_destroy_is_idempotent() {
        let worker = InMemoryWorker::new("w1");
        worker.create_container(spec("h1")).await.unwrap();
        assert!(worker.list_containers().await.unwrap().contains("h1"));

        worker.destroy_container("h1").await.unwrap();
        worker.destroy_container("h1").await.unwrap();
        assert!(worker.list_containers().await.unwrap().is_empty());
        assert_eq!(worker.destroyed(), vec!["h1".to_string()]);
    }

    #[tokio::test]
    async fn test_resource_scripts() {
        let worker = InMemoryWorker::new("w1");
        worker.create_container(spec("h1")).await.unwrap();

        let run = worker
            .run_step("h1", process(IN_SCRIPT, Some(r#"{"version":{"ref":"abc"}}"#)))
            .await
            .unwrap();
        let (lines, code) = stdout_of(run).await;
        assert_eq!(code, 0);
        let response: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(response["version"]["ref"], "abc");

        let run = worker.run_step("h1", process(OUT_SCRIPT, None)).await.unwrap();
        let (lines, _) = stdout_of(run).await;
        let response: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(response["version"]["ref"], "put-1");

        worker.set_check_versions(vec![Version::new([("ref", "v1")])]);
        let run = worker.run_step("h1", process(CHECK_SCRIPT, None)).await.unwrap();
        let (lines, _) = stdout_of(run).await;
        let versions: Vec<Version> = serde_json::from_str(&lines[0]).unwrap();
        assert_eq!(versions[0].get("ref"), Some("v1"));
    }

    #[tokio::test]
    async fn test_scripted_exit_codes_and_failures() {
        let worker = InMemoryWorker::new("w1");
        worker.create_container(spec("h1")).await.unwrap();
        worker.set_exit_code("make", 2);

        let run = worker.run_step("h1", process("make", None)).await.unwrap();
        assert_eq!(run.exit.await.unwrap(), 2);
        assert!(worker.run_step("h2", process("make", None)).await.is_err());

        worker.fail_creates(true);
        assert!(worker.create_container(spec("h2")).await.is_err());

        worker.set_unreachable(true);
        assert!(worker.ping().await.is_err());
        assert!(worker.list_containers().await.is_err());
    }
}
