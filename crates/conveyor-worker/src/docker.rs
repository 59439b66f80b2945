//! Docker container backend.
//!
//! Each container is a long-lived `sleep` process; steps run inside it as
//! exec sessions. Volumes are named Docker volumes: removal is attempted
//! on destroy and silently skipped while another container still uses one.

use async_trait::async_trait;
use bollard::Docker;
use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, LogOutput, RemoveContainerOptions,
    StartContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::image::CreateImageOptions;
use bollard::models::HostConfig;
use bollard::volume::RemoveVolumeOptions;
use chrono::Utc;
use conveyor_core::worker::{
    ContainerSpec, LogLine, LogStream, ProcessRun, ProcessSpec, WorkerClient,
};
use conveyor_core::{Error, Result};
use futures::StreamExt;
use std::collections::{BTreeSet, HashMap};
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, oneshot};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::{debug, info, warn};

const LABEL_HANDLE: &str = "conveyor.handle";
const LABEL_WORKER: &str = "conveyor.worker";
const LABEL_VOLUMES: &str = "conveyor.volumes";
const CONNECT_TIMEOUT_SECS: u64 = 120;

pub struct DockerWorker {
    name: String,
    docker: Docker,
}

impl DockerWorker {
    /// Connect to the daemon at `address`: `local`, `unix:///path`,
    /// `tcp://host:port` or `http://host:port`.
    pub fn connect(name: &str, address: &str) -> Result<Self> {
        let docker = match address {
            "" | "local" => Docker::connect_with_local_defaults(),
            addr if addr.starts_with("unix://") => Docker::connect_with_unix(
                addr,
                CONNECT_TIMEOUT_SECS,
                bollard::API_DEFAULT_VERSION,
            ),
            addr => {
                let url = url::Url::parse(addr)
                    .map_err(|e| Error::InvalidInput(format!("worker address {addr}: {e}")))?;
                if !matches!(url.scheme(), "tcp" | "http") {
                    return Err(Error::InvalidInput(format!(
                        "unsupported worker address scheme: {}",
                        url.scheme()
                    )));
                }
                Docker::connect_with_http(addr, CONNECT_TIMEOUT_SECS, bollard::API_DEFAULT_VERSION)
            }
        }
        .map_err(|e| Error::Infrastructure(format!("connecting to {address}: {e}")))?;

        Ok(Self::with_client(name, docker))
    }

    pub fn with_client(name: &str, docker: Docker) -> Self {
        Self {
            name: name.to_string(),
            docker,
        }
    }

    fn container_name(handle: &str) -> String {
        format!("conveyor-{}", handle)
    }

    async fn pull(&self, image: &str) {
        let options = CreateImageOptions {
            from_image: image.to_string(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(result) = pull.next().await {
            match result {
                Ok(info) => {
                    if let Some(status) = info.status {
                        debug!(image = %image, status = %status, "Pull progress");
                    }
                }
                Err(e) => {
                    // A locally built image may not exist in any registry.
                    warn!(image = %image, error = %e, "Pull failed");
                    break;
                }
            }
        }
    }

    async fn remove_volumes(&self, volumes: &[String]) {
        for volume in volumes {
            match self
                .docker
                .remove_volume(volume, Some(RemoveVolumeOptions { force: false }))
                .await
            {
                Ok(()) => debug!(volume = %volume, "Removed volume"),
                Err(e) if is_status(&e, 404) || is_status(&e, 409) => {}
                Err(e) => warn!(volume = %volume, error = %e, "Failed to remove volume"),
            }
        }
    }
}

fn is_status(err: &bollard::errors::Error, status: u16) -> bool {
    matches!(
        err,
        bollard::errors::Error::DockerResponseServerError { status_code, .. } if *status_code == status
    )
}

fn infra(context: &str, err: bollard::errors::Error) -> Error {
    Error::Infrastructure(format!("{context}: {err}"))
}

fn env_list(env: &std::collections::BTreeMap<String, String>) -> Vec<String> {
    env.iter().map(|(k, v)| format!("{}={}", k, v)).collect()
}

fn log_line(output: LogOutput) -> LogLine {
    let (stream, message) = match output {
        LogOutput::StdErr { message } => (LogStream::Stderr, message),
        LogOutput::StdOut { message }
        | LogOutput::Console { message }
        | LogOutput::StdIn { message } => (LogStream::Stdout, message),
    };
    LogLine {
        timestamp: Utc::now(),
        stream,
        content: String::from_utf8_lossy(&message).trim_end().to_string(),
    }
}

#[async_trait]
impl WorkerClient for DockerWorker {
    fn worker_name(&self) -> &str {
        &self.name
    }

    async fn ping(&self) -> Result<()> {
        self.docker
            .ping()
            .await
            .map(|_| ())
            .map_err(|e| infra("ping", e))
    }

    async fn create_container(&self, spec: ContainerSpec) -> Result<String> {
        let name = Self::container_name(&spec.handle);
        self.pull(&spec.image).await;

        let binds: Vec<String> = spec
            .volumes
            .iter()
            .map(|v| {
                let mode = if v.read_only { "ro" } else { "rw" };
                format!("{}:{}:{}", v.name, v.mount_path, mode)
            })
            .collect();
        let volume_names: Vec<String> = spec.volumes.iter().map(|v| v.name.clone()).collect();

        let labels = HashMap::from([
            (LABEL_HANDLE.to_string(), spec.handle.clone()),
            (LABEL_WORKER.to_string(), self.name.clone()),
            (LABEL_VOLUMES.to_string(), volume_names.join(",")),
        ]);

        let config = Config {
            image: Some(spec.image.clone()),
            entrypoint: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            env: Some(env_list(&spec.env)),
            working_dir: spec.working_dir.clone(),
            labels: Some(labels),
            tty: Some(false),
            host_config: Some(HostConfig {
                binds: (!binds.is_empty()).then_some(binds),
                privileged: Some(spec.privileged),
                ..Default::default()
            }),
            ..Default::default()
        };

        info!(worker = %self.name, handle = %spec.handle, image = %spec.image, "Creating container");
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.clone(),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|e| infra("create container", e))?;

        self.docker
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
            .map_err(|e| infra("start container", e))?;

        Ok(spec.handle)
    }

    async fn run_step(&self, handle: &str, process: ProcessSpec) -> Result<ProcessRun> {
        let name = Self::container_name(handle);
        let mut cmd = vec![process.path.clone()];
        cmd.extend(process.args.iter().cloned());

        let exec = self
            .docker
            .create_exec(
                &name,
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(env_list(&process.env)),
                    working_dir: process.dir.clone(),
                    attach_stdin: Some(process.stdin.is_some()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| infra("create exec", e))?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| infra("start exec", e))?;
        let (mut output, mut input) = match started {
            StartExecResults::Attached { output, input } => (output, input),
            StartExecResults::Detached => {
                return Err(Error::Infrastructure(
                    "exec started detached".to_string(),
                ));
            }
        };

        if let Some(stdin) = process.stdin {
            input
                .write_all(stdin.as_bytes())
                .await
                .map_err(|e| Error::Infrastructure(format!("writing stdin: {e}")))?;
            input
                .shutdown()
                .await
                .map_err(|e| Error::Infrastructure(format!("closing stdin: {e}")))?;
        }

        let (line_tx, line_rx) = mpsc::unbounded_channel();
        let (exit_tx, exit_rx) = oneshot::channel();
        let docker = self.docker.clone();
        let exec_id = exec.id;
        tokio::spawn(async move {
            while let Some(item) = output.next().await {
                match item {
                    Ok(out) => {
                        let _ = line_tx.send(log_line(out));
                    }
                    Err(e) => {
                        let _ = exit_tx.send(Err(infra("exec output", e)));
                        return;
                    }
                }
            }
            drop(line_tx);
            let exit = docker
                .inspect_exec(&exec_id)
                .await
                .map_err(|e| infra("inspect exec", e))
                .and_then(|inspect| {
                    inspect
                        .exit_code
                        .map(|code| code as i32)
                        .ok_or_else(|| Error::Infrastructure("exec has no exit code".to_string()))
                });
            let _ = exit_tx.send(exit);
        });

        Ok(ProcessRun {
            output: Box::pin(UnboundedReceiverStream::new(line_rx)),
            exit: Box::pin(async move {
                exit_rx
                    .await
                    .map_err(|_| Error::Infrastructure("exec monitor went away".to_string()))?
            }),
        })
    }

    async fn destroy_container(&self, handle: &str) -> Result<()> {
        let name = Self::container_name(handle);

        let volumes: Vec<String> = match self.docker.inspect_container(&name, None).await {
            Ok(inspect) => inspect
                .config
                .and_then(|c| c.labels)
                .and_then(|labels| labels.get(LABEL_VOLUMES).cloned())
                .map(|v| {
                    v.split(',')
                        .filter(|s| !s.is_empty())
                        .map(String::from)
                        .collect()
                })
                .unwrap_or_default(),
            Err(e) if is_status(&e, 404) => return Ok(()),
            Err(e) => return Err(infra("inspect container", e)),
        };

        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.docker.remove_container(&name, Some(options)).await {
            Ok(()) => {}
            Err(e) if is_status(&e, 404) => return Ok(()),
            Err(e) => return Err(infra("remove container", e)),
        }
        info!(worker = %self.name, handle = %handle, "Destroyed container");

        self.remove_volumes(&volumes).await;
        Ok(())
    }

    async fn list_containers(&self) -> Result<BTreeSet<String>> {
        let filters = HashMap::from([(
            "label".to_string(),
            vec![format!("{}={}", LABEL_WORKER, self.name)],
        )]);
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions {
                all: true,
                filters,
                ..Default::default()
            }))
            .await
            .map_err(|e| infra("list containers", e))?;

        Ok(containers
            .into_iter()
            .filter_map(|c| c.labels.and_then(|mut l| l.remove(LABEL_HANDLE)))
            .collect())
    }
}
