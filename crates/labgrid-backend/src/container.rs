//! Container backend driven through the docker CLI.
//!
//! Containers are labelled with the owning user, instance and challenge so
//! external tooling can reconcile leftovers against the instance table.
//! The container id returned by `docker run` is the instance handle.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use lab_core::config::BackendConfig;
use lab_core::{CommandOutput, CommandRunner};
use labgrid_state::{BackendKind, PortBinding};

use crate::backend::{Backend, BackendFuture, ProvisionRequest, Provisioned};
use crate::error::{BackendError, BackendResult};

/// Label keys attached to every challenge container.
pub const LABEL_OWNER: &str = "labgrid.owner";
pub const LABEL_INSTANCE: &str = "labgrid.instance";
pub const LABEL_CHALLENGE: &str = "labgrid.challenge";

#[derive(Debug, Clone)]
pub struct ContainerSettings {
    pub docker_binary: String,
    /// Host handed to users as the instance address.
    pub public_host: String,
    pub network: Option<String>,
    /// Deadline for each docker invocation.
    pub call_timeout: Duration,
}

impl From<&BackendConfig> for ContainerSettings {
    fn from(config: &BackendConfig) -> Self {
        Self {
            docker_binary: config.docker_binary.clone(),
            public_host: config.public_host.clone(),
            network: config.network.clone(),
            call_timeout: Duration::from_secs(config.call_timeout_secs),
        }
    }
}

pub struct ContainerBackend {
    runner: Arc<dyn CommandRunner>,
    settings: ContainerSettings,
}

impl ContainerBackend {
    pub fn new(runner: Arc<dyn CommandRunner>, settings: ContainerSettings) -> Self {
        Self { runner, settings }
    }

    async fn docker(&self, op: &'static str, args: Vec<String>) -> BackendResult<CommandOutput> {
        self.runner
            .run(&self.settings.docker_binary, &args, self.settings.call_timeout)
            .await
            .map_err(|e| BackendError::from_exec(op, e))
    }

    fn run_args(&self, req: &ProvisionRequest, image: String) -> Vec<String> {
        let challenge = &req.challenge;
        let mut args = vec![
            "run".to_string(),
            "-d".to_string(),
            "--name".to_string(),
            container_name(&req.instance_id),
            "--label".to_string(),
            format!("{LABEL_OWNER}={}", req.owner),
            "--label".to_string(),
            format!("{LABEL_INSTANCE}={}", req.instance_id),
            "--label".to_string(),
            format!("{LABEL_CHALLENGE}={}", challenge.id),
            "--cpus".to_string(),
            challenge.cpus.to_string(),
            "--memory".to_string(),
            format!("{}m", challenge.memory_mb),
        ];
        if let Some(network) = &self.settings.network {
            args.push("--network".to_string());
            args.push(network.clone());
        }
        for port in &challenge.exposed_ports {
            args.push("-p".to_string());
            args.push(port.to_string());
        }
        args.push(image);
        args
    }

    /// Ask the engine which host port was published for `port`.
    async fn published_port(&self, handle: &str, port: u16) -> BackendResult<u16> {
        let output = self
            .docker(
                "provision",
                vec!["port".to_string(), handle.to_string(), format!("{port}/tcp")],
            )
            .await?;
        if !output.success() {
            return Err(engine_error(&output));
        }
        parse_host_port(&output.stdout).ok_or_else(|| {
            BackendError::Engine(format!(
                "unparseable port mapping for {port}: {:?}",
                output.stdout.trim()
            ))
        })
    }
}

impl Backend for ContainerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Container
    }

    fn provision<'a>(&'a self, req: &'a ProvisionRequest) -> BackendFuture<'a, Provisioned> {
        Box::pin(async move {
            let image = req.challenge.image_ref().ok_or_else(|| {
                BackendError::Unavailable(format!(
                    "challenge {} has no container image",
                    req.challenge.id
                ))
            })?;

            let name = container_name(&req.instance_id);
            let output = self
                .docker("provision", self.run_args(req, image.clone()))
                .await
                .map_err(|e| match e {
                    // The engine may still create the container after the deadline.
                    BackendError::Timeout { .. } => e.leaving(name.clone()),
                    other => other,
                })?;
            if !output.success() {
                return Err(match engine_error(&output) {
                    // The daemon may have created the container before the link dropped.
                    e @ BackendError::Transport(_) => e.leaving(name),
                    e => e,
                });
            }
            let handle = output.stdout.trim().to_string();
            if handle.is_empty() {
                return Err(BackendError::Engine("docker run returned no container id".into()));
            }
            debug!(instance_id = %req.instance_id, %handle, %image, "container started");

            let mut ports = Vec::with_capacity(req.challenge.exposed_ports.len());
            for &internal in &req.challenge.exposed_ports {
                let external = self
                    .published_port(&handle, internal)
                    .await
                    .map_err(|e| e.leaving(handle.clone()))?;
                ports.push(PortBinding { internal, external });
            }

            info!(
                instance_id = %req.instance_id,
                %handle,
                ports = ports.len(),
                "container provisioned"
            );
            Ok(Provisioned {
                handle,
                address: self.settings.public_host.clone(),
                ports,
                node_id: None,
            })
        })
    }

    fn stop<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let output = self
                .docker("stop", vec!["stop".to_string(), handle.to_string()])
                .await?;
            if output.success() || is_missing(&output) {
                debug!(%handle, "container stopped");
                return Ok(());
            }
            Err(engine_error(&output))
        })
    }

    fn remove<'a>(&'a self, handle: &'a str) -> BackendFuture<'a, ()> {
        Box::pin(async move {
            let output = self
                .docker(
                    "remove",
                    vec!["rm".to_string(), "-f".to_string(), handle.to_string()],
                )
                .await?;
            if output.success() || is_missing(&output) {
                debug!(%handle, "container removed");
                return Ok(());
            }
            Err(engine_error(&output))
        })
    }

    fn orphan_handle(&self, req: &ProvisionRequest) -> Option<String> {
        Some(container_name(&req.instance_id))
    }
}

fn container_name(instance_id: &str) -> String {
    format!("lab-{instance_id}")
}

fn is_missing(output: &CommandOutput) -> bool {
    output.stderr.contains("No such container")
}

/// stderr fragments the docker CLI prints when it cannot reach the daemon.
const DAEMON_UNREACHABLE: &[&str] = &[
    "Cannot connect to the Docker daemon",
    "Is the docker daemon running",
    "error during connect",
];

fn engine_error(output: &CommandOutput) -> BackendError {
    let stderr = output.stderr.trim();
    if DAEMON_UNREACHABLE.iter().any(|m| stderr.contains(m)) {
        BackendError::Transport(stderr.to_string())
    } else {
        BackendError::Engine(format!("exit {:?}: {stderr}", output.status))
    }
}

/// Parse `docker port` output such as `0.0.0.0:49153\n[::]:49153`.
fn parse_host_port(stdout: &str) -> Option<u16> {
    stdout
        .lines()
        .find_map(|line| line.trim().rsplit(':').next()?.parse().ok())
}
