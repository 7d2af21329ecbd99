use bollard::container::{Config, CreateContainerOptions, LogsOptions, StopContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount, MountTypeEnum, ResourcesUlimits};
use bollard::Docker;
use futures_util::StreamExt;
use snafu::{ResultExt, Snafu};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::problem::MountEntry;

/// Paths masked inside containers that opt into masking (the SFTP side).
/// Judge containers run unmasked so workflows can install packages.
const MASKED_PATHS: &[&str] = &[
    "/etc",
    "/sys",
    "/proc/tty",
    "/proc/sys",
    "/proc/sysrq-trigger",
    "/proc/cmdline",
    "/proc/config.gz",
    "/proc/mounts",
    "/proc/fs",
    "/proc/device-tree",
    "/proc/bus",
];

/// How long to poll for a freshly started container to reach `running`.
const START_POLL_INTERVAL: Duration = Duration::from_millis(50);
const START_POLL_TRIES: usize = 100;

#[derive(Debug, Snafu)]
pub enum DockerError {
    #[snafu(display("Docker communication error: {message}"))]
    Engine {
        source: bollard::errors::Error,
        message: &'static str,
    },
    #[snafu(display("Container `{id}` never reached the running state"))]
    NeverRunning { id: String },
    #[snafu(display("Container `{id}` has no IP address"))]
    NoIpAddress { id: String },
    #[snafu(display("Exec did not finish within {seconds}s"))]
    ExecTimeout { seconds: i64 },
}

/// Receives one demultiplexed stream of a shown exec, chunk by chunk, in the
/// order the engine produced it.
pub trait StreamSink: Send {
    fn write_chunk(&mut self, chunk: &[u8]);
}

#[derive(Debug, Clone)]
pub struct ExecResult {
    pub exit_code: i64,
    /// Complete combined stdout+stderr copy, captured regardless of sinks.
    pub output: String,
}

pub struct RunImageOptions {
    pub name: String,
    pub image: String,
    /// Uid the container main process runs as.
    pub user: String,
    pub hostname: String,
    pub workdir: String,
    pub env: Vec<String>,
    pub mounts: Vec<Mount>,
    pub mask_paths: bool,
    pub readonly_rootfs: bool,
    pub disable_network: bool,
    pub network_host_mode: bool,
    pub stop_timeout: i64,
}

/// Thin adapter over the container engine. Every operation returns a
/// structured failure; nothing in here may take the process down.
#[derive(Debug, Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    pub fn new(docker: Docker) -> Self {
        Self { docker }
    }

    /// Creates and starts a container, then waits for it to actually run.
    pub async fn run_image(&self, opts: RunImageOptions) -> Result<String, DockerError> {
        let masked = opts
            .mask_paths
            .then(|| MASKED_PATHS.iter().map(|p| p.to_string()).collect());

        // Host networking wins over `disable_network` when both are set.
        let network_mode = opts.network_host_mode.then(|| "host".to_string());
        let network_disabled = !opts.network_host_mode && opts.disable_network;

        let host_config = HostConfig {
            mounts: Some(opts.mounts),
            masked_paths: masked,
            readonly_rootfs: Some(opts.readonly_rootfs),
            network_mode,
            auto_remove: Some(true),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("memlock".to_string()),
                soft: Some(-1),
                hard: Some(-1),
            }]),
            ..Default::default()
        };

        let response = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name: opts.name.clone(),
                    platform: None,
                }),
                Config {
                    image: Some(opts.image.clone()),
                    user: Some(opts.user),
                    hostname: Some(opts.hostname),
                    working_dir: Some(opts.workdir),
                    env: Some(opts.env),
                    network_disabled: Some(network_disabled),
                    stop_timeout: opts.stop_timeout.try_into().ok(),
                    host_config: Some(host_config),
                    ..Default::default()
                },
            )
            .await
            .context(EngineSnafu {
                message: "while creating container",
            })?;

        let id = response.id;
        debug!(name = %opts.name, id = %id, "Container created");

        self.docker
            .start_container::<String>(&id, None)
            .await
            .context(EngineSnafu {
                message: "while starting container",
            })?;

        for _ in 0..START_POLL_TRIES {
            let info = self
                .docker
                .inspect_container(&id, None)
                .await
                .context(EngineSnafu {
                    message: "while inspecting container",
                })?;
            let running = info
                .state
                .as_ref()
                .and_then(|state| state.running)
                .unwrap_or(false);
            if running {
                info!(name = %opts.name, id = %id, image = %opts.image, "Container running");
                return Ok(id);
            }
            tokio::time::sleep(START_POLL_INTERVAL).await;
        }

        NeverRunningSnafu { id }.fail()
    }

    /// Runs `sh -c <command>` inside the container. The attached stream is
    /// demultiplexed into the sinks (when given) while a combined copy is
    /// always captured. The timeout cancels the wait and reports failure.
    #[allow(clippy::too_many_arguments)]
    pub async fn exec_container(
        &self,
        id: &str,
        command: &str,
        timeout_seconds: i64,
        mut stdout: Option<&mut dyn StreamSink>,
        mut stderr: Option<&mut dyn StreamSink>,
        env: Vec<String>,
        privileged: bool,
    ) -> Result<ExecResult, DockerError> {
        let exec = self
            .docker
            .create_exec(
                id,
                CreateExecOptions {
                    cmd: Some(vec!["sh".to_string(), "-c".to_string(), command.to_string()]),
                    env: Some(env),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    privileged: Some(privileged),
                    ..Default::default()
                },
            )
            .await
            .context(EngineSnafu {
                message: "while creating exec",
            })?;

        let started = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .context(EngineSnafu {
                message: "while starting exec",
            })?;

        let mut combined = String::new();
        if let StartExecResults::Attached { mut output, .. } = started {
            let drain = async {
                while let Some(chunk) = output.next().await {
                    let chunk = chunk.context(EngineSnafu {
                        message: "while reading exec stream",
                    })?;
                    match chunk {
                        bollard::container::LogOutput::StdOut { message } => {
                            if let Some(sink) = stdout.as_deref_mut() {
                                sink.write_chunk(&message);
                            }
                            combined.push_str(&String::from_utf8_lossy(&message));
                        }
                        bollard::container::LogOutput::StdErr { message } => {
                            if let Some(sink) = stderr.as_deref_mut() {
                                sink.write_chunk(&message);
                            }
                            combined.push_str(&String::from_utf8_lossy(&message));
                        }
                        _ => {}
                    }
                }
                Ok::<(), DockerError>(())
            };

            match tokio::time::timeout(Duration::from_secs(timeout_seconds.max(1) as u64), drain)
                .await
            {
                Ok(result) => result?,
                Err(_) => {
                    warn!(
                        container = %id,
                        timeout = timeout_seconds,
                        command,
                        "Exec timed out"
                    );
                    return ExecTimeoutSnafu {
                        seconds: timeout_seconds,
                    }
                    .fail();
                }
            }
        }

        let inspect = self
            .docker
            .inspect_exec(&exec.id)
            .await
            .context(EngineSnafu {
                message: "while inspecting exec",
            })?;
        let exit_code = inspect.exit_code.unwrap_or(-1);

        debug!(container = %id, command, exit_code, "Exec finished");

        Ok(ExecResult {
            exit_code,
            output: combined,
        })
    }

    pub async fn container_ip(&self, id: &str) -> Result<String, DockerError> {
        let info = self
            .docker
            .inspect_container(id, None)
            .await
            .context(EngineSnafu {
                message: "while inspecting container",
            })?;

        let settings = info.network_settings.unwrap_or_default();
        if let Some(ip) = settings.ip_address.filter(|ip| !ip.is_empty()) {
            return Ok(ip);
        }
        settings
            .networks
            .unwrap_or_default()
            .into_values()
            .find_map(|endpoint| endpoint.ip_address.filter(|ip| !ip.is_empty()))
            .ok_or_else(|| DockerError::NoIpAddress { id: id.to_string() })
    }

    /// Aggregate logs of the container's main process.
    pub async fn container_logs(&self, id: &str) -> Result<String, DockerError> {
        let mut stream = self.docker.logs::<String>(
            id,
            Some(LogsOptions {
                stdout: true,
                stderr: true,
                ..Default::default()
            }),
        );

        let mut logs = String::new();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.context(EngineSnafu {
                message: "while reading container logs",
            })?;
            logs.push_str(&String::from_utf8_lossy(&chunk.into_bytes()));
        }
        Ok(logs)
    }

    /// Stops the container with a 1s grace period; AutoRemove reaps it.
    pub async fn clean_container(&self, id: &str) {
        if let Err(e) = self
            .docker
            .stop_container(id, Some(StopContainerOptions { t: 1 }))
            .await
        {
            debug!(container = %id, error = %e, "Container stop failed");
            return;
        }
        debug!(container = %id, "Container stopped");
    }
}

pub fn bind_mount(source: String, target: String, read_only: bool) -> Mount {
    Mount {
        typ: Some(MountTypeEnum::BIND),
        source: Some(source),
        target: Some(target),
        read_only: Some(read_only),
        ..Default::default()
    }
}

/// Maps a problem-declared mount onto the engine model. Unknown kinds fall
/// back to bind, matching how the engine treats them.
pub fn mount_from_entry(entry: &MountEntry) -> Mount {
    let typ = match entry.kind.as_str() {
        "volume" => MountTypeEnum::VOLUME,
        "tmpfs" => MountTypeEnum::TMPFS,
        _ => MountTypeEnum::BIND,
    };
    Mount {
        typ: Some(typ),
        source: Some(entry.source.clone()),
        target: Some(entry.target.clone()),
        read_only: Some(entry.readonly),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mount_entries_map_onto_the_engine_model() {
        let mount = mount_from_entry(&MountEntry {
            kind: "bind".to_string(),
            source: "/opt/data".to_string(),
            target: "/data".to_string(),
            readonly: true,
        });
        assert_eq!(mount.typ, Some(MountTypeEnum::BIND));
        assert_eq!(mount.read_only, Some(true));

        let tmpfs = mount_from_entry(&MountEntry {
            kind: "tmpfs".to_string(),
            source: String::new(),
            target: "/scratch".to_string(),
            readonly: false,
        });
        assert_eq!(tmpfs.typ, Some(MountTypeEnum::TMPFS));

        let unknown = mount_from_entry(&MountEntry {
            kind: "weird".to_string(),
            source: "/a".to_string(),
            target: "/b".to_string(),
            readonly: false,
        });
        assert_eq!(unknown.typ, Some(MountTypeEnum::BIND));
    }
}
