use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, KillContainerOptions, ListContainersOptions,
    RemoveContainerOptions, StopContainerOptions, UpdateContainerOptions,
};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::HostConfig;
use bollard::Docker;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::api::{
    ContainerApi, ContainerFilter, ContainerInfo, ContainerState, CreateSpec, ExecOutput,
    ResourceLimits,
};
use crate::error::DockerError;

/// [`ContainerApi`] over the local container runtime socket.
#[derive(Debug, Clone)]
pub struct DockerClient {
    docker: Docker,
}

impl DockerClient {
    /// Connect using the ambient environment (DOCKER_HOST or the default
    /// socket path).
    pub fn connect() -> Result<Self, DockerError> {
        let docker = Docker::connect_with_local_defaults()?;
        Ok(Self { docker })
    }

    /// Race an API call against cancellation.
    async fn guard<T, F>(&self, cancel: &CancellationToken, fut: F) -> Result<T, DockerError>
    where
        F: Future<Output = Result<T, bollard::errors::Error>>,
    {
        tokio::select! {
            _ = cancel.cancelled() => Err(DockerError::Cancelled),
            res = fut => res.map_err(DockerError::from),
        }
    }
}

fn strip_slash(name: &str) -> String {
    name.strip_prefix('/').unwrap_or(name).to_string()
}

fn state_from_str(s: Option<&str>) -> ContainerState {
    match s {
        Some("running") => ContainerState::Running,
        Some("paused") => ContainerState::Paused,
        Some("exited") | Some("dead") => ContainerState::Exited,
        _ => ContainerState::Unknown,
    }
}

#[async_trait]
impl ContainerApi for DockerClient {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerInfo>, DockerError> {
        let mut filters: HashMap<String, Vec<String>> = HashMap::new();
        if let Some(name) = &filter.name_contains {
            filters.insert("name".into(), vec![name.clone()]);
        }
        if !filter.labels.is_empty() {
            filters.insert("label".into(), filter.labels.clone());
        }

        let options = ListContainersOptions {
            all: filter.all,
            filters,
            ..Default::default()
        };

        let summaries = self
            .guard(cancel, self.docker.list_containers(Some(options)))
            .await?;

        let infos = summaries
            .into_iter()
            .map(|c| {
                let name = c
                    .names
                    .as_ref()
                    .and_then(|n| n.first())
                    .map(|n| strip_slash(n))
                    .unwrap_or_default();
                let ip = c.network_settings.as_ref().and_then(|ns| {
                    ns.networks.as_ref().and_then(|nets| {
                        nets.values().find_map(|n| {
                            n.ip_address.as_ref().filter(|ip| !ip.is_empty()).cloned()
                        })
                    })
                });
                ContainerInfo {
                    id: c.id.unwrap_or_default(),
                    name,
                    image: c.image.unwrap_or_default(),
                    state: state_from_str(c.state.as_deref()),
                    ip,
                    labels: c.labels.unwrap_or_default(),
                    pid: None,
                }
            })
            .collect();

        Ok(infos)
    }

    async fn inspect(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerInfo, DockerError> {
        let details = self
            .guard(cancel, self.docker.inspect_container(id, None))
            .await?;

        let state = details.state.as_ref();
        let container_state = if state.and_then(|s| s.paused) == Some(true) {
            ContainerState::Paused
        } else if state.and_then(|s| s.running) == Some(true) {
            ContainerState::Running
        } else {
            ContainerState::Exited
        };

        let ip = details.network_settings.as_ref().and_then(|ns| {
            ns.networks.as_ref().and_then(|nets| {
                nets.values()
                    .find_map(|n| n.ip_address.as_ref().filter(|ip| !ip.is_empty()).cloned())
            })
        });

        Ok(ContainerInfo {
            id: details.id.unwrap_or_else(|| id.to_string()),
            name: details.name.as_deref().map(strip_slash).unwrap_or_default(),
            image: details
                .config
                .as_ref()
                .and_then(|c| c.image.clone())
                .unwrap_or_default(),
            state: container_state,
            ip,
            labels: details
                .config
                .as_ref()
                .and_then(|c| c.labels.clone())
                .unwrap_or_default(),
            pid: state.and_then(|s| s.pid),
        })
    }

    async fn create(
        &self,
        spec: &CreateSpec,
        cancel: &CancellationToken,
    ) -> Result<String, DockerError> {
        debug!(name = %spec.name, image = %spec.image, "creating container");

        let host_config = HostConfig {
            network_mode: spec.network_mode.clone(),
            cap_add: if spec.cap_add.is_empty() {
                None
            } else {
                Some(spec.cap_add.clone())
            },
            auto_remove: Some(spec.auto_remove),
            ..Default::default()
        };

        let config = Config {
            image: Some(spec.image.clone()),
            cmd: if spec.cmd.is_empty() {
                None
            } else {
                Some(spec.cmd.clone())
            },
            labels: if spec.labels.is_empty() {
                None
            } else {
                Some(spec.labels.clone())
            },
            host_config: Some(host_config),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };

        let created = self
            .guard(cancel, self.docker.create_container(Some(options), config))
            .await?;
        Ok(created.id)
    }

    async fn start(&self, id: &str, cancel: &CancellationToken) -> Result<(), DockerError> {
        self.guard(cancel, self.docker.start_container::<String>(id, None))
            .await
    }

    async fn stop(
        &self,
        id: &str,
        grace_seconds: i64,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError> {
        let options = StopContainerOptions { t: grace_seconds };
        self.guard(cancel, self.docker.stop_container(id, Some(options)))
            .await
    }

    async fn kill(
        &self,
        id: &str,
        signal: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError> {
        let options = KillContainerOptions { signal };
        self.guard(cancel, self.docker.kill_container(id, Some(options)))
            .await
    }

    async fn pause(&self, id: &str, cancel: &CancellationToken) -> Result<(), DockerError> {
        self.guard(cancel, self.docker.pause_container(id)).await
    }

    async fn unpause(&self, id: &str, cancel: &CancellationToken) -> Result<(), DockerError> {
        self.guard(cancel, self.docker.unpause_container(id)).await
    }

    async fn remove(
        &self,
        id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError> {
        let options = RemoveContainerOptions {
            force,
            ..Default::default()
        };
        self.guard(cancel, self.docker.remove_container(id, Some(options)))
            .await
    }

    async fn resource_limits(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResourceLimits, DockerError> {
        let details = self
            .guard(cancel, self.docker.inspect_container(id, None))
            .await?;
        let host = details.host_config.unwrap_or_default();
        Ok(ResourceLimits {
            cpu_quota: host.cpu_quota,
            cpu_period: host.cpu_period,
            memory_bytes: host.memory,
            memory_swap_bytes: host.memory_swap,
        })
    }

    async fn update_resources(
        &self,
        id: &str,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError> {
        debug!(id = %id, ?limits, "updating container resources");
        let update = UpdateContainerOptions::<String> {
            cpu_quota: limits.cpu_quota,
            cpu_period: limits.cpu_period,
            memory: limits.memory_bytes,
            memory_swap: limits.memory_swap_bytes,
            ..Default::default()
        };
        self.guard(cancel, self.docker.update_container(id, update))
            .await
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[&str],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, DockerError> {
        trace!(id = %id, ?argv, "exec in container");

        let options = CreateExecOptions {
            cmd: Some(argv.iter().map(|s| s.to_string()).collect()),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };

        let exec = self
            .guard(cancel, self.docker.create_exec(id, options))
            .await?;

        let mut combined = String::new();
        let started = self
            .guard(cancel, self.docker.start_exec(&exec.id, None))
            .await?;

        if let StartExecResults::Attached { mut output, .. } = started {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return Err(DockerError::Cancelled),
                    msg = output.next() => match msg {
                        Some(Ok(chunk)) => combined.push_str(&String::from_utf8_lossy(&chunk.into_bytes())),
                        Some(Err(e)) => return Err(DockerError::from(e)),
                        None => break,
                    },
                }
            }
        }

        let inspect = self
            .guard(cancel, self.docker.inspect_exec(&exec.id))
            .await?;
        Ok(ExecOutput {
            output: combined,
            exit_code: inspect.exit_code.unwrap_or(-1),
        })
    }
}
