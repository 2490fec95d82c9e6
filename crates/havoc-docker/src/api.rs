use std::collections::HashMap;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::DockerError;

/// Filter for [`ContainerApi::list_containers`].
#[derive(Debug, Clone, Default)]
pub struct ContainerFilter {
    /// Substring the container name must contain.
    pub name_contains: Option<String>,
    /// Include stopped containers.
    pub all: bool,
    /// `key=value` label filters.
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerState {
    Running,
    Paused,
    Exited,
    Unknown,
}

/// The subset of container metadata the orchestrator cares about.
#[derive(Debug, Clone)]
pub struct ContainerInfo {
    pub id: String,
    /// Name with the runtime's leading '/' already stripped.
    pub name: String,
    pub image: String,
    pub state: ContainerState,
    /// First network's IP, if attached.
    pub ip: Option<String>,
    pub labels: HashMap<String, String>,
    /// Host PID of the container's init process (None unless inspected).
    pub pid: Option<i64>,
}

impl ContainerInfo {
    pub fn is_running(&self) -> bool {
        self.state == ContainerState::Running
    }
}

/// Combined stdout+stderr of an in-container command.
#[derive(Debug, Clone, Default)]
pub struct ExecOutput {
    pub output: String,
    pub exit_code: i64,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// The resource-limit fields the stress faults snapshot and restore.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceLimits {
    pub cpu_quota: Option<i64>,
    pub cpu_period: Option<i64>,
    pub memory_bytes: Option<i64>,
    pub memory_swap_bytes: Option<i64>,
}

/// What to create. `network_mode = container:<id>` shares that container's
/// network namespace; NET_ADMIN + NET_RAW let the sidecar reshape it.
#[derive(Debug, Clone, Default)]
pub struct CreateSpec {
    pub name: String,
    pub image: String,
    pub cmd: Vec<String>,
    pub network_mode: Option<String>,
    pub cap_add: Vec<String>,
    pub auto_remove: bool,
    pub labels: HashMap<String, String>,
}

/// Thin adapter over the container runtime.
///
/// Everything above this trait (discovery, sidecars, faults, the runner)
/// speaks only this interface; [`crate::DockerClient`] implements it over the
/// real runtime and [`crate::FakeRuntime`] in memory for tests and dry
/// wiring. All operations honor the cancellation token.
#[async_trait]
pub trait ContainerApi: Send + Sync + 'static {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerInfo>, DockerError>;

    async fn inspect(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerInfo, DockerError>;

    /// Create a container and return its id (not started).
    async fn create(
        &self,
        spec: &CreateSpec,
        cancel: &CancellationToken,
    ) -> Result<String, DockerError>;

    async fn start(&self, id: &str, cancel: &CancellationToken) -> Result<(), DockerError>;

    async fn stop(
        &self,
        id: &str,
        grace_seconds: i64,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError>;

    async fn kill(
        &self,
        id: &str,
        signal: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError>;

    async fn pause(&self, id: &str, cancel: &CancellationToken) -> Result<(), DockerError>;

    async fn unpause(&self, id: &str, cancel: &CancellationToken) -> Result<(), DockerError>;

    async fn remove(
        &self,
        id: &str,
        force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError>;

    async fn resource_limits(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResourceLimits, DockerError>;

    async fn update_resources(
        &self,
        id: &str,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError>;

    /// Run `argv` inside the container, returning combined output and the
    /// exit code. A non-zero exit is not an error at this layer.
    async fn exec(
        &self,
        id: &str,
        argv: &[&str],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, DockerError>;
}
