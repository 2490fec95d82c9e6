use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use crate::api::{
    ContainerApi, ContainerFilter, ContainerInfo, ContainerState, CreateSpec, ExecOutput,
    ResourceLimits,
};
use crate::error::DockerError;

#[derive(Debug, Clone)]
struct FakeContainer {
    info: ContainerInfo,
    limits: ResourceLimits,
}

#[derive(Debug, Default)]
struct Inner {
    containers: HashMap<String, FakeContainer>,
    /// Scripted exec responses: first entry whose needle appears in the
    /// joined argv wins. Consulted in insertion order.
    exec_scripts: Vec<(String, ExecOutput)>,
    /// Every exec issued, per container id, argv joined with spaces.
    transcript: Vec<(String, String)>,
    next_id: u64,
}

/// In-memory [`ContainerApi`] implementation.
///
/// All state is lost on drop. Powers the test suite and dry wiring checks;
/// records an exec transcript so tests can assert the exact command
/// sequences the fault wrappers emit.
#[derive(Debug, Clone, Default)]
pub struct FakeRuntime {
    inner: Arc<RwLock<Inner>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a running container and return its id.
    pub async fn add_container(&self, name: &str, image: &str, ip: Option<&str>) -> String {
        let mut inner = self.inner.write().await;
        inner.next_id += 1;
        let id = format!("fake-{:04}", inner.next_id);
        let pid = 1000 + inner.next_id as i64;
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: name.to_string(),
                    image: image.to_string(),
                    state: ContainerState::Running,
                    ip: ip.map(String::from),
                    labels: HashMap::new(),
                    pid: Some(pid),
                },
                limits: ResourceLimits::default(),
            },
        );
        id
    }

    /// Script the output for any exec whose joined argv contains `needle`.
    pub async fn script_exec(&self, needle: &str, output: &str, exit_code: i64) {
        let mut inner = self.inner.write().await;
        inner.exec_scripts.push((
            needle.to_string(),
            ExecOutput {
                output: output.to_string(),
                exit_code,
            },
        ));
    }

    /// All execs recorded for a container, argv joined with spaces.
    pub async fn transcript_for(&self, id: &str) -> Vec<String> {
        let inner = self.inner.read().await;
        inner
            .transcript
            .iter()
            .filter(|(cid, _)| cid == id)
            .map(|(_, cmd)| cmd.clone())
            .collect()
    }

    pub async fn container_names(&self) -> Vec<String> {
        let inner = self.inner.read().await;
        let mut names: Vec<String> = inner
            .containers
            .values()
            .map(|c| c.info.name.clone())
            .collect();
        names.sort();
        names
    }

    pub async fn state_of(&self, id: &str) -> Option<ContainerState> {
        let inner = self.inner.read().await;
        inner.containers.get(id).map(|c| c.info.state)
    }

    pub async fn limits_of(&self, id: &str) -> Option<ResourceLimits> {
        let inner = self.inner.read().await;
        inner.containers.get(id).map(|c| c.limits)
    }

    pub async fn set_limits(&self, id: &str, limits: ResourceLimits) {
        let mut inner = self.inner.write().await;
        if let Some(c) = inner.containers.get_mut(id) {
            c.limits = limits;
        }
    }

    fn check_cancel(cancel: &CancellationToken) -> Result<(), DockerError> {
        if cancel.is_cancelled() {
            Err(DockerError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ContainerApi for FakeRuntime {
    async fn list_containers(
        &self,
        filter: &ContainerFilter,
        cancel: &CancellationToken,
    ) -> Result<Vec<ContainerInfo>, DockerError> {
        Self::check_cancel(cancel)?;
        let inner = self.inner.read().await;
        let mut out: Vec<ContainerInfo> = inner
            .containers
            .values()
            .filter(|c| filter.all || c.info.state == ContainerState::Running)
            .filter(|c| {
                filter
                    .name_contains
                    .as_deref()
                    .map_or(true, |needle| c.info.name.contains(needle))
            })
            .map(|c| c.info.clone())
            .collect();
        out.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(out)
    }

    async fn inspect(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ContainerInfo, DockerError> {
        Self::check_cancel(cancel)?;
        let inner = self.inner.read().await;
        inner
            .containers
            .get(id)
            .map(|c| c.info.clone())
            .ok_or_else(|| DockerError::NotFound(id.to_string()))
    }

    async fn create(
        &self,
        spec: &CreateSpec,
        cancel: &CancellationToken,
    ) -> Result<String, DockerError> {
        Self::check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        if inner.containers.values().any(|c| c.info.name == spec.name) {
            return Err(DockerError::Conflict(spec.name.clone()));
        }
        inner.next_id += 1;
        let id = format!("fake-{:04}", inner.next_id);
        inner.containers.insert(
            id.clone(),
            FakeContainer {
                info: ContainerInfo {
                    id: id.clone(),
                    name: spec.name.clone(),
                    image: spec.image.clone(),
                    state: ContainerState::Exited,
                    ip: None,
                    labels: spec.labels.clone(),
                    pid: None,
                },
                limits: ResourceLimits::default(),
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &str, cancel: &CancellationToken) -> Result<(), DockerError> {
        Self::check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DockerError::NotFound(id.to_string()))?;
        c.info.state = ContainerState::Running;
        Ok(())
    }

    async fn stop(
        &self,
        id: &str,
        _grace_seconds: i64,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError> {
        Self::check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DockerError::NotFound(id.to_string()))?;
        c.info.state = ContainerState::Exited;
        Ok(())
    }

    async fn kill(
        &self,
        id: &str,
        _signal: &str,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError> {
        Self::check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DockerError::NotFound(id.to_string()))?;
        c.info.state = ContainerState::Exited;
        Ok(())
    }

    async fn pause(&self, id: &str, cancel: &CancellationToken) -> Result<(), DockerError> {
        Self::check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DockerError::NotFound(id.to_string()))?;
        c.info.state = ContainerState::Paused;
        Ok(())
    }

    async fn unpause(&self, id: &str, cancel: &CancellationToken) -> Result<(), DockerError> {
        Self::check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DockerError::NotFound(id.to_string()))?;
        c.info.state = ContainerState::Running;
        Ok(())
    }

    async fn remove(
        &self,
        id: &str,
        _force: bool,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError> {
        Self::check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        inner
            .containers
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DockerError::NotFound(id.to_string()))
    }

    async fn resource_limits(
        &self,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<ResourceLimits, DockerError> {
        Self::check_cancel(cancel)?;
        let inner = self.inner.read().await;
        inner
            .containers
            .get(id)
            .map(|c| c.limits)
            .ok_or_else(|| DockerError::NotFound(id.to_string()))
    }

    async fn update_resources(
        &self,
        id: &str,
        limits: &ResourceLimits,
        cancel: &CancellationToken,
    ) -> Result<(), DockerError> {
        Self::check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        let c = inner
            .containers
            .get_mut(id)
            .ok_or_else(|| DockerError::NotFound(id.to_string()))?;
        // Mirror the runtime's merge semantics: None fields leave the
        // current value in place.
        if limits.cpu_quota.is_some() {
            c.limits.cpu_quota = limits.cpu_quota;
        }
        if limits.cpu_period.is_some() {
            c.limits.cpu_period = limits.cpu_period;
        }
        if limits.memory_bytes.is_some() {
            c.limits.memory_bytes = limits.memory_bytes;
        }
        if limits.memory_swap_bytes.is_some() {
            c.limits.memory_swap_bytes = limits.memory_swap_bytes;
        }
        Ok(())
    }

    async fn exec(
        &self,
        id: &str,
        argv: &[&str],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, DockerError> {
        Self::check_cancel(cancel)?;
        let mut inner = self.inner.write().await;
        if !inner.containers.contains_key(id) {
            return Err(DockerError::NotFound(id.to_string()));
        }
        let joined = argv.join(" ");
        inner.transcript.push((id.to_string(), joined.clone()));
        let scripted = inner
            .exec_scripts
            .iter()
            .find(|(needle, _)| joined.contains(needle.as_str()))
            .map(|(_, out)| out.clone());
        Ok(scripted.unwrap_or_default())
    }
}
