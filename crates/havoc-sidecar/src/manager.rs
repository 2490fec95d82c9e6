use std::collections::HashMap;
use std::sync::Arc;

use havoc_docker::{ContainerApi, ContainerFilter, CreateSpec, DockerError, ExecOutput};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SidecarError;

/// Every sidecar container name starts with this. The PREPARE pre-flight
/// sweep removes anything system-wide carrying the prefix, so crashed runs
/// never leak sidecars.
pub const SIDECAR_NAME_PREFIX: &str = "havoc-sidecar-";

const STOP_GRACE_SECONDS: i64 = 10;

/// Owns the target → sidecar binding map.
///
/// At most one sidecar exists per target; a second create for the same
/// target returns the existing id. Destruction is idempotent: a missing
/// binding, an already-stopped or already-removed container, and a removal
/// already in progress all count as success. The map is mutex-guarded
/// because the emergency path may call [`SidecarManager::destroy_all`]
/// concurrently with the orchestrator.
pub struct SidecarManager {
    api: Arc<dyn ContainerApi>,
    image: String,
    bindings: Mutex<HashMap<String, String>>,
}

impl SidecarManager {
    pub fn new(api: Arc<dyn ContainerApi>, image: impl Into<String>) -> Self {
        Self {
            api,
            image: image.into(),
            bindings: Mutex::new(HashMap::new()),
        }
    }

    /// Create (or reuse) the privileged sidecar sharing `target_id`'s
    /// network namespace. Returns the sidecar container id.
    pub async fn create_sidecar(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<String, SidecarError> {
        let mut bindings = self.bindings.lock().await;
        if let Some(existing) = bindings.get(target_id) {
            debug!(target = %target_id, sidecar = %existing, "sidecar already bound; reusing");
            return Ok(existing.clone());
        }

        let short: String = target_id.chars().take(12).collect();
        let spec = CreateSpec {
            name: format!("{}{}", SIDECAR_NAME_PREFIX, short),
            image: self.image.clone(),
            cmd: vec!["sleep".into(), "infinity".into()],
            network_mode: Some(format!("container:{}", target_id)),
            cap_add: vec!["NET_ADMIN".into(), "NET_RAW".into()],
            auto_remove: true,
            labels: HashMap::new(),
        };

        let sidecar_id = self
            .api
            .create(&spec, cancel)
            .await
            .map_err(|e| SidecarError::CreateFailed {
                target: target_id.to_string(),
                source: e,
            })?;
        self.api
            .start(&sidecar_id, cancel)
            .await
            .map_err(|e| SidecarError::CreateFailed {
                target: target_id.to_string(),
                source: e,
            })?;

        info!(target = %target_id, sidecar = %sidecar_id, "sidecar created");
        bindings.insert(target_id.to_string(), sidecar_id.clone());
        Ok(sidecar_id)
    }

    /// Run a command inside the sidecar bound to `target_id`. Namespace
    /// sharing makes it act on the target's network stack.
    pub async fn exec_in_sidecar(
        &self,
        target_id: &str,
        argv: &[&str],
        cancel: &CancellationToken,
    ) -> Result<ExecOutput, SidecarError> {
        let sidecar_id = {
            let bindings = self.bindings.lock().await;
            bindings
                .get(target_id)
                .cloned()
                .ok_or_else(|| SidecarError::NoSidecar(target_id.to_string()))?
        };
        Ok(self.api.exec(&sidecar_id, argv, cancel).await?)
    }

    /// Idempotently destroy the sidecar bound to `target_id`.
    pub async fn destroy_sidecar(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SidecarError> {
        let sidecar_id = {
            let mut bindings = self.bindings.lock().await;
            match bindings.remove(target_id) {
                Some(id) => id,
                None => return Ok(()), // nothing bound; already destroyed
            }
        };

        match self.api.stop(&sidecar_id, STOP_GRACE_SECONDS, cancel).await {
            Ok(()) => {}
            Err(e) if e.is_gone() => {}
            Err(e) => warn!(sidecar = %sidecar_id, error = %e, "sidecar stop failed; forcing removal"),
        }

        match self.api.remove(&sidecar_id, true, cancel).await {
            Ok(()) => {}
            // auto_remove may have beaten us to it
            Err(e) if e.is_gone() => {}
            Err(DockerError::Cancelled) => return Err(DockerError::Cancelled.into()),
            Err(e) => return Err(e.into()),
        }

        debug!(target = %target_id, sidecar = %sidecar_id, "sidecar destroyed");
        Ok(())
    }

    /// Destroy every tracked sidecar, aggregating failures instead of
    /// stopping at the first.
    pub async fn destroy_all(&self, cancel: &CancellationToken) -> Result<(), SidecarError> {
        let targets: Vec<String> = {
            let bindings = self.bindings.lock().await;
            bindings.keys().cloned().collect()
        };

        let mut failures = Vec::new();
        for target in targets {
            if let Err(e) = self.destroy_sidecar(&target, cancel).await {
                failures.push(format!("{}: {}", target, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(SidecarError::DestroyAggregate {
                count: failures.len(),
                details: failures.join("; "),
            })
        }
    }

    /// Snapshot of the binding map (target id → sidecar id).
    pub async fn bindings(&self) -> HashMap<String, String> {
        self.bindings.lock().await.clone()
    }

    pub async fn is_empty(&self) -> bool {
        self.bindings.lock().await.is_empty()
    }

    /// Pre-flight sweep: force-remove any container system-wide whose name
    /// carries the sidecar prefix. Catches leftovers from crashed runs.
    /// Returns how many were removed.
    pub async fn sweep_stale(&self, cancel: &CancellationToken) -> Result<usize, SidecarError> {
        let stale = self
            .api
            .list_containers(
                &ContainerFilter {
                    name_contains: Some(SIDECAR_NAME_PREFIX.to_string()),
                    all: true,
                    ..Default::default()
                },
                cancel,
            )
            .await?;

        let mut removed = 0;
        for container in stale {
            match self.api.remove(&container.id, true, cancel).await {
                Ok(()) => {
                    warn!(name = %container.name, "removed stale sidecar from previous run");
                    removed += 1;
                }
                Err(e) if e.is_gone() => {}
                Err(e) => {
                    warn!(name = %container.name, error = %e, "failed to remove stale sidecar")
                }
            }
        }
        Ok(removed)
    }
}
