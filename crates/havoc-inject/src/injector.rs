use std::sync::Arc;

use havoc_docker::ContainerApi;
use havoc_domain::{Fault, FaultKind, ResolvedTarget};
use havoc_sidecar::SidecarManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::InjectError;
use crate::lifecycle::LifecycleManager;
use crate::process::ProcessManager;
use crate::resources::ResourceManager;
use crate::{dns, firewall, shaping};

/// Unified fault entry point: dispatches `(kind, targets, params)` to the
/// right mechanism and knows each kind's inverse.
///
/// Shared by the orchestrator's concurrent INJECT tasks; the stateful
/// managers inside guard their own maps.
pub struct FaultInjector {
    sidecars: Arc<SidecarManager>,
    lifecycle: LifecycleManager,
    resources: ResourceManager,
    processes: ProcessManager,
}

impl FaultInjector {
    pub fn new(api: Arc<dyn ContainerApi>, sidecars: Arc<SidecarManager>) -> Self {
        Self {
            sidecars,
            lifecycle: LifecycleManager::new(api.clone()),
            resources: ResourceManager::new(api.clone()),
            processes: ProcessManager::new(api),
        }
    }

    /// Apply one fault to its resolved target group. Parameter type
    /// violations surface before anything is touched.
    pub async fn inject(
        &self,
        fault: &Fault,
        targets: &[ResolvedTarget],
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let unknown = fault.params.unknown_keys(fault.kind);
        if !unknown.is_empty() {
            warn!(
                phase = %fault.phase,
                kind = %fault.kind,
                keys = ?unknown,
                "ignoring unrecognized parameter keys"
            );
        }

        debug!(
            phase = %fault.phase,
            kind = %fault.kind,
            targets = targets.len(),
            "injecting fault"
        );

        match fault.kind {
            FaultKind::Network => {
                for target in targets {
                    shaping::apply(&self.sidecars, fault, target, cancel).await?;
                }
            }
            FaultKind::ConnectionDrop => {
                for target in targets {
                    firewall::apply(&self.sidecars, fault, target, cancel).await?;
                }
            }
            FaultKind::Dns => {
                for target in targets {
                    dns::apply(&self.sidecars, fault, target, cancel).await?;
                }
            }
            FaultKind::ContainerRestart => {
                self.lifecycle.restart(fault, targets, cancel).await?;
            }
            FaultKind::ContainerKill => {
                for target in targets {
                    self.lifecycle.kill(fault, target, cancel).await?;
                }
            }
            FaultKind::ContainerPause => {
                for target in targets {
                    self.lifecycle.pause(fault, target, cancel).await?;
                }
            }
            FaultKind::CpuStress => {
                for target in targets {
                    self.resources.cpu_stress(fault, target, cancel).await?;
                }
            }
            FaultKind::MemoryStress => {
                for target in targets {
                    self.resources.memory_stress(fault, target, cancel).await?;
                }
            }
            FaultKind::ProcessPriority => {
                for target in targets {
                    self.processes.set_priority(fault, target, cancel).await?;
                }
            }
            FaultKind::DiskIo => {
                for target in targets {
                    self.processes.set_disk_idle(fault, target, cancel).await?;
                }
            }
        }

        Ok(())
    }

    /// Apply the inverse of `kind` on one target. Kinds without an inverse
    /// succeed immediately.
    pub async fn remove(
        &self,
        kind: FaultKind,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        debug!(kind = %kind, target = %target_id, "removing fault");
        match kind {
            FaultKind::Network => shaping::remove(&self.sidecars, target_id, cancel).await,
            FaultKind::ConnectionDrop => firewall::remove(&self.sidecars, target_id, cancel).await,
            FaultKind::Dns => dns::remove(&self.sidecars, target_id, cancel).await,
            FaultKind::ContainerRestart | FaultKind::ContainerKill => Ok(()),
            FaultKind::ContainerPause => {
                self.lifecycle.unpause_if_paused(target_id, cancel).await
            }
            FaultKind::CpuStress => self.resources.remove_cpu(target_id, cancel).await,
            FaultKind::MemoryStress => self.resources.remove_memory(target_id, cancel).await,
            FaultKind::ProcessPriority => self.processes.reset_priority(target_id, cancel).await,
            FaultKind::DiskIo => self.processes.reset_disk(target_id, cancel).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_docker::FakeRuntime;
    use havoc_domain::FaultParams;

    fn fault(kind: FaultKind, params: FaultParams) -> Fault {
        Fault {
            phase: "test".into(),
            description: None,
            target_alias: "t".into(),
            kind,
            params,
        }
    }

    fn resolved(id: &str, name: &str) -> ResolvedTarget {
        ResolvedTarget {
            alias: "t".into(),
            container_id: id.into(),
            name: name.into(),
            ip: None,
        }
    }

    async fn setup() -> (FakeRuntime, FaultInjector, String) {
        let rt = FakeRuntime::new();
        let target = rt.add_container("validator1", "node:v1", None).await;
        let api: Arc<dyn ContainerApi> = Arc::new(rt.clone());
        let sidecars = Arc::new(SidecarManager::new(api.clone(), "havoc/netshaper:latest"));
        let cancel = CancellationToken::new();
        sidecars.create_sidecar(&target, &cancel).await.unwrap();
        let injector = FaultInjector::new(api, sidecars);
        (rt, injector, target)
    }

    #[tokio::test]
    async fn inject_then_remove_network_is_symmetric() {
        let (rt, injector, target) = setup().await;
        let cancel = CancellationToken::new();

        let f = fault(FaultKind::Network, FaultParams::new().with("latency", 200));
        injector
            .inject(&f, &[resolved(&target, "validator1")], &cancel)
            .await
            .unwrap();
        injector
            .remove(FaultKind::Network, &target, &cancel)
            .await
            .unwrap();

        // Commands went to the sidecar, not the target.
        let target_transcript = rt.transcript_for(&target).await;
        assert!(target_transcript.is_empty());
    }

    #[tokio::test]
    async fn remove_of_inverse_free_kind_is_instant_success() {
        let (_rt, injector, target) = setup().await;
        let cancel = CancellationToken::new();

        injector
            .remove(FaultKind::ContainerRestart, &target, &cancel)
            .await
            .unwrap();
        injector
            .remove(FaultKind::ContainerKill, &target, &cancel)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn bad_parameter_type_fails_before_side_effects() {
        let (rt, injector, target) = setup().await;
        let cancel = CancellationToken::new();

        let f = fault(
            FaultKind::MemoryStress,
            FaultParams::new().with("memory_mb", "lots"),
        );
        let err = injector
            .inject(&f, &[resolved(&target, "validator1")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::Parameter(_)));
        assert!(rt.transcript_for(&target).await.is_empty());
    }
}
