use std::collections::HashMap;
use std::sync::Arc;

use havoc_docker::{ContainerApi, ResourceLimits};
use havoc_domain::{Fault, ResolvedTarget};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::InjectError;

/// Written back when the container originally had no limit. The runtime has
/// no "clear limit" call short of recreating the container, so restore sets
/// a limit high enough to never bind (1 TiB / a full CPU).
pub const UNLIMITED_SENTINEL_BYTES: i64 = 1 << 40;

const DEFAULT_CPU_PERIOD: i64 = 100_000;
/// Marker embedded in the busy-loop command line so removal can pkill it.
const STRESS_MARKER: &str = "havoc_cpu_stress";

/// CPU and memory stress with snapshot/restore semantics.
///
/// The pre-fault limits are captured at the *first* application per target
/// and restored exactly on removal. The snapshot map is mutex-guarded for
/// the emergency-cleanup path.
pub struct ResourceManager {
    api: Arc<dyn ContainerApi>,
    /// Separate maps per fault kind: a scenario may stress cpu and memory
    /// on one container, and each removal restores only its own half.
    cpu_snapshots: Mutex<HashMap<String, ResourceLimits>>,
    memory_snapshots: Mutex<HashMap<String, ResourceLimits>>,
}

impl ResourceManager {
    pub fn new(api: Arc<dyn ContainerApi>) -> Self {
        Self {
            api,
            cpu_snapshots: Mutex::new(HashMap::new()),
            memory_snapshots: Mutex::new(HashMap::new()),
        }
    }

    /// Snapshot the target's limits unless already captured.
    async fn snapshot(
        &self,
        target_id: &str,
        kind: RestoreKind,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let map = match kind {
            RestoreKind::Cpu => &self.cpu_snapshots,
            RestoreKind::Memory => &self.memory_snapshots,
        };
        let mut snapshots = map.lock().await;
        if snapshots.contains_key(target_id) {
            return Ok(());
        }
        let limits = self.api.resource_limits(target_id, cancel).await?;
        debug!(target = %target_id, ?limits, "resource limits snapshotted");
        snapshots.insert(target_id.to_string(), limits);
        Ok(())
    }

    /// `method: "stress"` (default) execs busy loops in the target;
    /// `method: "limit"` caps the CPU quota instead.
    pub async fn cpu_stress(
        &self,
        fault: &Fault,
        target: &ResolvedTarget,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let p = &fault.params;
        let method = p.get_str("method")?.unwrap_or("stress").to_string();
        let cpu_percent = p.percent("cpu_percent")?.unwrap_or(100.0);
        let cores = p.get_u64("cores")?.unwrap_or(1).max(1);

        match method.as_str() {
            "limit" => {
                self.snapshot(&target.container_id, RestoreKind::Cpu, cancel).await?;
                let quota =
                    (DEFAULT_CPU_PERIOD as f64 * (cpu_percent / 100.0) * cores as f64) as i64;
                self.api
                    .update_resources(
                        &target.container_id,
                        &ResourceLimits {
                            cpu_quota: Some(quota.max(1_000)),
                            cpu_period: Some(DEFAULT_CPU_PERIOD),
                            ..Default::default()
                        },
                        cancel,
                    )
                    .await?;
                info!(target = %target.name, cpu_percent, cores, "cpu quota capped");
            }
            _ => {
                // Busy loop with a duty cycle: burn for busy_ms, sleep the
                // rest of each 100ms slot. The marker variable makes the
                // loops pkill-able on removal.
                let busy_ms = cpu_percent.clamp(1.0, 100.0);
                let idle = (100.0 - busy_ms) / 1000.0;
                let script = format!(
                    "{marker}=1; while true; do end=$((($(date +%s%N) / 1000000) + {busy})); \
                     while [ $(($(date +%s%N) / 1000000)) -lt $end ]; do :; done; \
                     sleep {idle}; done",
                    marker = STRESS_MARKER,
                    busy = busy_ms as u64,
                    idle = idle,
                );
                for _ in 0..cores {
                    let spawn = format!("nohup sh -c '{}' >/dev/null 2>&1 &", script);
                    let out = self
                        .api
                        .exec(&target.container_id, &["sh", "-c", &spawn], cancel)
                        .await?;
                    if !out.success() {
                        return Err(InjectError::CommandFailed {
                            target: target.container_id.clone(),
                            command: "cpu stress spawn".into(),
                            exit_code: out.exit_code,
                            output: out.output,
                        });
                    }
                }
                info!(target = %target.name, cpu_percent, cores, "cpu busy loops started");
            }
        }
        Ok(())
    }

    /// Clamp memory to `memory_mb`, swap held equal so no swap relief.
    pub async fn memory_stress(
        &self,
        fault: &Fault,
        target: &ResolvedTarget,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let p = &fault.params;
        let memory_mb = p.get_u64("memory_mb")?.unwrap_or(256).max(8);
        let bytes = (memory_mb as i64) << 20;

        self.snapshot(&target.container_id, RestoreKind::Memory, cancel).await?;
        self.api
            .update_resources(
                &target.container_id,
                &ResourceLimits {
                    memory_bytes: Some(bytes),
                    memory_swap_bytes: Some(bytes),
                    ..Default::default()
                },
                cancel,
            )
            .await?;

        info!(target = %target.name, memory_mb, "memory clamped");
        Ok(())
    }

    /// Inverse for cpu_stress: kill busy loops and restore the snapshotted
    /// quota/period.
    pub async fn remove_cpu(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        // Harmless when the method was "limit" and no loops exist.
        let _ = self
            .api
            .exec(target_id, &["pkill", "-9", "-f", STRESS_MARKER], cancel)
            .await;

        self.restore(target_id, RestoreKind::Cpu, cancel).await
    }

    /// Inverse for memory_stress.
    pub async fn remove_memory(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        self.restore(target_id, RestoreKind::Memory, cancel).await
    }

    async fn restore(
        &self,
        target_id: &str,
        kind: RestoreKind,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let map = match kind {
            RestoreKind::Cpu => &self.cpu_snapshots,
            RestoreKind::Memory => &self.memory_snapshots,
        };
        let snapshot = map.lock().await.get(target_id).copied();
        let Some(saved) = snapshot else {
            debug!(target = %target_id, "no resource snapshot; nothing to restore");
            return Ok(());
        };

        let update = match kind {
            RestoreKind::Cpu => ResourceLimits {
                // 0 stored quota means "no limit"; the sentinel expresses
                // that as a full CPU at the default period.
                cpu_quota: Some(match saved.cpu_quota {
                    Some(q) if q > 0 => q,
                    _ => DEFAULT_CPU_PERIOD,
                }),
                cpu_period: Some(match saved.cpu_period {
                    Some(p) if p > 0 => p,
                    _ => DEFAULT_CPU_PERIOD,
                }),
                ..Default::default()
            },
            RestoreKind::Memory => {
                let mem = match saved.memory_bytes {
                    Some(m) if m > 0 => m,
                    _ => UNLIMITED_SENTINEL_BYTES,
                };
                let swap = match saved.memory_swap_bytes {
                    Some(s) if s > 0 => s,
                    _ => UNLIMITED_SENTINEL_BYTES,
                };
                ResourceLimits {
                    memory_bytes: Some(mem),
                    memory_swap_bytes: Some(swap.max(mem)),
                    ..Default::default()
                }
            }
        };

        if let Err(e) = self.api.update_resources(target_id, &update, cancel).await {
            warn!(target = %target_id, error = %e, "resource restore failed");
            return Err(e.into());
        }

        map.lock().await.remove(target_id);
        Ok(())
    }
}

#[derive(Clone, Copy)]
enum RestoreKind {
    Cpu,
    Memory,
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_docker::FakeRuntime;
    use havoc_domain::{FaultKind, FaultParams};

    fn fault(kind: FaultKind, params: FaultParams) -> Fault {
        Fault {
            phase: "stress".into(),
            description: None,
            target_alias: "t".into(),
            kind,
            params,
        }
    }

    fn resolved(id: &str) -> ResolvedTarget {
        ResolvedTarget {
            alias: "t".into(),
            container_id: id.into(),
            name: "validator1".into(),
            ip: None,
        }
    }

    #[tokio::test]
    async fn limit_method_caps_quota_and_restores() {
        let rt = FakeRuntime::new();
        let id = rt.add_container("validator1", "node:v1", None).await;
        rt.set_limits(
            &id,
            ResourceLimits {
                cpu_quota: Some(200_000),
                cpu_period: Some(100_000),
                ..Default::default()
            },
        )
        .await;

        let mgr = ResourceManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let f = fault(
            FaultKind::CpuStress,
            FaultParams::new()
                .with("method", "limit")
                .with("cpu_percent", 50),
        );
        mgr.cpu_stress(&f, &resolved(&id), &cancel).await.unwrap();
        assert_eq!(rt.limits_of(&id).await.unwrap().cpu_quota, Some(50_000));

        mgr.remove_cpu(&id, &cancel).await.unwrap();
        let after = rt.limits_of(&id).await.unwrap();
        assert_eq!(after.cpu_quota, Some(200_000));
        assert_eq!(after.cpu_period, Some(100_000));
    }

    #[tokio::test]
    async fn memory_restore_uses_sentinel_for_unlimited() {
        let rt = FakeRuntime::new();
        let id = rt.add_container("validator1", "node:v1", None).await;
        // default fake limits: all None = unlimited

        let mgr = ResourceManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let f = fault(FaultKind::MemoryStress, FaultParams::new().with("memory_mb", 512));
        mgr.memory_stress(&f, &resolved(&id), &cancel).await.unwrap();
        assert_eq!(rt.limits_of(&id).await.unwrap().memory_bytes, Some(512 << 20));

        mgr.remove_memory(&id, &cancel).await.unwrap();
        let after = rt.limits_of(&id).await.unwrap();
        assert_eq!(after.memory_bytes, Some(UNLIMITED_SENTINEL_BYTES));
        assert_eq!(after.memory_swap_bytes, Some(UNLIMITED_SENTINEL_BYTES));
    }

    #[tokio::test]
    async fn memory_restore_returns_exact_prior_limit() {
        let rt = FakeRuntime::new();
        let id = rt.add_container("validator1", "node:v1", None).await;
        rt.set_limits(
            &id,
            ResourceLimits {
                memory_bytes: Some(1 << 30),
                memory_swap_bytes: Some(2 << 30),
                ..Default::default()
            },
        )
        .await;

        let mgr = ResourceManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let f = fault(FaultKind::MemoryStress, FaultParams::new().with("memory_mb", 128));
        mgr.memory_stress(&f, &resolved(&id), &cancel).await.unwrap();
        mgr.remove_memory(&id, &cancel).await.unwrap();

        let after = rt.limits_of(&id).await.unwrap();
        assert_eq!(after.memory_bytes, Some(1 << 30));
        assert_eq!(after.memory_swap_bytes, Some(2 << 30));
    }

    #[tokio::test]
    async fn snapshot_taken_once_not_overwritten() {
        let rt = FakeRuntime::new();
        let id = rt.add_container("validator1", "node:v1", None).await;
        rt.set_limits(
            &id,
            ResourceLimits {
                memory_bytes: Some(1 << 30),
                memory_swap_bytes: Some(1 << 30),
                ..Default::default()
            },
        )
        .await;

        let mgr = ResourceManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        // Two applications; the second must not re-snapshot the clamped value.
        let f1 = fault(FaultKind::MemoryStress, FaultParams::new().with("memory_mb", 256));
        let f2 = fault(FaultKind::MemoryStress, FaultParams::new().with("memory_mb", 128));
        mgr.memory_stress(&f1, &resolved(&id), &cancel).await.unwrap();
        mgr.memory_stress(&f2, &resolved(&id), &cancel).await.unwrap();
        mgr.remove_memory(&id, &cancel).await.unwrap();

        assert_eq!(rt.limits_of(&id).await.unwrap().memory_bytes, Some(1 << 30));
    }

    #[tokio::test]
    async fn cpu_and_memory_restores_are_independent() {
        let rt = FakeRuntime::new();
        let id = rt.add_container("validator1", "node:v1", None).await;
        rt.set_limits(
            &id,
            ResourceLimits {
                cpu_quota: Some(200_000),
                cpu_period: Some(100_000),
                memory_bytes: Some(1 << 30),
                memory_swap_bytes: Some(1 << 30),
            },
        )
        .await;

        let mgr = ResourceManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let cpu = fault(
            FaultKind::CpuStress,
            FaultParams::new()
                .with("method", "limit")
                .with("cpu_percent", 25),
        );
        let mem = fault(FaultKind::MemoryStress, FaultParams::new().with("memory_mb", 64));
        mgr.cpu_stress(&cpu, &resolved(&id), &cancel).await.unwrap();
        mgr.memory_stress(&mem, &resolved(&id), &cancel).await.unwrap();

        // Removing cpu first must not consume the memory snapshot.
        mgr.remove_cpu(&id, &cancel).await.unwrap();
        mgr.remove_memory(&id, &cancel).await.unwrap();

        let after = rt.limits_of(&id).await.unwrap();
        assert_eq!(after.cpu_quota, Some(200_000));
        assert_eq!(after.memory_bytes, Some(1 << 30));
    }

    #[tokio::test]
    async fn stress_method_spawns_loops_and_kills_them() {
        let rt = FakeRuntime::new();
        let id = rt.add_container("validator1", "node:v1", None).await;
        let mgr = ResourceManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let f = fault(
            FaultKind::CpuStress,
            FaultParams::new().with("cores", 2).with("cpu_percent", 80),
        );
        mgr.cpu_stress(&f, &resolved(&id), &cancel).await.unwrap();

        let transcript = rt.transcript_for(&id).await;
        let spawns: Vec<&String> = transcript
            .iter()
            .filter(|c| c.contains(STRESS_MARKER) && c.contains("nohup"))
            .collect();
        assert_eq!(spawns.len(), 2);

        mgr.remove_cpu(&id, &cancel).await.unwrap();
        let transcript = rt.transcript_for(&id).await;
        assert!(transcript
            .iter()
            .any(|c| c.starts_with("pkill") && c.contains(STRESS_MARKER)));
    }
}
