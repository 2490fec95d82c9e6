use std::collections::HashMap;
use std::sync::Arc;

use havoc_docker::ContainerApi;
use havoc_domain::{Fault, ResolvedTarget};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::InjectError;

/// Process-level faults: scheduler priority and disk I/O class.
///
/// PIDs are recorded at injection so removal can undo exactly what was
/// touched without re-running pattern matching against a process table that
/// may have changed.
pub struct ProcessManager {
    api: Arc<dyn ContainerApi>,
    reniced: Mutex<HashMap<String, i64>>,
    io_declassed: Mutex<HashMap<String, Vec<i64>>>,
}

impl ProcessManager {
    pub fn new(api: Arc<dyn ContainerApi>) -> Self {
        Self {
            api,
            reniced: Mutex::new(HashMap::new()),
            io_declassed: Mutex::new(HashMap::new()),
        }
    }

    /// Find the first PID matching `process_pattern` and renice it.
    pub async fn set_priority(
        &self,
        fault: &Fault,
        target: &ResolvedTarget,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let p = &fault.params;
        let pattern = p.get_str("process_pattern")?.unwrap_or("").to_string();
        let priority = p.niceness("priority")?.unwrap_or(19);

        let id = &target.container_id;
        let pid = self.first_pid_matching(id, &pattern, cancel).await;
        let Some(pid) = pid else {
            // Diagnostic miss, not a fault failure.
            warn!(target = %target.name, pattern = %pattern, "no process matched; skipping renice");
            return Ok(());
        };

        let prio = priority.to_string();
        let pid_str = pid.to_string();
        let out = self
            .api
            .exec(id, &["renice", "-n", &prio, "-p", &pid_str], cancel)
            .await?;
        if !out.success() {
            return Err(InjectError::CommandFailed {
                target: id.clone(),
                command: format!("renice -n {} -p {}", prio, pid),
                exit_code: out.exit_code,
                output: out.output,
            });
        }

        self.reniced.lock().await.insert(id.clone(), pid);
        info!(target = %target.name, pid, priority, "process priority lowered");
        Ok(())
    }

    /// Inverse: renice the recorded PID back to 0.
    pub async fn reset_priority(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let pid = self.reniced.lock().await.remove(target_id);
        let Some(pid) = pid else { return Ok(()) };
        let pid_str = pid.to_string();
        let _ = self
            .api
            .exec(target_id, &["renice", "-n", "0", "-p", &pid_str], cancel)
            .await;
        Ok(())
    }

    /// Put the PIDs holding `target_path` open into the idle I/O class.
    /// With `lsof` missing (common in slim images) falls back to PID 1.
    pub async fn set_disk_idle(
        &self,
        fault: &Fault,
        target: &ResolvedTarget,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let p = &fault.params;
        let path = p.get_str("target_path")?.unwrap_or("/").to_string();
        // io_latency_ms and operation are recorded for the report; the idle
        // class is the mechanism actually available through the runtime.
        let _ = p.get_f64("io_latency_ms")?;
        let _ = p.get_str("operation")?;

        let id = &target.container_id;
        let pids = self.pids_holding(id, &path, cancel).await;

        for pid in &pids {
            let pid_str = pid.to_string();
            let out = self
                .api
                .exec(id, &["ionice", "-c", "3", "-p", &pid_str], cancel)
                .await?;
            if !out.success() {
                warn!(target = %target.name, pid, "ionice failed; continuing");
            }
        }

        self.io_declassed.lock().await.insert(id.clone(), pids.clone());
        info!(target = %target.name, path = %path, count = pids.len(), "disk i/o declassed to idle");
        Ok(())
    }

    /// Inverse: back to best-effort class.
    pub async fn reset_disk(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let pids = self.io_declassed.lock().await.remove(target_id);
        let Some(pids) = pids else { return Ok(()) };
        for pid in pids {
            let pid_str = pid.to_string();
            let _ = self
                .api
                .exec(target_id, &["ionice", "-c", "2", "-n", "4", "-p", &pid_str], cancel)
                .await;
        }
        Ok(())
    }

    async fn first_pid_matching(
        &self,
        target_id: &str,
        pattern: &str,
        cancel: &CancellationToken,
    ) -> Option<i64> {
        let out = self
            .api
            .exec(target_id, &["pgrep", "-f", pattern], cancel)
            .await
            .ok()?;
        if !out.success() {
            return None;
        }
        out.output.lines().find_map(|l| l.trim().parse::<i64>().ok())
    }

    async fn pids_holding(
        &self,
        target_id: &str,
        path: &str,
        cancel: &CancellationToken,
    ) -> Vec<i64> {
        match self.api.exec(target_id, &["lsof", "-t", path], cancel).await {
            Ok(out) if out.success() => {
                let pids: Vec<i64> = out
                    .output
                    .lines()
                    .filter_map(|l| l.trim().parse::<i64>().ok())
                    .collect();
                if pids.is_empty() {
                    debug!(target = %target_id, path = %path, "lsof found nothing; falling back to pid 1");
                    vec![1]
                } else {
                    pids
                }
            }
            _ => {
                debug!(target = %target_id, "lsof unavailable; falling back to pid 1");
                vec![1]
            }
        }
    }
}
