use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use havoc_docker::{ContainerApi, ContainerState};
use havoc_domain::{Fault, ResolvedTarget};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::InjectError;

const DEFAULT_GRACE_SECONDS: u64 = 10;
const STATE_WAIT_TIMEOUT: Duration = Duration::from_secs(60);
/// Poll interval for state waits and interruptible sleeps. Cancellation
/// becomes effective within this bound.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Container lifecycle faults: restart, kill, pause.
///
/// The paused-container set is mutex-guarded because removal may run from
/// the emergency path concurrently with the orchestrator.
pub struct LifecycleManager {
    api: Arc<dyn ContainerApi>,
    paused: Mutex<HashSet<String>>,
}

impl LifecycleManager {
    pub fn new(api: Arc<dyn ContainerApi>) -> Self {
        Self {
            api,
            paused: Mutex::new(HashSet::new()),
        }
    }

    /// Restart the fault's whole target group.
    ///
    /// `stagger > 0` restarts targets one at a time with that many seconds
    /// between them; otherwise the group goes down together (stop-all, then
    /// start-all) so the fault hits the whole tier in the same instant.
    pub async fn restart(
        &self,
        fault: &Fault,
        targets: &[ResolvedTarget],
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let p = &fault.params;
        let grace = p.get_u64("grace_period")?.unwrap_or(DEFAULT_GRACE_SECONDS);
        let restart_delay = p.get_u64("restart_delay")?.unwrap_or(0);
        let stagger = p.get_u64("stagger")?.unwrap_or(0);

        if stagger > 0 {
            for (i, target) in targets.iter().enumerate() {
                if i > 0 {
                    sleep_interruptible(Duration::from_secs(stagger), cancel).await?;
                }
                self.restart_one(target, grace, restart_delay, cancel).await?;
            }
            return Ok(());
        }

        // Phase-simultaneous: the whole group is down at once.
        for target in targets {
            self.api.stop(&target.container_id, grace as i64, cancel).await?;
        }
        for target in targets {
            self.wait_state(&target.container_id, false, cancel).await?;
        }
        if restart_delay > 0 {
            sleep_interruptible(Duration::from_secs(restart_delay), cancel).await?;
        }
        for target in targets {
            self.api.start(&target.container_id, cancel).await?;
        }
        for target in targets {
            self.wait_state(&target.container_id, true, cancel).await?;
        }

        info!(count = targets.len(), phase = %fault.phase, "container group restarted");
        Ok(())
    }

    async fn restart_one(
        &self,
        target: &ResolvedTarget,
        grace: u64,
        restart_delay: u64,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        debug!(target = %target.name, "restarting container");
        self.api.stop(&target.container_id, grace as i64, cancel).await?;
        self.wait_state(&target.container_id, false, cancel).await?;
        if restart_delay > 0 {
            sleep_interruptible(Duration::from_secs(restart_delay), cancel).await?;
        }
        self.api.start(&target.container_id, cancel).await?;
        self.wait_state(&target.container_id, true, cancel).await
    }

    /// Kill with a signal; optionally bring the container back up.
    pub async fn kill(
        &self,
        fault: &Fault,
        target: &ResolvedTarget,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let p = &fault.params;
        let signal = p.get_str("signal")?.unwrap_or("SIGKILL").to_string();
        let restart = p.get_bool("restart")?.unwrap_or(false);
        let restart_delay = p.get_u64("restart_delay")?.unwrap_or(0);

        info!(target = %target.name, signal = %signal, restart, "killing container");
        self.api.kill(&target.container_id, &signal, cancel).await?;

        if restart {
            if restart_delay > 0 {
                sleep_interruptible(Duration::from_secs(restart_delay), cancel).await?;
            }
            self.api.start(&target.container_id, cancel).await?;
            self.wait_state(&target.container_id, true, cancel).await?;
        }
        Ok(())
    }

    /// Pause, tracking the container so teardown can unpause it. With a
    /// `duration` and `unpause` not disabled, the unpause happens in-band
    /// after that long.
    pub async fn pause(
        &self,
        fault: &Fault,
        target: &ResolvedTarget,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let p = &fault.params;
        let duration = p.get_duration("duration")?;
        let unpause = p.get_bool("unpause")?.unwrap_or(duration.is_some());

        info!(target = %target.name, ?duration, "pausing container");
        self.api.pause(&target.container_id, cancel).await?;
        self.paused.lock().await.insert(target.container_id.clone());

        if let (Some(d), true) = (duration, unpause) {
            // Even if the sleep is interrupted, the container must come back.
            let slept = sleep_interruptible(d, cancel).await;
            self.unpause_if_paused(&target.container_id, cancel).await?;
            slept?;
        }
        Ok(())
    }

    /// Inverse for pause faults; a no-op when the container was already
    /// unpaused in-band.
    pub async fn unpause_if_paused(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let was_paused = self.paused.lock().await.remove(target_id);
        if !was_paused {
            return Ok(());
        }
        match self.api.unpause(target_id, cancel).await {
            Ok(()) => Ok(()),
            Err(e) if e.is_gone() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Poll until the container is (not) running.
    async fn wait_state(
        &self,
        id: &str,
        want_running: bool,
        cancel: &CancellationToken,
    ) -> Result<(), InjectError> {
        let deadline = tokio::time::Instant::now() + STATE_WAIT_TIMEOUT;
        loop {
            if cancel.is_cancelled() {
                return Err(InjectError::Cancelled);
            }
            let info = self.api.inspect(id, cancel).await?;
            let running = info.state == ContainerState::Running;
            if running == want_running {
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(InjectError::StateTimeout {
                    target: id.to_string(),
                    state: if want_running { "running" } else { "stopped" }.to_string(),
                });
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }
}

/// Sleep in [`POLL_INTERVAL`] slices so cancellation interrupts promptly.
pub(crate) async fn sleep_interruptible(
    total: Duration,
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    let deadline = tokio::time::Instant::now() + total;
    loop {
        if cancel.is_cancelled() {
            return Err(InjectError::Cancelled);
        }
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Ok(());
        }
        let chunk = POLL_INTERVAL.min(deadline - now);
        tokio::time::sleep(chunk).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_docker::FakeRuntime;
    use havoc_domain::{FaultKind, FaultParams};

    fn fault(kind: FaultKind, params: FaultParams) -> Fault {
        Fault {
            phase: "lifecycle".into(),
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

    #[tokio::test]
    async fn restart_brings_group_back_up() {
        let rt = FakeRuntime::new();
        let a = rt.add_container("validator1", "node:v1", None).await;
        let b = rt.add_container("validator2", "node:v1", None).await;
        let mgr = LifecycleManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let f = fault(FaultKind::ContainerRestart, FaultParams::new());
        mgr.restart(&f, &[resolved(&a, "validator1"), resolved(&b, "validator2")], &cancel)
            .await
            .unwrap();

        assert_eq!(rt.state_of(&a).await, Some(ContainerState::Running));
        assert_eq!(rt.state_of(&b).await, Some(ContainerState::Running));
    }

    #[tokio::test]
    async fn kill_without_restart_leaves_container_down() {
        let rt = FakeRuntime::new();
        let a = rt.add_container("validator1", "node:v1", None).await;
        let mgr = LifecycleManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let f = fault(
            FaultKind::ContainerKill,
            FaultParams::new().with("signal", "SIGTERM"),
        );
        mgr.kill(&f, &resolved(&a, "validator1"), &cancel).await.unwrap();
        assert_eq!(rt.state_of(&a).await, Some(ContainerState::Exited));
    }

    #[tokio::test]
    async fn kill_with_restart_waits_for_running() {
        let rt = FakeRuntime::new();
        let a = rt.add_container("validator1", "node:v1", None).await;
        let mgr = LifecycleManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let f = fault(
            FaultKind::ContainerKill,
            FaultParams::new().with("restart", true),
        );
        mgr.kill(&f, &resolved(&a, "validator1"), &cancel).await.unwrap();
        assert_eq!(rt.state_of(&a).await, Some(ContainerState::Running));
    }

    #[tokio::test]
    async fn pause_then_teardown_unpause() {
        let rt = FakeRuntime::new();
        let a = rt.add_container("validator1", "node:v1", None).await;
        let mgr = LifecycleManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let f = fault(FaultKind::ContainerPause, FaultParams::new());
        mgr.pause(&f, &resolved(&a, "validator1"), &cancel).await.unwrap();
        assert_eq!(rt.state_of(&a).await, Some(ContainerState::Paused));

        mgr.unpause_if_paused(&a, &cancel).await.unwrap();
        assert_eq!(rt.state_of(&a).await, Some(ContainerState::Running));

        // second unpause is a no-op
        mgr.unpause_if_paused(&a, &cancel).await.unwrap();
    }

    #[tokio::test]
    async fn timed_pause_unpauses_in_band() {
        let rt = FakeRuntime::new();
        let a = rt.add_container("validator1", "node:v1", None).await;
        let mgr = LifecycleManager::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        let f = fault(
            FaultKind::ContainerPause,
            FaultParams::new().with("duration", "0s"),
        );
        mgr.pause(&f, &resolved(&a, "validator1"), &cancel).await.unwrap();
        assert_eq!(rt.state_of(&a).await, Some(ContainerState::Running));
    }

    #[tokio::test]
    async fn interruptible_sleep_returns_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = sleep_interruptible(Duration::from_secs(60), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::Cancelled));
    }
}
