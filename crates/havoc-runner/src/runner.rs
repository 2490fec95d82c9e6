use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use havoc_docker::ContainerApi;
use havoc_domain::{scenario_hash, CriterionCheck, FaultKind, ResolvedTarget, Scenario};
use havoc_enclave::resolve_targets;
use havoc_inject::{FaultInjector, InjectError};
use havoc_metrics::{Evaluator, MetricsClient, RpcClient};
use havoc_sidecar::{CleanupCoordinator, SidecarManager, Verifier};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::emergency::{StopListener, DEFAULT_SENTINEL_PATH};
use crate::error::RunnerError;
use crate::report::{ExperimentReport, Phase, ReportStore};

/// Poll interval for interruptible sleeps; cancellation and emergency stop
/// become effective within this bound.
const SLEEP_POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Default enclave for selectors that don't name one.
    pub enclave: String,
    pub sidecar_image: String,
    pub metrics_url: Option<String>,
    pub rpc_url: Option<String>,
    pub sentinel_path: PathBuf,
    /// Validate and wire only; touch no container.
    pub dry_run: bool,
    /// Metric sampling cadence during MONITOR.
    pub sample_interval: Duration,
    pub report_dir: Option<PathBuf>,
    pub report_retention: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            enclave: String::new(),
            sidecar_image: "havoc/netshaper:latest".to_string(),
            metrics_url: None,
            rpc_url: None,
            sentinel_path: PathBuf::from(DEFAULT_SENTINEL_PATH),
            dry_run: false,
            sample_interval: Duration::from_secs(15),
            report_dir: None,
            report_retention: 50,
        }
    }
}

/// Why the active phases stopped early.
enum Interrupt {
    Cancelled,
    Failed(String),
}

/// Drives one experiment PARSE → … → REPORT with strict cleanup guarantees:
/// whatever DISCOVER/PREPARE/INJECT touched is torn down on success,
/// failure, cancellation, and panic alike.
pub struct ExperimentRunner {
    api: Arc<dyn ContainerApi>,
    config: RunnerConfig,
    cancel: CancellationToken,
    sidecars: Arc<SidecarManager>,
    injector: Arc<FaultInjector>,
    coordinator: Arc<CleanupCoordinator>,
    /// (container id, fault kind) recorded after each successful injection,
    /// consumed for symmetric removal at TEARDOWN.
    injected: Arc<Mutex<Vec<(String, FaultKind)>>>,
}

impl ExperimentRunner {
    pub fn new(api: Arc<dyn ContainerApi>, config: RunnerConfig) -> Self {
        let sidecars = Arc::new(SidecarManager::new(api.clone(), config.sidecar_image.clone()));
        let coordinator = Arc::new(CleanupCoordinator::new(
            sidecars.clone(),
            Verifier::new(api.clone()),
        ));
        let injector = Arc::new(FaultInjector::new(api.clone(), sidecars.clone()));
        Self {
            api,
            config,
            cancel: CancellationToken::new(),
            sidecars,
            injector,
            coordinator,
            injected: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Cancelling this token interrupts the experiment; it jumps to
    /// TEARDOWN at the next poll point.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The listener the orchestrator registers with the emergency
    /// controller: stop, remove applied faults, clean up sidecars.
    pub fn stop_listener(&self) -> Arc<dyn StopListener> {
        Arc::new(CleanupOnStop {
            cancel: self.cancel.clone(),
            injector: self.injector.clone(),
            coordinator: self.coordinator.clone(),
            injected: self.injected.clone(),
        })
    }

    pub async fn bindings_empty(&self) -> bool {
        self.sidecars.is_empty().await
    }

    /// Run one scenario end to end. The returned report carries the final
    /// phase; errors during the run are recorded rather than raised so the
    /// report always exists.
    pub async fn run(&self, scenario: &Scenario) -> Result<ExperimentReport, RunnerError> {
        let mut report = ExperimentReport::new(
            &scenario.metadata.name,
            &scenario_hash(scenario),
            self.config.dry_run,
        );
        info!(scenario = %scenario.metadata.name, test_id = %report.test_id, "starting experiment");

        // PARSE — cross-reference validation, before any side effect.
        report.enter_phase(Phase::Parse);
        if let Err(e) = havoc_domain::validate(scenario) {
            report.errors.push(e.to_string());
            report.finish(Phase::Failed);
            return Ok(report);
        }

        if self.config.dry_run {
            info!("dry run: scenario valid; no container will be touched");
            report.passed = true;
            report.finish(Phase::Completed);
            return Ok(report);
        }

        // DISCOVER — fatal before any side effect.
        report.enter_phase(Phase::Discover);
        let targets = match resolve_targets(
            self.api.as_ref(),
            &self.config.enclave,
            &scenario.spec.targets,
            &self.cancel,
        )
        .await
        {
            Ok(t) => t,
            Err(e) => {
                report.errors.push(e.to_string());
                report.finish(Phase::Failed);
                return Ok(report);
            }
        };
        report.targets = targets.clone();
        report.faults = scenario.spec.faults.clone();

        // PREPARE … COOLDOWN run under a panic guard so a panic still
        // reaches TEARDOWN below.
        let metrics_buffer: Arc<Mutex<BTreeMap<String, Vec<(f64, f64)>>>> =
            Arc::new(Mutex::new(BTreeMap::new()));
        let outcome = std::panic::AssertUnwindSafe(self.active_phases(
            scenario,
            &targets,
            &mut report,
            metrics_buffer.clone(),
        ))
        .catch_unwind()
        .await;

        let mut detect_allowed = true;
        match outcome {
            Ok(Ok(())) => {}
            Ok(Err(Interrupt::Cancelled)) => {
                warn!("experiment interrupted; jumping to teardown");
                report.interrupted = true;
                report.errors.push("experiment interrupted".to_string());
                detect_allowed = false;
            }
            Ok(Err(Interrupt::Failed(msg))) => {
                report.errors.push(msg);
                detect_allowed = false;
            }
            Err(panic) => {
                let reason = panic_message(panic);
                error!(reason = %reason, "panic during experiment; running teardown");
                report.errors.push(format!("panic: {}", reason));
                detect_allowed = false;
            }
        }

        // TEARDOWN — always runs, on a fresh token so an interrupted run
        // still cleans up. Errors are logged, never block DETECT.
        report.enter_phase(Phase::Teardown);
        let teardown_cancel = CancellationToken::new();
        let applied: Vec<(String, FaultKind)> =
            self.injected.lock().await.drain(..).collect();
        for (target_id, kind) in applied {
            if let Err(e) = self.injector.remove(kind, &target_id, &teardown_cancel).await {
                warn!(target = %target_id, kind = %kind, error = %e, "fault removal failed");
                report
                    .errors
                    .push(format!("remove {} on {}: {}", kind, target_id, e));
            }
        }
        report.cleanup_audit = self.coordinator.cleanup_all(&teardown_cancel).await;
        report.metrics = std::mem::take(&mut *metrics_buffer.lock().await);

        // DETECT — skipped on interruption/failure; those are already FAILED.
        if detect_allowed {
            report.enter_phase(Phase::Detect);
            match self.detect(scenario, &mut report).await {
                Ok(all_critical_passed) => report.passed = all_critical_passed,
                Err(e) => {
                    // Metrics-service unreachable at DETECT is a hard failure.
                    report.errors.push(format!("criteria evaluation failed: {}", e));
                    report.passed = false;
                }
            }
        }

        // REPORT
        report.enter_phase(Phase::Report);
        let terminal = if report.passed && report.errors.is_empty() {
            Phase::Completed
        } else {
            Phase::Failed
        };
        report.finish(terminal);

        if let Some(dir) = &self.config.report_dir {
            let store = ReportStore::new(dir, self.config.report_retention);
            if let Err(e) = store.save(&report) {
                warn!(error = %e, "failed to persist report");
            }
        }

        info!(
            test_id = %report.test_id,
            passed = report.passed,
            phase = %report.final_phase,
            "experiment finished"
        );
        Ok(report)
    }

    async fn active_phases(
        &self,
        scenario: &Scenario,
        targets: &[ResolvedTarget],
        report: &mut ExperimentReport,
        metrics_buffer: Arc<Mutex<BTreeMap<String, Vec<(f64, f64)>>>>,
    ) -> Result<(), Interrupt> {
        // PREPARE
        report.enter_phase(Phase::Prepare);
        self.prepare(targets)
            .await
            .map_err(|e| Interrupt::Failed(format!("prepare: {}", e)))?;

        // WARMUP
        report.enter_phase(Phase::Warmup);
        self.sleep_interruptible(scenario.spec.warmup).await?;

        // INJECT
        report.enter_phase(Phase::Inject);
        self.inject_all(scenario, targets).await?;

        // MONITOR
        report.enter_phase(Phase::Monitor);
        let sampler_stop = CancellationToken::new();
        let sampler = self.spawn_sampler(
            scenario.spec.collect_metrics.clone(),
            metrics_buffer,
            sampler_stop.clone(),
        );
        let slept = self.sleep_interruptible(scenario.spec.duration).await;
        sampler_stop.cancel();
        if let Some(handle) = sampler {
            let _ = handle.await;
        }
        slept?;

        // COOLDOWN
        report.enter_phase(Phase::Cooldown);
        self.sleep_interruptible(scenario.spec.cooldown).await?;

        Ok(())
    }

    /// PREPARE: sweep stale sidecars system-wide, clear the emergency
    /// sentinel, pre-clear leftover traffic-control state per target, then
    /// create this run's sidecars.
    async fn prepare(&self, targets: &[ResolvedTarget]) -> Result<(), RunnerError> {
        let swept = self.sidecars.sweep_stale(&self.cancel).await?;
        if swept > 0 {
            warn!(count = swept, "pre-flight removed stale sidecars");
        }

        if self.config.sentinel_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.config.sentinel_path) {
                warn!(error = %e, "could not remove stale emergency sentinel");
            } else {
                info!("removed stale emergency sentinel");
            }
        }

        let verifier = Verifier::new(self.api.clone());
        for target in targets {
            let verification = verifier.verify_clean(&target.container_id, &self.cancel).await?;
            if verification.tc_found {
                warn!(target = %target.name, "leftover traffic-control rules; pre-clearing");
                self.sidecars
                    .create_sidecar(&target.container_id, &self.cancel)
                    .await?;
                let _ = self
                    .sidecars
                    .exec_in_sidecar(
                        &target.container_id,
                        &["tcdel", "--device", "eth0", "--all"],
                        &self.cancel,
                    )
                    .await;
                let _ = self
                    .sidecars
                    .exec_in_sidecar(
                        &target.container_id,
                        &["tc", "qdisc", "del", "dev", "eth0", "root"],
                        &self.cancel,
                    )
                    .await;
                self.sidecars
                    .destroy_sidecar(&target.container_id, &self.cancel)
                    .await?;
            }
        }

        for target in targets {
            self.sidecars
                .create_sidecar(&target.container_id, &self.cancel)
                .await?;
        }
        Ok(())
    }

    /// INJECT: one task per fault, all started together. The first error is
    /// surfaced only after every task finished, so each reaches a
    /// consistent state before teardown. Success records the
    /// target → kind pairs for symmetric removal.
    async fn inject_all(
        &self,
        scenario: &Scenario,
        targets: &[ResolvedTarget],
    ) -> Result<(), Interrupt> {
        let mut join = tokio::task::JoinSet::new();

        for fault in &scenario.spec.faults {
            let group: Vec<ResolvedTarget> = targets
                .iter()
                .filter(|t| t.alias == fault.target_alias)
                .cloned()
                .collect();
            let fault = fault.clone();
            let injector = self.injector.clone();
            let injected = self.injected.clone();
            let cancel = self.cancel.clone();

            join.spawn(async move {
                let phase = fault.phase.clone();
                let kind = fault.kind;
                let result = injector.inject(&fault, &group, &cancel).await;
                if result.is_ok() {
                    let mut lock = injected.lock().await;
                    for target in &group {
                        lock.push((target.container_id.clone(), kind));
                    }
                }
                (phase, kind, result)
            });
        }

        let mut cancelled = false;
        let mut first_error: Option<String> = None;
        while let Some(joined) = join.join_next().await {
            match joined {
                Ok((_, _, Ok(()))) => {}
                Ok((_, _, Err(InjectError::Cancelled))) => cancelled = true,
                Ok((phase, kind, Err(e))) => {
                    let msg = format!("fault '{}' ({}): {}", phase, kind, e);
                    error!("{}", msg);
                    first_error.get_or_insert(msg);
                }
                Err(e) if e.is_panic() => {
                    first_error.get_or_insert("inject task panicked".to_string());
                }
                Err(e) => {
                    first_error.get_or_insert(format!("inject task failed: {}", e));
                }
            }
        }

        match (first_error, cancelled) {
            (Some(msg), _) => Err(Interrupt::Failed(msg)),
            (None, true) => Err(Interrupt::Cancelled),
            (None, false) => Ok(()),
        }
    }

    /// DETECT: evaluate criteria in scenario order. A failed critical
    /// criterion fails the experiment; non-critical failures only log.
    async fn detect(
        &self,
        scenario: &Scenario,
        report: &mut ExperimentReport,
    ) -> Result<bool, RunnerError> {
        if scenario.spec.success_criteria.is_empty() {
            return Ok(true);
        }

        let needs_metrics = scenario.spec.success_criteria.iter().any(|c| {
            matches!(
                c.check,
                CriterionCheck::MetricQuery { .. } | CriterionCheck::HealthCheck { .. }
            )
        });
        let metrics_url = match (&self.config.metrics_url, needs_metrics) {
            (Some(url), _) => url.clone(),
            (None, true) => {
                return Err(havoc_metrics::MetricsError::BadResponse(
                    "metric criteria present but no metrics service configured".into(),
                )
                .into())
            }
            // Only rpc criteria; the metrics client is never used.
            (None, false) => "http://127.0.0.1:0".to_string(),
        };

        let rpc = match &self.config.rpc_url {
            Some(url) => Some(RpcClient::new(url)?),
            None => None,
        };
        let evaluator = Evaluator::new(MetricsClient::new(metrics_url)?, rpc);

        let mut all_critical_passed = true;
        for criterion in &scenario.spec.success_criteria {
            let result = evaluator.evaluate(criterion).await?;
            if !result.passed && result.critical {
                all_critical_passed = false;
            }
            report.criteria.push(result);
        }
        Ok(all_critical_passed)
    }

    fn spawn_sampler(
        &self,
        metric_names: Vec<String>,
        buffer: Arc<Mutex<BTreeMap<String, Vec<(f64, f64)>>>>,
        stop: CancellationToken,
    ) -> Option<tokio::task::JoinHandle<()>> {
        if metric_names.is_empty() {
            return None;
        }
        let url = self.config.metrics_url.clone()?;
        let interval = self.config.sample_interval;

        Some(tokio::spawn(async move {
            let Ok(client) = MetricsClient::new(url) else {
                return;
            };
            loop {
                for name in &metric_names {
                    if stop.is_cancelled() {
                        return;
                    }
                    match client.query_latest(name).await {
                        Ok(samples) => {
                            if let Some(s) = samples.first() {
                                buffer
                                    .lock()
                                    .await
                                    .entry(name.clone())
                                    .or_default()
                                    .push((s.timestamp, s.value));
                            }
                        }
                        Err(e) => warn!(metric = %name, error = %e, "metric sample failed"),
                    }
                }
                tokio::select! {
                    _ = stop.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
            }
        }))
    }

    /// Sleep in short slices; cancellation interrupts within
    /// [`SLEEP_POLL_INTERVAL`].
    async fn sleep_interruptible(&self, total: Duration) -> Result<(), Interrupt> {
        if total.is_zero() {
            return Ok(());
        }
        let deadline = tokio::time::Instant::now() + total;
        loop {
            if self.cancel.is_cancelled() {
                return Err(Interrupt::Cancelled);
            }
            let now = tokio::time::Instant::now();
            if now >= deadline {
                return Ok(());
            }
            tokio::time::sleep(SLEEP_POLL_INTERVAL.min(deadline - now)).await;
        }
    }
}

/// Registered with the emergency controller: interrupt the run, remove
/// whatever was injected, and clean up sidecars. Idempotent against the
/// orchestrator's own TEARDOWN.
struct CleanupOnStop {
    cancel: CancellationToken,
    injector: Arc<FaultInjector>,
    coordinator: Arc<CleanupCoordinator>,
    injected: Arc<Mutex<Vec<(String, FaultKind)>>>,
}

#[async_trait]
impl StopListener for CleanupOnStop {
    async fn on_stop(&self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let fresh = CancellationToken::new();
        let applied: Vec<(String, FaultKind)> = self.injected.lock().await.drain(..).collect();
        for (target_id, kind) in applied {
            if let Err(e) = self.injector.remove(kind, &target_id, &fresh).await {
                warn!(target = %target_id, kind = %kind, error = %e, "emergency fault removal failed");
            }
        }
        let audit = self.coordinator.cleanup_all(&fresh).await;
        let failures = audit.iter().filter(|e| !e.success).count();
        if failures > 0 {
            anyhow::bail!("{} cleanup step(s) failed", failures);
        }
        Ok(())
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
