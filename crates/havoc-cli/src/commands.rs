use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use havoc_config::Overrides;
use havoc_docker::DockerClient;
use havoc_enclave::EnclaveTool;
use havoc_fuzz::{FuzzConfig, FuzzSession, TriggerCondition};
use havoc_runner::{EmergencyController, ExperimentRunner, RunnerConfig, DEFAULT_SENTINEL_PATH};
use tracing::{info, warn};

use crate::cli::OutputFormat;
use crate::output;

/// Candidate service names the metrics endpoint may be registered under.
const METRICS_SERVICE_CANDIDATES: &[&str] = &["metrics-001", "metrics", "prometheus"];

/// Use the explicit URL when given; otherwise ask the enclave tool.
/// Discovery failure is not fatal here — DETECT hard-fails later only if
/// metric criteria actually need the service.
async fn resolve_metrics_url(explicit: Option<String>, enclave: &str) -> Option<String> {
    if explicit.is_some() {
        return explicit;
    }
    if enclave.is_empty() {
        return None;
    }
    match EnclaveTool::default()
        .discover_endpoint(enclave, METRICS_SERVICE_CANDIDATES, "http")
        .await
    {
        Ok(url) => {
            info!(url = %url, "metrics endpoint discovered");
            Some(url)
        }
        Err(e) => {
            warn!(error = %e, "metrics endpoint discovery failed");
            None
        }
    }
}

// ── run ───────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn run(
    scenario_path: PathBuf,
    enclave: Option<String>,
    set: Vec<String>,
    format: OutputFormat,
    dry_run: bool,
    report_dir: PathBuf,
    metrics_url: Option<String>,
    rpc_url: Option<String>,
    sidecar_image: String,
) -> Result<i32> {
    let mut overrides = Overrides::default();
    if let Some(enclave) = &enclave {
        overrides.enclave = Some(enclave.clone());
    }
    for pair in &set {
        let (key, value) = pair
            .split_once('=')
            .with_context(|| format!("--set '{}' is not KEY=VALUE", pair))?;
        overrides.set(key, value)?;
    }

    let scenario = match havoc_config::load_scenario(&scenario_path, &overrides) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("scenario invalid: {}", e);
            return Ok(2);
        }
    };

    let enclave = enclave.unwrap_or_default();
    let metrics_url = if dry_run {
        metrics_url
    } else {
        resolve_metrics_url(metrics_url, &enclave).await
    };
    let config = RunnerConfig {
        enclave,
        sidecar_image,
        metrics_url,
        rpc_url,
        dry_run,
        report_dir: if dry_run { None } else { Some(report_dir) },
        ..Default::default()
    };

    let api = Arc::new(DockerClient::connect().context("cannot reach the container runtime")?);
    let runner = Arc::new(ExperimentRunner::new(api, config));

    // Emergency path: sentinel file + signals → stop and clean up, once.
    let controller = EmergencyController::new(DEFAULT_SENTINEL_PATH);
    controller.register(runner.stop_listener()).await;
    let watchers = controller.clone().spawn();

    let report = runner.run(&scenario).await?;

    for handle in watchers {
        handle.abort();
    }

    match format {
        OutputFormat::Text => print!("{}", output::render_report(&report)),
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
    }

    Ok(if report.passed { 0 } else { 1 })
}

// ── fuzz ──────────────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
pub async fn fuzz(
    enclave: String,
    rounds: usize,
    compound_only: bool,
    single_only: bool,
    max_faults: usize,
    trigger: String,
    seed: u64,
    dry_run: bool,
    log: PathBuf,
    metrics_url: Option<String>,
    rpc_url: Option<String>,
    sidecar_image: String,
) -> Result<i32> {
    let trigger: TriggerCondition = trigger
        .parse()
        .map_err(|e: String| anyhow::anyhow!(e))?;

    let compound_bias = if compound_only {
        1.0
    } else if single_only {
        0.0
    } else {
        0.35
    };

    let metrics_url = if dry_run {
        metrics_url
    } else {
        resolve_metrics_url(metrics_url, &enclave).await
    };
    let runner_config = RunnerConfig {
        enclave: enclave.clone(),
        sidecar_image,
        metrics_url,
        rpc_url,
        ..Default::default()
    };
    let fuzz_config = FuzzConfig {
        enclave,
        rounds,
        seed,
        compound_bias,
        max_faults: max_faults.max(2),
        trigger,
        dry_run,
        log_path: log,
    };

    let api = Arc::new(DockerClient::connect().context("cannot reach the container runtime")?);

    let controller = EmergencyController::new(DEFAULT_SENTINEL_PATH);
    let stop = controller.stop_token();
    let watchers = controller.spawn();
    let session = FuzzSession::new(api, runner_config, fuzz_config, stop);

    let summary = session.run().await?;

    for handle in watchers {
        handle.abort();
    }

    print!("{}", output::render_summary(&summary));
    Ok(if summary.failed > 0 { 1 } else { 0 })
}
