use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use havoc_domain::{AuditEntry, Fault, ResolvedTarget};
use havoc_metrics::CriterionResult;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::RunnerError;

/// Experiment lifecycle states, in transition order.
///
/// Transitions:
///   Parse → Discover → Prepare → Warmup → Inject → Monitor → Cooldown
///     → Teardown → Detect → Report → Completed
/// Any state may transition to Failed; Completed/Failed are terminal.
/// Cancellation or emergency stop jumps directly to Teardown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Parse,
    Discover,
    Prepare,
    Warmup,
    Inject,
    Monitor,
    Cooldown,
    Teardown,
    Detect,
    Report,
    Completed,
    Failed,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Parse => "PARSE",
            Phase::Discover => "DISCOVER",
            Phase::Prepare => "PREPARE",
            Phase::Warmup => "WARMUP",
            Phase::Inject => "INJECT",
            Phase::Monitor => "MONITOR",
            Phase::Cooldown => "COOLDOWN",
            Phase::Teardown => "TEARDOWN",
            Phase::Detect => "DETECT",
            Phase::Report => "REPORT",
            Phase::Completed => "COMPLETED",
            Phase::Failed => "FAILED",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseTiming {
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

/// The persisted record of one experiment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExperimentReport {
    /// Short id used in the report filename.
    pub test_id: String,
    pub scenario_name: String,
    /// Canonical hash of the scenario input, for rerun matching.
    pub scenario_hash: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_phase: Phase,
    pub passed: bool,
    pub interrupted: bool,
    pub dry_run: bool,
    pub phase_timings: Vec<PhaseTiming>,
    pub targets: Vec<ResolvedTarget>,
    pub faults: Vec<Fault>,
    pub criteria: Vec<CriterionResult>,
    pub cleanup_audit: Vec<AuditEntry>,
    pub errors: Vec<String>,
    /// Sampled metric time series from MONITOR: name → (unix ts, value).
    #[serde(default)]
    pub metrics: BTreeMap<String, Vec<(f64, f64)>>,
}

impl ExperimentReport {
    pub fn new(scenario_name: &str, scenario_hash: &str, dry_run: bool) -> Self {
        Self {
            test_id: uuid::Uuid::new_v4().simple().to_string()[..8].to_string(),
            scenario_name: scenario_name.to_string(),
            scenario_hash: scenario_hash.to_string(),
            started_at: Utc::now(),
            finished_at: None,
            final_phase: Phase::Parse,
            passed: false,
            interrupted: false,
            dry_run,
            phase_timings: Vec::new(),
            targets: Vec::new(),
            faults: Vec::new(),
            criteria: Vec::new(),
            cleanup_audit: Vec::new(),
            errors: Vec::new(),
            metrics: BTreeMap::new(),
        }
    }

    /// Close the open timing (if any) and start the next phase.
    pub fn enter_phase(&mut self, phase: Phase) {
        let now = Utc::now();
        if let Some(last) = self.phase_timings.last_mut() {
            if last.finished_at.is_none() {
                last.finished_at = Some(now);
            }
        }
        debug!(phase = %phase, "entering phase");
        self.phase_timings.push(PhaseTiming {
            phase,
            started_at: now,
            finished_at: None,
        });
        self.final_phase = phase;
    }

    pub fn finish(&mut self, terminal: Phase) {
        let now = Utc::now();
        if let Some(last) = self.phase_timings.last_mut() {
            if last.finished_at.is_none() {
                last.finished_at = Some(now);
            }
        }
        self.final_phase = terminal;
        self.finished_at = Some(now);
    }
}

/// Writes reports as stable-named JSON files and prunes old ones.
pub struct ReportStore {
    dir: PathBuf,
    /// Keep the newest N reports.
    retention: usize,
}

impl ReportStore {
    pub fn new(dir: impl Into<PathBuf>, retention: usize) -> Self {
        Self {
            dir: dir.into(),
            retention: retention.max(1),
        }
    }

    /// Persist `report-<YYYYMMDD-HHMMSS>-<testID>.json`, then prune the
    /// oldest files past the retention limit.
    pub fn save(&self, report: &ExperimentReport) -> Result<PathBuf, RunnerError> {
        std::fs::create_dir_all(&self.dir).map_err(|e| RunnerError::Io {
            path: self.dir.display().to_string(),
            source: e,
        })?;

        let stamp = report.started_at.format("%Y%m%d-%H%M%S");
        let path = self.dir.join(format!("report-{}-{}.json", stamp, report.test_id));
        let json = serde_json::to_vec_pretty(report)?;
        std::fs::write(&path, json).map_err(|e| RunnerError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        info!(path = %path.display(), "report written");

        self.prune()?;
        Ok(path)
    }

    fn prune(&self) -> Result<(), RunnerError> {
        let mut reports = list_reports(&self.dir)?;
        if reports.len() <= self.retention {
            return Ok(());
        }
        // Filenames embed the timestamp, so lexicographic order is age order.
        reports.sort();
        let excess = reports.len() - self.retention;
        for path in reports.into_iter().take(excess) {
            debug!(path = %path.display(), "pruning old report");
            std::fs::remove_file(&path).map_err(|e| RunnerError::Io {
                path: path.display().to_string(),
                source: e,
            })?;
        }
        Ok(())
    }
}

fn list_reports(dir: &Path) -> Result<Vec<PathBuf>, RunnerError> {
    let entries = std::fs::read_dir(dir).map_err(|e| RunnerError::Io {
        path: dir.display().to_string(),
        source: e,
    })?;
    Ok(entries
        .flatten()
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map_or(false, |n| n.starts_with("report-") && n.ends_with(".json"))
        })
        .collect())
}
