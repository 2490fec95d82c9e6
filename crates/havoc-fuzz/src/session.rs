use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};
use havoc_docker::ContainerApi;
use havoc_metrics::MetricsClient;
use havoc_runner::{ExperimentRunner, RunnerConfig};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

use crate::error::FuzzError;
use crate::sample::Sampler;
use crate::scenario::build_scenario;
use crate::tiers::TierRegistry;
use crate::trigger::{TriggerCondition, TriggerOutcome, TriggerWaiter};

#[derive(Debug, Clone)]
pub struct FuzzConfig {
    pub enclave: String,
    pub rounds: usize,
    /// 0 means auto (derived from the clock at session start, then logged).
    pub seed: u64,
    /// Probability a round is a compound of 2..=max_faults faults.
    pub compound_bias: f64,
    pub max_faults: usize,
    pub trigger: TriggerCondition,
    pub dry_run: bool,
    /// JSONL round log, append-only.
    pub log_path: PathBuf,
}

impl Default for FuzzConfig {
    fn default() -> Self {
        Self {
            enclave: String::new(),
            rounds: 10,
            seed: 0,
            compound_bias: 0.35,
            max_faults: 2,
            trigger: TriggerCondition::Any,
            dry_run: false,
            log_path: PathBuf::from("havoc-fuzz.jsonl"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RoundOutcome {
    Passed,
    Failed,
    DryRun,
    Interrupted,
}

/// One JSONL line per round. Never rewritten.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoundRecord {
    pub session_id: String,
    pub seed: u64,
    pub round: usize,
    pub name: String,
    /// `kind@tier` per sampled fault.
    pub faults: Vec<String>,
    pub trigger: Option<String>,
    pub result: RoundOutcome,
    pub elapsed_s: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub seed: u64,
    pub rounds_requested: usize,
    pub rounds_run: usize,
    pub passed: usize,
    pub failed: usize,
    pub dry_runs: usize,
    pub interrupted: usize,
    /// Present whenever any round failed: rerun with the same seed and
    /// round count to reproduce the exact sequence.
    pub repro_command: Option<String>,
}

/// Runs seeded rounds sequentially: sample → build → (trigger) → run →
/// log. The orchestrator's own cancellation path handles in-flight
/// cleanup; the session only decides when to stop starting new rounds.
pub struct FuzzSession {
    api: Arc<dyn ContainerApi>,
    runner_config: RunnerConfig,
    config: FuzzConfig,
    stop: CancellationToken,
}

impl FuzzSession {
    pub fn new(
        api: Arc<dyn ContainerApi>,
        runner_config: RunnerConfig,
        config: FuzzConfig,
        stop: CancellationToken,
    ) -> Self {
        Self {
            api,
            runner_config,
            config,
            stop,
        }
    }

    pub async fn run(&self) -> Result<SessionSummary, FuzzError> {
        let seed = if self.config.seed == 0 {
            // Auto seed comes from the clock once, at session start; the
            // sampler itself never reads wall time.
            Utc::now().timestamp_nanos_opt().unwrap_or(1) as u64
        } else {
            self.config.seed
        };
        let session_id = Uuid::new_v4().simple().to_string()[..8].to_string();
        info!(
            session = %session_id,
            seed,
            rounds = self.config.rounds,
            dry_run = self.config.dry_run,
            "fuzz session starting"
        );

        let mut sampler = Sampler::new(seed, TierRegistry::default_devnet());
        let metrics = self
            .runner_config
            .metrics_url
            .as_ref()
            .and_then(|url| MetricsClient::new(url).ok());
        let waiter = TriggerWaiter::new(metrics);

        let mut records: Vec<RoundRecord> = Vec::new();

        for round in 1..=self.config.rounds {
            if self.stop.is_cancelled() {
                info!(session = %session_id, "session interrupted between rounds");
                break;
            }

            let faults = sampler.sample(self.config.compound_bias, self.config.max_faults);
            let scenario = build_scenario(&mut sampler, round, &faults, &self.config.enclave);
            let fault_tags: Vec<String> = faults
                .iter()
                .map(|f| format!("{}@{}", f.kind, f.tier.name))
                .collect();
            info!(round, name = %scenario.metadata.name, faults = ?fault_tags, "round starting");

            let started = Instant::now();

            let trigger = if self.config.dry_run {
                None
            } else {
                match waiter.wait(self.config.trigger, &self.stop).await {
                    TriggerOutcome::Cancelled => {
                        let record = self.record(
                            &session_id,
                            seed,
                            round,
                            &scenario.metadata.name,
                            fault_tags,
                            None,
                            RoundOutcome::Interrupted,
                            started,
                        );
                        self.append_jsonl(&record)?;
                        records.push(record);
                        break;
                    }
                    outcome => Some(format!("{}:{:?}", self.config.trigger, outcome)),
                }
            };

            let mut runner_config = self.runner_config.clone();
            runner_config.enclave = self.config.enclave.clone();
            runner_config.dry_run = self.config.dry_run;
            let runner = ExperimentRunner::new(self.api.clone(), runner_config);

            // Funnel a session stop into the in-flight experiment.
            let link = {
                let stop = self.stop.clone();
                let cancel = runner.cancel_token();
                tokio::spawn(async move {
                    stop.cancelled().await;
                    cancel.cancel();
                })
            };
            let report = runner.run(&scenario).await?;
            link.abort();

            let result = if self.config.dry_run {
                RoundOutcome::DryRun
            } else if report.interrupted {
                RoundOutcome::Interrupted
            } else if report.passed {
                RoundOutcome::Passed
            } else {
                RoundOutcome::Failed
            };

            let record = self.record(
                &session_id,
                seed,
                round,
                &scenario.metadata.name,
                record_faults(&report, fault_tags),
                trigger,
                result,
                started,
            );
            self.append_jsonl(&record)?;
            records.push(record);

            if result == RoundOutcome::Interrupted {
                break;
            }
        }

        let summary = self.summarize(&session_id, seed, &records);
        self.write_summary(&summary)?;
        info!(
            session = %session_id,
            passed = summary.passed,
            failed = summary.failed,
            "fuzz session finished"
        );
        Ok(summary)
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        session_id: &str,
        seed: u64,
        round: usize,
        name: &str,
        faults: Vec<String>,
        trigger: Option<String>,
        result: RoundOutcome,
        started: Instant,
    ) -> RoundRecord {
        RoundRecord {
            session_id: session_id.to_string(),
            seed,
            round,
            name: name.to_string(),
            faults,
            trigger,
            result,
            elapsed_s: started.elapsed().as_secs_f64(),
            timestamp: Utc::now(),
        }
    }

    fn append_jsonl(&self, record: &RoundRecord) -> Result<(), FuzzError> {
        let io_err = |e: std::io::Error| FuzzError::Io {
            path: self.config.log_path.display().to_string(),
            source: e,
        };
        if let Some(parent) = self.config.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(io_err)?;
            }
        }
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.config.log_path)
            .map_err(io_err)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{}", line).map_err(io_err)?;
        Ok(())
    }

    fn summarize(&self, session_id: &str, seed: u64, records: &[RoundRecord]) -> SessionSummary {
        let count = |o: RoundOutcome| records.iter().filter(|r| r.result == o).count();
        let failed = count(RoundOutcome::Failed);
        let repro_command = if failed > 0 {
            Some(format!(
                "havoc fuzz --enclave {} --rounds {} --seed {} --max-faults {}",
                self.config.enclave, self.config.rounds, seed, self.config.max_faults
            ))
        } else {
            None
        };
        SessionSummary {
            session_id: session_id.to_string(),
            seed,
            rounds_requested: self.config.rounds,
            rounds_run: records.len(),
            passed: count(RoundOutcome::Passed),
            failed,
            dry_runs: count(RoundOutcome::DryRun),
            interrupted: count(RoundOutcome::Interrupted),
            repro_command,
        }
    }

    fn write_summary(&self, summary: &SessionSummary) -> Result<(), FuzzError> {
        let path = self.config.log_path.with_extension("summary.json");
        let json = serde_json::to_vec_pretty(summary)?;
        std::fs::write(&path, json).map_err(|e| FuzzError::Io {
            path: path.display().to_string(),
            source: e,
        })?;
        Ok(())
    }
}

fn record_faults(report: &havoc_runner::ExperimentReport, tags: Vec<String>) -> Vec<String> {
    if report.faults.is_empty() {
        tags
    } else {
        report
            .faults
            .iter()
            .map(|f| format!("{}@{}", f.kind, f.target_alias))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_docker::FakeRuntime;

    fn session(dir: &std::path::Path, rounds: usize, stop: CancellationToken) -> FuzzSession {
        let rt = FakeRuntime::new();
        FuzzSession::new(
            Arc::new(rt),
            RunnerConfig::default(),
            FuzzConfig {
                enclave: "devnet".into(),
                rounds,
                seed: 42,
                compound_bias: 0.5,
                max_faults: 3,
                dry_run: true,
                log_path: dir.join("fuzz.jsonl"),
                ..Default::default()
            },
            stop,
        )
    }

    #[tokio::test]
    async fn dry_run_session_logs_every_round() {
        let dir = tempfile::tempdir().unwrap();
        let s = session(dir.path(), 3, CancellationToken::new());

        let summary = s.run().await.unwrap();
        assert_eq!(summary.rounds_run, 3);
        assert_eq!(summary.dry_runs, 3);
        assert_eq!(summary.failed, 0);
        assert!(summary.repro_command.is_none());

        let log = std::fs::read_to_string(dir.path().join("fuzz.jsonl")).unwrap();
        let lines: Vec<&str> = log.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: RoundRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.round, 1);
        assert_eq!(first.seed, 42);
        assert_eq!(first.result, RoundOutcome::DryRun);

        let summary_file =
            std::fs::read_to_string(dir.path().join("fuzz.summary.json")).unwrap();
        let parsed: SessionSummary = serde_json::from_str(&summary_file).unwrap();
        assert_eq!(parsed.rounds_run, 3);
    }

    #[tokio::test]
    async fn jsonl_log_is_append_only_across_sessions() {
        let dir = tempfile::tempdir().unwrap();
        session(dir.path(), 2, CancellationToken::new()).run().await.unwrap();
        session(dir.path(), 2, CancellationToken::new()).run().await.unwrap();

        let log = std::fs::read_to_string(dir.path().join("fuzz.jsonl")).unwrap();
        assert_eq!(log.lines().count(), 4);
    }

    #[tokio::test]
    async fn equal_seeds_log_identical_round_names() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        session(dir_a.path(), 5, CancellationToken::new()).run().await.unwrap();
        session(dir_b.path(), 5, CancellationToken::new()).run().await.unwrap();

        let names = |dir: &std::path::Path| -> Vec<String> {
            std::fs::read_to_string(dir.join("fuzz.jsonl"))
                .unwrap()
                .lines()
                .map(|l| serde_json::from_str::<RoundRecord>(l).unwrap())
                .map(|r| (r.name, r.faults))
                .map(|(n, f)| format!("{}|{}", n, f.join(",")))
                .collect()
        };
        assert_eq!(names(dir_a.path()), names(dir_b.path()));
    }

    #[tokio::test]
    async fn pre_cancelled_session_runs_no_rounds() {
        let dir = tempfile::tempdir().unwrap();
        let stop = CancellationToken::new();
        stop.cancel();
        let summary = session(dir.path(), 5, stop).run().await.unwrap();
        assert_eq!(summary.rounds_run, 0);
    }
}
