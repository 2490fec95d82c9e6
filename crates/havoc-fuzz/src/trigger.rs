use std::str::FromStr;
use std::time::Duration;

use havoc_metrics::MetricsClient;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Named system condition injection can wait for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerCondition {
    /// No gating; inject immediately.
    Any,
    /// A checkpoint submission is in flight.
    Checkpoint,
    /// Some node (re)started within the last two minutes.
    PostRestart,
    /// The transaction pool is busy.
    HighLoad,
}

impl TriggerCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerCondition::Any => "any",
            TriggerCondition::Checkpoint => "checkpoint",
            TriggerCondition::PostRestart => "post_restart",
            TriggerCondition::HighLoad => "high_load",
        }
    }

    /// Metrics probe for the condition: (query, satisfied-when-true).
    fn probe(&self) -> Option<(&'static str, fn(f64) -> bool)> {
        match self {
            TriggerCondition::Any => None,
            TriggerCondition::Checkpoint => Some((
                "increase(heimdall_checkpoint_submissions_total[5m])",
                |v| v > 0.0,
            )),
            TriggerCondition::PostRestart => Some((
                "min(time() - process_start_time_seconds)",
                |v| v < 120.0,
            )),
            TriggerCondition::HighLoad => Some(("sum(txpool_pending)", |v| v > 100.0)),
        }
    }
}

impl std::fmt::Display for TriggerCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for TriggerCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "any" => Ok(TriggerCondition::Any),
            "checkpoint" => Ok(TriggerCondition::Checkpoint),
            "post_restart" => Ok(TriggerCondition::PostRestart),
            "high_load" => Ok(TriggerCondition::HighLoad),
            other => Err(format!("unknown trigger '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// Condition observed; inject now.
    Satisfied,
    /// Budget exhausted; inject anyway.
    TimedOut,
    /// No metrics service or `any`; inject immediately.
    Skipped,
    /// Session interrupted while waiting.
    Cancelled,
}

const POLL_INTERVAL: Duration = Duration::from_secs(15);
const WAIT_BUDGET: Duration = Duration::from_secs(300);
const CANCEL_POLL: Duration = Duration::from_millis(100);

/// Polls the metrics service for a trigger condition before injection.
pub struct TriggerWaiter {
    metrics: Option<MetricsClient>,
}

impl TriggerWaiter {
    pub fn new(metrics: Option<MetricsClient>) -> Self {
        Self { metrics }
    }

    /// Wait up to 5 minutes, polling every 15 s. A timeout is not an error:
    /// injection proceeds regardless, the outcome is only logged.
    pub async fn wait(
        &self,
        condition: TriggerCondition,
        cancel: &CancellationToken,
    ) -> TriggerOutcome {
        let Some((query, satisfied)) = condition.probe() else {
            return TriggerOutcome::Skipped;
        };
        let Some(client) = &self.metrics else {
            debug!(trigger = %condition, "no metrics service; skipping trigger wait");
            return TriggerOutcome::Skipped;
        };

        info!(trigger = %condition, "waiting for trigger condition");
        let deadline = tokio::time::Instant::now() + WAIT_BUDGET;

        loop {
            match client.query_latest(query).await {
                Ok(samples) => {
                    if samples.iter().any(|s| satisfied(s.value)) {
                        info!(trigger = %condition, "trigger condition satisfied");
                        return TriggerOutcome::Satisfied;
                    }
                }
                Err(e) => debug!(trigger = %condition, error = %e, "trigger probe failed"),
            }

            // Poll-interval sleep, sliced for prompt cancellation.
            let next_poll = tokio::time::Instant::now() + POLL_INTERVAL;
            loop {
                if cancel.is_cancelled() {
                    return TriggerOutcome::Cancelled;
                }
                let now = tokio::time::Instant::now();
                if now >= deadline {
                    warn!(trigger = %condition, "trigger wait timed out; injecting anyway");
                    return TriggerOutcome::TimedOut;
                }
                if now >= next_poll {
                    break;
                }
                tokio::time::sleep(CANCEL_POLL.min(next_poll - now)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn any_trigger_skips_waiting() {
        let waiter = TriggerWaiter::new(None);
        let cancel = CancellationToken::new();
        assert_eq!(
            waiter.wait(TriggerCondition::Any, &cancel).await,
            TriggerOutcome::Skipped
        );
    }

    #[tokio::test]
    async fn missing_metrics_service_skips() {
        let waiter = TriggerWaiter::new(None);
        let cancel = CancellationToken::new();
        assert_eq!(
            waiter.wait(TriggerCondition::Checkpoint, &cancel).await,
            TriggerOutcome::Skipped
        );
    }

    #[test]
    fn trigger_names_round_trip() {
        for t in [
            TriggerCondition::Any,
            TriggerCondition::Checkpoint,
            TriggerCondition::PostRestart,
            TriggerCondition::HighLoad,
        ] {
            assert_eq!(t.as_str().parse::<TriggerCondition>().unwrap(), t);
        }
        assert!("bogus".parse::<TriggerCondition>().is_err());
    }
}
