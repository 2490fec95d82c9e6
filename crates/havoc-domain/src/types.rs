use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::DomainError;
use crate::params::FaultParams;

// ── Scenario ──────────────────────────────────────────────────────────────────

/// A complete chaos experiment description. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scenario {
    pub api_version: String,
    pub kind: String,
    pub metadata: ScenarioMeta,
    pub spec: ScenarioSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioMeta {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioSpec {
    /// Ordered target groups; aliases are unique per scenario.
    pub targets: Vec<Target>,
    /// How long faults stay active (the MONITOR window).
    pub duration: Duration,
    /// Settle time before injection.
    pub warmup: Duration,
    /// Settle time after the monitor window, before teardown.
    pub cooldown: Duration,
    pub faults: Vec<Fault>,
    #[serde(default)]
    pub success_criteria: Vec<SuccessCriterion>,
    /// Metric names sampled into the report during MONITOR.
    #[serde(default)]
    pub collect_metrics: Vec<String>,
}

// ── Targets ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Target {
    /// User-chosen name faults refer to. Unique per scenario.
    pub alias: String,
    pub selector: TargetSelector,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectorKind {
    /// Match containers belonging to an enclave service.
    EnclaveService,
    /// Match a raw container by id or name.
    Container,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSelector {
    #[serde(rename = "type")]
    pub kind: SelectorKind,
    /// Enclave to search in. None = the run's default enclave.
    pub enclave: Option<String>,
    /// Regex matched against container names (leading '/' stripped).
    /// A pattern that fails to compile falls back to substring matching.
    pub pattern: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub container_id: Option<String>,
    pub service_name: Option<String>,
}

/// A target after DISCOVER: one concrete container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub alias: String,
    pub container_id: String,
    pub name: String,
    pub ip: Option<String>,
}

// ── Faults ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    Network,
    ContainerRestart,
    ContainerKill,
    ContainerPause,
    CpuStress,
    MemoryStress,
    ConnectionDrop,
    Dns,
    ProcessPriority,
    DiskIo,
}

impl FaultKind {
    pub const ALL: [FaultKind; 10] = [
        FaultKind::Network,
        FaultKind::ContainerRestart,
        FaultKind::ContainerKill,
        FaultKind::ContainerPause,
        FaultKind::CpuStress,
        FaultKind::MemoryStress,
        FaultKind::ConnectionDrop,
        FaultKind::Dns,
        FaultKind::ProcessPriority,
        FaultKind::DiskIo,
    ];

    /// Kinds whose mechanism runs inside a privileged sidecar sharing the
    /// target's network namespace.
    pub fn needs_sidecar(&self) -> bool {
        matches!(
            self,
            FaultKind::Network | FaultKind::ConnectionDrop | FaultKind::Dns
        )
    }

    /// Kinds whose removal is a no-op (the fault self-resolves).
    pub fn has_inverse(&self) -> bool {
        !matches!(self, FaultKind::ContainerRestart | FaultKind::ContainerKill)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultKind::Network => "network",
            FaultKind::ContainerRestart => "container_restart",
            FaultKind::ContainerKill => "container_kill",
            FaultKind::ContainerPause => "container_pause",
            FaultKind::CpuStress => "cpu_stress",
            FaultKind::MemoryStress => "memory_stress",
            FaultKind::ConnectionDrop => "connection_drop",
            FaultKind::Dns => "dns",
            FaultKind::ProcessPriority => "process_priority",
            FaultKind::DiskIo => "disk_io",
        }
    }
}

impl std::fmt::Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for FaultKind {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FaultKind::ALL
            .iter()
            .find(|k| k.as_str() == s)
            .copied()
            .ok_or_else(|| DomainError::InvalidConfig(format!("unknown fault kind '{}'", s)))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fault {
    /// Human label for logs and the report.
    pub phase: String,
    pub description: Option<String>,
    /// Alias of the target group this fault applies to.
    pub target_alias: String,
    pub kind: FaultKind,
    #[serde(default)]
    pub params: FaultParams,
}

// ── Success criteria ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckMode {
    /// Returned hex must equal `expected`.
    Exact,
    /// Returned hex must not be "" or "0x".
    NonEmpty,
    /// Returned hex must be "" or "0x".
    Empty,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CriterionCheck {
    MetricQuery {
        query: String,
        /// `OP VALUE` expression, e.g. "> 0" or "<= 1.5".
        threshold: String,
    },
    Rpc {
        /// Contract address, 0x-prefixed.
        address: String,
        /// ABI-encoded call data, 0x-prefixed.
        call_data: String,
        check_mode: CheckMode,
        expected: Option<String>,
    },
    HealthCheck {
        /// Job label probed via the metrics service's `up` series.
        service: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessCriterion {
    pub name: String,
    pub description: Option<String>,
    /// Critical failures fail the whole experiment; non-critical ones only log.
    #[serde(default)]
    pub critical: bool,
    /// Evaluation lookback window.
    pub window: Option<Duration>,
    #[serde(flatten)]
    pub check: CriterionCheck,
}

// ── Threshold expressions ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl ThresholdOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            ThresholdOp::Gt => ">",
            ThresholdOp::Lt => "<",
            ThresholdOp::Ge => ">=",
            ThresholdOp::Le => "<=",
            ThresholdOp::Eq => "==",
            ThresholdOp::Ne => "!=",
        }
    }
}

/// A parsed `OP VALUE` comparison, e.g. `> 0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Threshold {
    pub op: ThresholdOp,
    pub value: f64,
}

impl Threshold {
    pub fn matches(&self, observed: f64) -> bool {
        match self.op {
            ThresholdOp::Gt => observed > self.value,
            ThresholdOp::Lt => observed < self.value,
            ThresholdOp::Ge => observed >= self.value,
            ThresholdOp::Le => observed <= self.value,
            ThresholdOp::Eq => observed == self.value,
            ThresholdOp::Ne => observed != self.value,
        }
    }
}

impl FromStr for Threshold {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        // Two-char operators first so ">=" doesn't parse as ">" + "=0".
        let (op, rest) = if let Some(r) = trimmed.strip_prefix(">=") {
            (ThresholdOp::Ge, r)
        } else if let Some(r) = trimmed.strip_prefix("<=") {
            (ThresholdOp::Le, r)
        } else if let Some(r) = trimmed.strip_prefix("==") {
            (ThresholdOp::Eq, r)
        } else if let Some(r) = trimmed.strip_prefix("!=") {
            (ThresholdOp::Ne, r)
        } else if let Some(r) = trimmed.strip_prefix('>') {
            (ThresholdOp::Gt, r)
        } else if let Some(r) = trimmed.strip_prefix('<') {
            (ThresholdOp::Lt, r)
        } else {
            return Err(DomainError::BadThreshold(s.to_string()));
        };

        let value: f64 = rest
            .trim()
            .parse()
            .map_err(|_| DomainError::BadThreshold(s.to_string()))?;

        Ok(Threshold { op, value })
    }
}

impl std::fmt::Display for Threshold {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.op.as_str(), self.value)
    }
}

// ── Audit log ─────────────────────────────────────────────────────────────────

/// One entry in the experiment's append-only cleanup audit log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: String,
    pub target_id: String,
    pub success: bool,
    pub details: String,
    pub error: Option<String>,
}

impl AuditEntry {
    pub fn ok(action: impl Into<String>, target_id: impl Into<String>, details: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            target_id: target_id.into(),
            success: true,
            details: details.into(),
            error: None,
        }
    }

    pub fn failed(
        action: impl Into<String>,
        target_id: impl Into<String>,
        error: impl Into<String>,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            action: action.into(),
            target_id: target_id.into(),
            success: false,
            details: String::new(),
            error: Some(error.into()),
        }
    }
}
