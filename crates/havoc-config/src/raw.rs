use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Raw YAML representation of a scenario file.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawScenario {
    pub api_version: String,
    pub kind: String,
    pub metadata: RawMeta,
    pub spec: RawSpec,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawMeta {
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawSpec {
    #[serde(default)]
    pub targets: Vec<RawTarget>,
    /// Duration strings: "90s", "5m", "1h", "250ms", or a bare second count.
    pub duration: Option<String>,
    pub warmup: Option<String>,
    pub cooldown: Option<String>,
    #[serde(default)]
    pub faults: Vec<RawFault>,
    #[serde(default)]
    pub success_criteria: Vec<RawCriterion>,
    #[serde(default)]
    pub collect_metrics: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawTarget {
    pub alias: String,
    pub selector: RawSelector,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawSelector {
    /// "enclave_service" or "container".
    #[serde(rename = "type")]
    pub kind: String,
    pub enclave: Option<String>,
    pub pattern: Option<String>,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub container_id: Option<String>,
    pub service_name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct RawFault {
    pub phase: String,
    pub description: Option<String>,
    pub target_alias: String,
    pub kind: String,
    #[serde(default)]
    pub params: HashMap<String, serde_json::Value>,
}

/// Flat criterion representation; `type` selects which fields apply.
#[derive(Debug, Deserialize, Serialize)]
pub struct RawCriterion {
    pub name: String,
    pub description: Option<String>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub critical: bool,
    pub window: Option<String>,

    // metric_query
    pub query: Option<String>,
    pub threshold: Option<String>,

    // rpc
    pub address: Option<String>,
    pub call_data: Option<String>,
    pub check_mode: Option<String>,
    pub expected: Option<String>,

    // health_check
    pub service: Option<String>,
}
