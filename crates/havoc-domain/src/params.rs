use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::DomainError;
use crate::types::FaultKind;

/// Kind-specific fault parameters.
///
/// Stored as a map of dynamic values for portability; accessors coerce and
/// clamp. Numeric keys accept both integer and floating-point inputs.
/// Percentages clamp to [0, 100], probabilities to [0, 1], niceness to
/// [-20, 19]. Type violations are errors; out-of-range values are not.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FaultParams(pub HashMap<String, Value>);

impl FaultParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.0.insert(key.into(), value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.insert(key, value);
        self
    }

    fn type_name(v: &Value) -> &'static str {
        match v {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Number(_) => "number",
            Value::String(_) => "string",
            Value::Array(_) => "array",
            Value::Object(_) => "object",
        }
    }

    /// Numeric accessor: accepts integers and floats.
    pub fn get_f64(&self, key: &str) -> Result<Option<f64>, DomainError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => Ok(n.as_f64()),
            Some(other) => Err(DomainError::ParameterNotNumeric {
                key: key.to_string(),
                got: Self::type_name(other).to_string(),
            }),
        }
    }

    /// Numeric accessor truncating to u64. Negative values truncate to 0.
    pub fn get_u64(&self, key: &str) -> Result<Option<u64>, DomainError> {
        Ok(self.get_f64(key)?.map(|f| if f < 0.0 { 0 } else { f as u64 }))
    }

    pub fn get_str(&self, key: &str) -> Result<Option<&str>, DomainError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.as_str())),
            Some(other) => Err(DomainError::ParameterNotString {
                key: key.to_string(),
                got: Self::type_name(other).to_string(),
            }),
        }
    }

    pub fn get_bool(&self, key: &str) -> Result<Option<bool>, DomainError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Value::Bool(b)) => Ok(Some(*b)),
            Some(other) => Err(DomainError::ParameterNotBool {
                key: key.to_string(),
                got: Self::type_name(other).to_string(),
            }),
        }
    }

    /// Percentage, clamped to [0, 100].
    pub fn percent(&self, key: &str) -> Result<Option<f64>, DomainError> {
        Ok(self.get_f64(key)?.map(|v| v.clamp(0.0, 100.0)))
    }

    /// Probability, clamped to [0, 1].
    pub fn probability(&self, key: &str) -> Result<Option<f64>, DomainError> {
        Ok(self.get_f64(key)?.map(|v| v.clamp(0.0, 1.0)))
    }

    /// Scheduler niceness, clamped to [-20, 19].
    pub fn niceness(&self, key: &str) -> Result<Option<i64>, DomainError> {
        Ok(self.get_f64(key)?.map(|v| (v as i64).clamp(-20, 19)))
    }

    /// Duration accessor: accepts a number (seconds) or a duration string
    /// ("30s", "5m", "250ms").
    pub fn get_duration(&self, key: &str) -> Result<Option<std::time::Duration>, DomainError> {
        match self.0.get(key) {
            None => Ok(None),
            Some(Value::Number(n)) => Ok(n
                .as_f64()
                .map(|secs| std::time::Duration::from_millis((secs.max(0.0) * 1000.0) as u64))),
            Some(Value::String(s)) => {
                crate::duration::parse_duration(s).map(Some).ok_or_else(|| {
                    DomainError::InvalidConfig(format!("unparseable duration '{}' for '{}'", s, key))
                })
            }
            Some(other) => Err(DomainError::ParameterNotNumeric {
                key: key.to_string(),
                got: Self::type_name(other).to_string(),
            }),
        }
    }

    /// Comma-separated list accessor; also accepts a JSON array of strings.
    pub fn get_csv(&self, key: &str) -> Result<Vec<String>, DomainError> {
        match self.0.get(key) {
            None => Ok(vec![]),
            Some(Value::String(s)) => Ok(s
                .split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|v| {
                    v.as_str().map(String::from).ok_or_else(|| {
                        DomainError::ParameterNotString {
                            key: key.to_string(),
                            got: Self::type_name(v).to_string(),
                        }
                    })
                })
                .collect(),
            Some(other) => Err(DomainError::ParameterNotString {
                key: key.to_string(),
                got: Self::type_name(other).to_string(),
            }),
        }
    }

    /// Keys present in the map but not recognized for `kind`.
    /// Callers log these; unknown keys are never silently ignored.
    pub fn unknown_keys(&self, kind: FaultKind) -> Vec<String> {
        let recognized = kind.recognized_keys();
        let mut unknown: Vec<String> = self
            .0
            .keys()
            .filter(|k| !recognized.contains(&k.as_str()))
            .cloned()
            .collect();
        unknown.sort();
        unknown
    }
}

impl FaultKind {
    /// The parameter keys each kind understands.
    pub fn recognized_keys(&self) -> &'static [&'static str] {
        match self {
            FaultKind::Network => &[
                "device",
                "latency",
                "jitter",
                "packet_loss",
                "bandwidth",
                "target_ports",
                "target_proto",
                "target_ips",
                "target_cidr",
                "reorder",
                "reorder_correlation",
            ],
            FaultKind::ContainerRestart => &["grace_period", "restart_delay", "stagger"],
            FaultKind::ContainerKill => &["signal", "restart", "restart_delay"],
            FaultKind::ContainerPause => &["duration", "unpause"],
            FaultKind::CpuStress => &["method", "cpu_percent", "cores", "duration"],
            FaultKind::MemoryStress => &["memory_mb"],
            FaultKind::ConnectionDrop => &[
                "rule_type",
                "target_ports",
                "target_proto",
                "probability",
                "stateful",
            ],
            FaultKind::Dns => &["delay_ms", "failure_rate"],
            FaultKind::ProcessPriority => &["process_pattern", "priority"],
            FaultKind::DiskIo => &["io_latency_ms", "target_path", "operation"],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn params(v: Value) -> FaultParams {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn numeric_accepts_int_and_float() {
        let p = params(json!({"latency": 500, "jitter": 20.5}));
        assert_eq!(p.get_f64("latency").unwrap(), Some(500.0));
        assert_eq!(p.get_f64("jitter").unwrap(), Some(20.5));
        assert_eq!(p.get_u64("latency").unwrap(), Some(500));
    }

    #[test]
    fn numeric_rejects_strings() {
        let p = params(json!({"latency": "fast"}));
        let err = p.get_f64("latency").unwrap_err();
        assert!(matches!(err, DomainError::ParameterNotNumeric { .. }));
    }

    #[test]
    fn percent_clamps_into_range() {
        let p = params(json!({"packet_loss": 150, "reorder": -3}));
        assert_eq!(p.percent("packet_loss").unwrap(), Some(100.0));
        assert_eq!(p.percent("reorder").unwrap(), Some(0.0));
    }

    #[test]
    fn probability_clamps_into_range() {
        let p = params(json!({"probability": 1.7}));
        assert_eq!(p.probability("probability").unwrap(), Some(1.0));
    }

    #[test]
    fn niceness_clamps_into_range() {
        let p = params(json!({"priority": -100}));
        assert_eq!(p.niceness("priority").unwrap(), Some(-20));
        let p = params(json!({"priority": 19.9}));
        assert_eq!(p.niceness("priority").unwrap(), Some(19));
    }

    #[test]
    fn csv_splits_and_trims() {
        let p = params(json!({"target_ports": "8545, 8546,30303"}));
        assert_eq!(
            p.get_csv("target_ports").unwrap(),
            vec!["8545", "8546", "30303"]
        );
    }

    #[test]
    fn csv_accepts_arrays() {
        let p = params(json!({"target_ips": ["10.0.0.1", "10.0.0.2"]}));
        assert_eq!(p.get_csv("target_ips").unwrap().len(), 2);
    }

    #[test]
    fn unknown_keys_are_reported_not_dropped() {
        let p = params(json!({"latency": 100, "lateency": 200}));
        assert_eq!(p.unknown_keys(FaultKind::Network), vec!["lateency"]);
    }

    #[test]
    fn missing_keys_are_none_not_errors() {
        let p = FaultParams::new();
        assert_eq!(p.get_f64("latency").unwrap(), None);
        assert_eq!(p.get_str("device").unwrap(), None);
        assert!(p.get_csv("target_ports").unwrap().is_empty());
    }
}
