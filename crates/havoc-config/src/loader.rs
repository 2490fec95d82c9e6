use std::path::Path;
use std::time::Duration;

use havoc_domain::{
    parse_duration, CheckMode, CriterionCheck, Fault, FaultKind, FaultParams, Scenario,
    ScenarioMeta, ScenarioSpec, SelectorKind, SuccessCriterion, Target, TargetSelector,
};
use tracing::{debug, warn};

use crate::error::ConfigError;
use crate::raw::{RawCriterion, RawFault, RawScenario, RawSelector, RawTarget};

const DEFAULT_DURATION: Duration = Duration::from_secs(60);
const DEFAULT_WARMUP: Duration = Duration::from_secs(10);
const DEFAULT_COOLDOWN: Duration = Duration::from_secs(10);

/// CLI-provided scenario overrides, applied after parsing and before
/// validation.
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// Replaces the enclave of every selector that doesn't set one, and of
    /// target zero unconditionally.
    pub enclave: Option<String>,
    pub duration: Option<Duration>,
    pub warmup: Option<Duration>,
    pub cooldown: Option<Duration>,
}

impl Overrides {
    /// Parse a `key=value` CLI override. Recognized keys: duration, warmup,
    /// cooldown, enclave.
    pub fn set(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        match key {
            "duration" => self.duration = Some(parse_duration_for(key, value)?),
            "warmup" => self.warmup = Some(parse_duration_for(key, value)?),
            "cooldown" => self.cooldown = Some(parse_duration_for(key, value)?),
            "enclave" => self.enclave = Some(value.to_string()),
            other => {
                return Err(ConfigError::BadOverride {
                    key: other.to_string(),
                    message: "unknown override key".into(),
                })
            }
        }
        Ok(())
    }
}

fn parse_duration_for(key: &str, value: &str) -> Result<Duration, ConfigError> {
    parse_duration(value).ok_or_else(|| ConfigError::BadOverride {
        key: key.to_string(),
        message: format!("unparseable duration '{}'", value),
    })
}

/// Load, convert, and validate a scenario file.
pub fn load_scenario(path: &Path, overrides: &Overrides) -> Result<Scenario, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        path: path.display().to_string(),
        source: e,
    })?;
    load_scenario_str(&content, &path.display().to_string(), overrides)
}

/// Same as [`load_scenario`] but from an in-memory string (used by the fuzz
/// driver's round-trip tests and the CLI's stdin path).
pub fn load_scenario_str(
    content: &str,
    origin: &str,
    overrides: &Overrides,
) -> Result<Scenario, ConfigError> {
    let raw: RawScenario = serde_yaml::from_str(content).map_err(|e| ConfigError::YamlParse {
        path: origin.to_string(),
        source: e,
    })?;

    debug!(scenario = %raw.metadata.name, "loaded scenario yaml");

    let mut scenario = convert_scenario(raw, origin)?;
    apply_overrides(&mut scenario, overrides);
    havoc_domain::validate(&scenario)?;
    Ok(scenario)
}

/// Apply CLI overrides in place. Public so the fuzz driver can reuse it on
/// generated scenarios.
pub fn apply_overrides(scenario: &mut Scenario, overrides: &Overrides) {
    if let Some(d) = overrides.duration {
        scenario.spec.duration = d;
    }
    if let Some(w) = overrides.warmup {
        scenario.spec.warmup = w;
    }
    if let Some(c) = overrides.cooldown {
        scenario.spec.cooldown = c;
    }
    if let Some(enclave) = &overrides.enclave {
        for (i, target) in scenario.spec.targets.iter_mut().enumerate() {
            if i == 0 || target.selector.enclave.is_none() {
                target.selector.enclave = Some(enclave.clone());
            }
        }
    }
}

fn convert_scenario(raw: RawScenario, path: &str) -> Result<Scenario, ConfigError> {
    let targets = raw
        .spec
        .targets
        .into_iter()
        .map(|t| convert_target(t, path))
        .collect::<Result<Vec<_>, _>>()?;
    let faults = raw
        .spec
        .faults
        .into_iter()
        .map(|f| convert_fault(f, path))
        .collect::<Result<Vec<_>, _>>()?;
    let success_criteria = raw
        .spec
        .success_criteria
        .into_iter()
        .map(|c| convert_criterion(c, path))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Scenario {
        api_version: raw.api_version,
        kind: raw.kind,
        metadata: ScenarioMeta {
            name: raw.metadata.name,
            description: raw.metadata.description,
            tags: raw.metadata.tags,
        },
        spec: ScenarioSpec {
            targets,
            duration: opt_duration(raw.spec.duration.as_deref(), DEFAULT_DURATION, path)?,
            warmup: opt_duration(raw.spec.warmup.as_deref(), DEFAULT_WARMUP, path)?,
            cooldown: opt_duration(raw.spec.cooldown.as_deref(), DEFAULT_COOLDOWN, path)?,
            faults,
            success_criteria,
            collect_metrics: raw.spec.collect_metrics,
        },
    })
}

fn convert_target(raw: RawTarget, path: &str) -> Result<Target, ConfigError> {
    Ok(Target {
        alias: raw.alias,
        selector: convert_selector(raw.selector, path)?,
    })
}

fn convert_selector(raw: RawSelector, path: &str) -> Result<TargetSelector, ConfigError> {
    let kind = match raw.kind.as_str() {
        "enclave_service" => SelectorKind::EnclaveService,
        "container" => SelectorKind::Container,
        other => {
            return Err(ConfigError::Conversion {
                path: path.to_string(),
                message: format!("unknown selector type '{}'", other),
            })
        }
    };

    if let Some(pattern) = &raw.pattern {
        // Invalid patterns aren't fatal; resolution falls back to substring
        // matching. Warn here so authors notice the typo before DISCOVER.
        if regex::Regex::new(pattern).is_err() {
            warn!(pattern = %pattern, "selector pattern is not a valid regex; will match as substring");
        }
    }

    Ok(TargetSelector {
        kind,
        enclave: raw.enclave,
        pattern: raw.pattern,
        labels: raw.labels,
        container_id: raw.container_id,
        service_name: raw.service_name,
    })
}

fn convert_fault(raw: RawFault, path: &str) -> Result<Fault, ConfigError> {
    let kind: FaultKind = raw.kind.parse().map_err(|_| ConfigError::Conversion {
        path: path.to_string(),
        message: format!("unknown fault kind '{}' in phase '{}'", raw.kind, raw.phase),
    })?;

    let params = FaultParams(raw.params);
    let unknown = params.unknown_keys(kind);
    if !unknown.is_empty() {
        warn!(
            phase = %raw.phase,
            kind = %kind,
            keys = ?unknown,
            "fault declares unrecognized parameter keys"
        );
    }

    Ok(Fault {
        phase: raw.phase,
        description: raw.description,
        target_alias: raw.target_alias,
        kind,
        params,
    })
}

fn convert_criterion(raw: RawCriterion, path: &str) -> Result<SuccessCriterion, ConfigError> {
    let missing = |field: &str| ConfigError::Conversion {
        path: path.to_string(),
        message: format!("criterion '{}' ({}) missing '{}'", raw.name, raw.kind, field),
    };

    let check = match raw.kind.as_str() {
        "metric_query" => CriterionCheck::MetricQuery {
            query: raw.query.ok_or_else(|| missing("query"))?,
            threshold: raw.threshold.ok_or_else(|| missing("threshold"))?,
        },
        "rpc" => CriterionCheck::Rpc {
            address: raw.address.ok_or_else(|| missing("address"))?,
            call_data: raw.call_data.ok_or_else(|| missing("call_data"))?,
            check_mode: match raw.check_mode.as_deref() {
                None | Some("non_empty") => CheckMode::NonEmpty,
                Some("exact") => CheckMode::Exact,
                Some("empty") => CheckMode::Empty,
                Some(other) => {
                    return Err(ConfigError::Conversion {
                        path: path.to_string(),
                        message: format!("unknown check_mode '{}'", other),
                    })
                }
            },
            expected: raw.expected,
        },
        "health_check" => CriterionCheck::HealthCheck {
            service: raw.service,
        },
        other => {
            return Err(ConfigError::Conversion {
                path: path.to_string(),
                message: format!("unknown criterion type '{}'", other),
            })
        }
    };

    Ok(SuccessCriterion {
        name: raw.name,
        description: raw.description,
        critical: raw.critical,
        window: raw
            .window
            .as_deref()
            .map(|w| {
                parse_duration(w).ok_or_else(|| ConfigError::Conversion {
                    path: path.to_string(),
                    message: format!("unparseable window '{}'", w),
                })
            })
            .transpose()?,
        check,
    })
}

fn opt_duration(
    value: Option<&str>,
    default: Duration,
    path: &str,
) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(s) => parse_duration(s).ok_or_else(|| ConfigError::Conversion {
            path: path.to_string(),
            message: format!("unparseable duration '{}'", s),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn override_keys_parse() {
        let mut o = Overrides::default();
        o.set("duration", "2m").unwrap();
        o.set("enclave", "devnet-2").unwrap();
        assert_eq!(o.duration, Some(Duration::from_secs(120)));
        assert_eq!(o.enclave.as_deref(), Some("devnet-2"));
        assert!(o.set("bogus", "1").is_err());
    }
}
