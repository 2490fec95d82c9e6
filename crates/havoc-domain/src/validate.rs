use std::collections::HashSet;
use std::net::IpAddr;

use crate::error::DomainError;
use crate::types::{CheckMode, CriterionCheck, FaultKind, Scenario, Threshold};

/// Validate a scenario's cross-references and typed fields.
///
/// Runs at PARSE time, before any side effect. Checks:
/// - at least one target, aliases unique
/// - every fault references a declared alias
/// - selector regexes compile (invalid patterns fall back to substring
///   matching at resolve time, so they only warn — the loader logs them)
/// - metric thresholds parse
/// - rpc criteria carry well-formed addresses/call data, and `exact` carries
///   an expected value
/// - network CIDR/IP parameters parse
pub fn validate(scenario: &Scenario) -> Result<(), DomainError> {
    if scenario.spec.targets.is_empty() {
        return Err(DomainError::NoTargets);
    }

    let mut aliases = HashSet::new();
    for target in &scenario.spec.targets {
        if !aliases.insert(target.alias.as_str()) {
            return Err(DomainError::DuplicateAlias(target.alias.clone()));
        }
    }

    for fault in &scenario.spec.faults {
        if !aliases.contains(fault.target_alias.as_str()) {
            return Err(DomainError::UnknownTargetAlias {
                phase: fault.phase.clone(),
                alias: fault.target_alias.clone(),
            });
        }
        validate_fault_params(fault.kind, fault)?;
    }

    for criterion in &scenario.spec.success_criteria {
        match &criterion.check {
            CriterionCheck::MetricQuery { threshold, .. } => {
                threshold.parse::<Threshold>()?;
            }
            CriterionCheck::Rpc {
                address,
                call_data,
                check_mode,
                expected,
            } => {
                validate_hex(address, 40, &criterion.name, "address")?;
                if !call_data.starts_with("0x") {
                    return Err(DomainError::BadRpcCriterion {
                        name: criterion.name.clone(),
                        message: "call_data must be 0x-prefixed".into(),
                    });
                }
                if *check_mode == CheckMode::Exact && expected.is_none() {
                    return Err(DomainError::BadRpcCriterion {
                        name: criterion.name.clone(),
                        message: "check_mode 'exact' requires 'expected'".into(),
                    });
                }
            }
            CriterionCheck::HealthCheck { .. } => {}
        }
    }

    Ok(())
}

fn validate_fault_params(kind: FaultKind, fault: &crate::types::Fault) -> Result<(), DomainError> {
    let p = &fault.params;
    match kind {
        FaultKind::Network => {
            // Exercise the typed accessors so type violations surface at
            // PARSE, not mid-INJECT.
            p.get_f64("latency")?;
            p.get_f64("jitter")?;
            p.percent("packet_loss")?;
            p.get_f64("bandwidth")?;
            p.percent("reorder")?;
            p.percent("reorder_correlation")?;
            for ip in p.get_csv("target_ips")? {
                ip.parse::<IpAddr>()
                    .map_err(|_| DomainError::InvalidIp(ip.clone()))?;
            }
            if let Some(cidr) = p.get_str("target_cidr")? {
                validate_cidr(cidr)?;
            }
        }
        FaultKind::ContainerRestart => {
            p.get_f64("grace_period")?;
            p.get_f64("restart_delay")?;
            p.get_f64("stagger")?;
        }
        FaultKind::ContainerKill => {
            p.get_str("signal")?;
            p.get_bool("restart")?;
            p.get_f64("restart_delay")?;
        }
        FaultKind::ContainerPause => {
            p.get_duration("duration")?;
            p.get_bool("unpause")?;
        }
        FaultKind::CpuStress => {
            p.get_str("method")?;
            p.percent("cpu_percent")?;
            p.get_f64("cores")?;
        }
        FaultKind::MemoryStress => {
            p.get_f64("memory_mb")?;
        }
        FaultKind::ConnectionDrop => {
            p.get_str("rule_type")?;
            p.probability("probability")?;
            p.get_bool("stateful")?;
        }
        FaultKind::Dns => {
            p.get_f64("delay_ms")?;
            p.probability("failure_rate")?;
        }
        FaultKind::ProcessPriority => {
            p.get_str("process_pattern")?;
            p.niceness("priority")?;
        }
        FaultKind::DiskIo => {
            p.get_f64("io_latency_ms")?;
            p.get_str("target_path")?;
            p.get_str("operation")?;
        }
    }
    Ok(())
}

fn validate_hex(value: &str, digits: usize, name: &str, field: &str) -> Result<(), DomainError> {
    let body = value.strip_prefix("0x").ok_or_else(|| DomainError::BadRpcCriterion {
        name: name.to_string(),
        message: format!("{} must be 0x-prefixed", field),
    })?;
    if body.len() != digits || !body.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(DomainError::BadRpcCriterion {
            name: name.to_string(),
            message: format!("{} must be 0x + {} hex digits", field, digits),
        });
    }
    Ok(())
}

fn validate_cidr(cidr: &str) -> Result<(), DomainError> {
    let Some((addr, prefix)) = cidr.split_once('/') else {
        return Err(DomainError::InvalidCidr(cidr.to_string()));
    };
    let ip: IpAddr = addr
        .parse()
        .map_err(|_| DomainError::InvalidCidr(cidr.to_string()))?;
    let max = if ip.is_ipv4() { 32 } else { 128 };
    match prefix.parse::<u8>() {
        Ok(p) if p <= max => Ok(()),
        _ => Err(DomainError::InvalidCidr(cidr.to_string())),
    }
}
