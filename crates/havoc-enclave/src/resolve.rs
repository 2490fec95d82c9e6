use havoc_docker::{ContainerApi, ContainerFilter, ContainerInfo, DockerError};
use havoc_domain::{ResolvedTarget, SelectorKind, Target};
use regex::Regex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::DiscoveryError;

/// Resolve every scenario target to concrete containers.
///
/// Matching prefers the selector's regex pattern; a pattern that doesn't
/// compile degrades to substring matching. Container names have their
/// leading '/' stripped before matching. A selector that matches nothing is
/// an error, as is any match on the metrics service or dashboard.
pub async fn resolve_targets(
    api: &dyn ContainerApi,
    default_enclave: &str,
    targets: &[Target],
    cancel: &CancellationToken,
) -> Result<Vec<ResolvedTarget>, DiscoveryError> {
    let all = api
        .list_containers(
            &ContainerFilter {
                all: false,
                ..Default::default()
            },
            cancel,
        )
        .await?;

    let mut resolved = Vec::new();
    for target in targets {
        let matches = resolve_one(api, &all, default_enclave, target, cancel).await?;
        if matches.is_empty() {
            return Err(DiscoveryError::NoMatches {
                alias: target.alias.clone(),
            });
        }
        resolved.extend(matches);
    }

    // Non-bypassable: experiments must never degrade their own observability.
    for rt in &resolved {
        if is_observability_container(&rt.name) {
            return Err(DiscoveryError::ObservabilitySafety {
                alias: rt.alias.clone(),
                name: rt.name.clone(),
            });
        }
    }

    debug!(count = resolved.len(), "targets resolved");
    Ok(resolved)
}

async fn resolve_one(
    api: &dyn ContainerApi,
    all: &[ContainerInfo],
    default_enclave: &str,
    target: &Target,
    cancel: &CancellationToken,
) -> Result<Vec<ResolvedTarget>, DiscoveryError> {
    let selector = &target.selector;

    // Direct container-id selectors skip the listing entirely.
    if selector.kind == SelectorKind::Container {
        if let Some(id) = &selector.container_id {
            return match api.inspect(id, cancel).await {
                Ok(info) => Ok(vec![to_resolved(&target.alias, &info)]),
                Err(DockerError::NotFound(_)) => Ok(vec![]),
                Err(e) => Err(e.into()),
            };
        }
    }

    let enclave = selector.enclave.as_deref().unwrap_or(default_enclave);
    let matcher = Matcher::new(selector.pattern.as_deref(), selector.service_name.as_deref());

    let matches: Vec<ResolvedTarget> = all
        .iter()
        .filter(|c| {
            // Kurtosis embeds the enclave in its network, not the name;
            // labels carry it when present.
            c.labels
                .get("com.kurtosistech.enclave-name")
                .map_or(true, |e| e == enclave)
        })
        .filter(|c| {
            selector
                .labels
                .iter()
                .all(|(k, v)| c.labels.get(k) == Some(v))
        })
        .filter(|c| matcher.matches(&c.name))
        .map(|c| to_resolved(&target.alias, c))
        .collect();

    Ok(matches)
}

fn to_resolved(alias: &str, info: &ContainerInfo) -> ResolvedTarget {
    ResolvedTarget {
        alias: alias.to_string(),
        container_id: info.id.clone(),
        name: info.name.strip_prefix('/').unwrap_or(&info.name).to_string(),
        ip: info.ip.clone(),
    }
}

/// Reject resolution onto the metrics service or the dashboard.
pub fn is_observability_container(name: &str) -> bool {
    let lower = name.trim_start_matches('/').to_ascii_lowercase();
    lower.starts_with("metrics") || lower.starts_with("dashboard")
}

enum Matcher {
    Regex(Regex),
    Substring(String),
    Any,
}

impl Matcher {
    fn new(pattern: Option<&str>, service_name: Option<&str>) -> Self {
        if let Some(p) = pattern {
            match Regex::new(p) {
                Ok(re) => return Matcher::Regex(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "pattern is not valid regex; matching as substring");
                    return Matcher::Substring(p.to_string());
                }
            }
        }
        if let Some(s) = service_name {
            return Matcher::Substring(s.to_string());
        }
        Matcher::Any
    }

    fn matches(&self, name: &str) -> bool {
        let name = name.trim_start_matches('/');
        match self {
            Matcher::Regex(re) => re.is_match(name),
            Matcher::Substring(s) => name.contains(s.as_str()),
            Matcher::Any => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_docker::FakeRuntime;
    use havoc_domain::TargetSelector;
    use std::collections::HashMap;

    fn target(alias: &str, pattern: &str) -> Target {
        Target {
            alias: alias.into(),
            selector: TargetSelector {
                kind: SelectorKind::EnclaveService,
                enclave: None,
                pattern: Some(pattern.into()),
                labels: HashMap::new(),
                container_id: None,
                service_name: None,
            },
        }
    }

    async fn devnet() -> FakeRuntime {
        let rt = FakeRuntime::new();
        rt.add_container("validator1-heimdall--a1b2", "heimdall:v1", Some("10.0.0.2"))
            .await;
        rt.add_container("validator2-heimdall--c3d4", "heimdall:v1", Some("10.0.0.3"))
            .await;
        rt.add_container("validator1-bor--e5f6", "bor:v1", Some("10.0.0.4"))
            .await;
        rt.add_container("metrics-001--aaaa", "prom:v2", Some("10.0.0.9"))
            .await;
        rt.add_container("dashboard-001--bbbb", "grafana:v9", Some("10.0.0.10"))
            .await;
        rt
    }

    #[tokio::test]
    async fn regex_pattern_selects_matching_containers() {
        let rt = devnet().await;
        let cancel = CancellationToken::new();
        let resolved = resolve_targets(
            &rt,
            "devnet",
            &[target("heimdalls", r"^validator\d+-heimdall")],
            &cancel,
        )
        .await
        .unwrap();
        assert_eq!(resolved.len(), 2);
        assert!(resolved.iter().all(|r| r.alias == "heimdalls"));
        assert!(resolved.iter().all(|r| r.ip.is_some()));
    }

    #[tokio::test]
    async fn invalid_regex_degrades_to_substring() {
        let rt = devnet().await;
        let cancel = CancellationToken::new();
        let resolved = resolve_targets(&rt, "devnet", &[target("bor", "validator1-bor(")], &cancel)
            .await;
        // "(": invalid regex, but no container name contains it literally
        assert!(matches!(resolved, Err(DiscoveryError::NoMatches { .. })));

        let resolved =
            resolve_targets(&rt, "devnet", &[target("bor", "validator1-bor")], &cancel)
                .await
                .unwrap();
        assert_eq!(resolved.len(), 1);
    }

    #[tokio::test]
    async fn zero_matches_is_an_error() {
        let rt = devnet().await;
        let cancel = CancellationToken::new();
        let err = resolve_targets(&rt, "devnet", &[target("ghost", "^nothing")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::NoMatches { .. }));
    }

    #[tokio::test]
    async fn metrics_resolution_is_fatal() {
        let rt = devnet().await;
        let cancel = CancellationToken::new();
        let err = resolve_targets(&rt, "devnet", &[target("oops", "^metrics")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::ObservabilitySafety { .. }));
    }

    #[tokio::test]
    async fn dashboard_resolution_is_fatal_case_insensitive() {
        let rt = FakeRuntime::new();
        rt.add_container("Dashboard-main", "grafana:v9", None).await;
        let cancel = CancellationToken::new();
        let err = resolve_targets(&rt, "devnet", &[target("oops", "Dashboard")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::ObservabilitySafety { .. }));
    }

    #[tokio::test]
    async fn broad_pattern_still_trips_guard() {
        // Even a pattern that happens to sweep in the metrics container is
        // rejected — the guard runs after resolution, not on intent.
        let rt = devnet().await;
        let cancel = CancellationToken::new();
        let err = resolve_targets(&rt, "devnet", &[target("everything", ".*")], &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, DiscoveryError::ObservabilitySafety { .. }));
    }
}
