use havoc_domain::{Fault, ResolvedTarget};
use havoc_sidecar::SidecarManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::InjectError;
use crate::shaping::run_in_sidecar;

/// The dedicated packet-filter chain all drop rules live in. Flushing and
/// deleting this one chain removes the fault without touching rules the
/// testbed itself installed.
pub const CHAIN: &str = "CHAOS_DROP";

/// Probabilistic connection dropping via an iptables chain.
pub async fn apply(
    sidecars: &SidecarManager,
    fault: &Fault,
    target: &ResolvedTarget,
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    let p = &fault.params;
    let rule_type = p.get_str("rule_type")?.unwrap_or("drop").to_string();
    let probability = p.probability("probability")?.unwrap_or(1.0);
    let stateful = p.get_bool("stateful")?.unwrap_or(false);
    let ports = p.get_csv("target_ports")?;
    let protos = {
        let listed = p.get_csv("target_proto")?;
        if listed.is_empty() {
            vec!["tcp".to_string()]
        } else {
            listed
        }
    };

    let id = &target.container_id;

    // Chain create is idempotent: -N fails if it exists, then -F guarantees
    // a known-empty state either way.
    let _ = sidecars.exec_in_sidecar(id, &["iptables", "-N", CHAIN], cancel).await;
    run_in_sidecar(sidecars, id, &["iptables", "-F", CHAIN], cancel).await?;

    let prob = format!("{}", probability);
    let port_list: Vec<Option<String>> = if ports.is_empty() {
        vec![None]
    } else {
        ports.into_iter().map(Some).collect()
    };

    for proto in &protos {
        for port in &port_list {
            let mut rule: Vec<String> = vec![
                "iptables".into(),
                "-A".into(),
                CHAIN.into(),
                "-p".into(),
                proto.clone(),
            ];
            if let Some(port) = port {
                rule.push("--dport".into());
                rule.push(port.clone());
            }
            if stateful {
                rule.extend(["-m".into(), "conntrack".into(), "--ctstate".into(), "NEW".into()]);
            }
            rule.extend([
                "-m".into(),
                "statistic".into(),
                "--mode".into(),
                "random".into(),
                "--probability".into(),
                prob.clone(),
            ]);
            match rule_type.as_str() {
                "reject" => rule.extend([
                    "-j".into(),
                    "REJECT".into(),
                    "--reject-with".into(),
                    "tcp-reset".into(),
                ]),
                _ => rule.extend(["-j".into(), "DROP".into()]),
            }

            let argv: Vec<&str> = rule.iter().map(String::as_str).collect();
            run_in_sidecar(sidecars, id, &argv, cancel).await?;
        }
    }

    // Wire the chain into INPUT once; a duplicate jump from a retried
    // injection is removed by the -D below first.
    let _ = sidecars
        .exec_in_sidecar(id, &["iptables", "-D", "INPUT", "-j", CHAIN], cancel)
        .await;
    run_in_sidecar(sidecars, id, &["iptables", "-A", "INPUT", "-j", CHAIN], cancel).await?;

    info!(target = %target.name, rule_type = %rule_type, probability, "connection drop applied");
    Ok(())
}

/// Flush, detach, and delete the chaos chain. Each step tolerates "already
/// gone" so removal stays idempotent.
pub async fn remove(
    sidecars: &SidecarManager,
    target_id: &str,
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    let _ = sidecars
        .exec_in_sidecar(target_id, &["iptables", "-F", CHAIN], cancel)
        .await;
    let _ = sidecars
        .exec_in_sidecar(target_id, &["iptables", "-D", "INPUT", "-j", CHAIN], cancel)
        .await;
    let _ = sidecars
        .exec_in_sidecar(target_id, &["iptables", "-X", CHAIN], cancel)
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_docker::FakeRuntime;
    use havoc_domain::{FaultKind, FaultParams};
    use std::sync::Arc;

    fn fault(params: FaultParams) -> Fault {
        Fault {
            phase: "drop".into(),
            description: None,
            target_alias: "t".into(),
            kind: FaultKind::ConnectionDrop,
            params,
        }
    }

    fn resolved(id: &str) -> ResolvedTarget {
        ResolvedTarget {
            alias: "t".into(),
            container_id: id.into(),
            name: "validator1".into(),
            ip: None,
        }
    }

    async fn setup() -> (FakeRuntime, Arc<SidecarManager>, String, String) {
        let rt = FakeRuntime::new();
        let target = rt.add_container("validator1", "node:v1", None).await;
        let sidecars = Arc::new(SidecarManager::new(
            Arc::new(rt.clone()),
            "havoc/netshaper:latest",
        ));
        let cancel = CancellationToken::new();
        let sidecar = sidecars.create_sidecar(&target, &cancel).await.unwrap();
        (rt, sidecars, target, sidecar)
    }

    #[tokio::test]
    async fn drop_rule_uses_statistic_match() {
        let (rt, sidecars, target, sidecar) = setup().await;
        let cancel = CancellationToken::new();

        let f = fault(
            FaultParams::new()
                .with("probability", 0.5)
                .with("target_ports", "8545"),
        );
        apply(&sidecars, &f, &resolved(&target), &cancel).await.unwrap();

        let transcript = rt.transcript_for(&sidecar).await;
        let rule = transcript
            .iter()
            .find(|c| c.contains("-A CHAOS_DROP"))
            .unwrap();
        assert!(rule.contains("-p tcp"));
        assert!(rule.contains("--dport 8545"));
        assert!(rule.contains("--mode random --probability 0.5"));
        assert!(rule.ends_with("-j DROP"));
        assert!(transcript.iter().any(|c| c == "iptables -A INPUT -j CHAOS_DROP"));
    }

    #[tokio::test]
    async fn reject_rule_sends_tcp_reset() {
        let (rt, sidecars, target, sidecar) = setup().await;
        let cancel = CancellationToken::new();

        let f = fault(FaultParams::new().with("rule_type", "reject"));
        apply(&sidecars, &f, &resolved(&target), &cancel).await.unwrap();

        let transcript = rt.transcript_for(&sidecar).await;
        let rule = transcript
            .iter()
            .find(|c| c.contains("-A CHAOS_DROP"))
            .unwrap();
        assert!(rule.contains("-j REJECT --reject-with tcp-reset"));
    }

    #[tokio::test]
    async fn probability_is_clamped() {
        let (rt, sidecars, target, sidecar) = setup().await;
        let cancel = CancellationToken::new();

        let f = fault(FaultParams::new().with("probability", 3.5));
        apply(&sidecars, &f, &resolved(&target), &cancel).await.unwrap();

        let transcript = rt.transcript_for(&sidecar).await;
        let rule = transcript
            .iter()
            .find(|c| c.contains("-A CHAOS_DROP"))
            .unwrap();
        assert!(rule.contains("--probability 1"));
    }

    #[tokio::test]
    async fn remove_flushes_detaches_deletes() {
        let (rt, sidecars, target, sidecar) = setup().await;
        let cancel = CancellationToken::new();

        remove(&sidecars, &target, &cancel).await.unwrap();
        let transcript = rt.transcript_for(&sidecar).await;
        assert_eq!(
            transcript,
            vec![
                "iptables -F CHAOS_DROP",
                "iptables -D INPUT -j CHAOS_DROP",
                "iptables -X CHAOS_DROP",
            ]
        );
    }
}
