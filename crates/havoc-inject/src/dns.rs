use havoc_domain::{Fault, ResolvedTarget};
use havoc_sidecar::SidecarManager;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::error::InjectError;
use crate::shaping::run_in_sidecar;

const DEVICE: &str = "eth0";

/// DNS degradation: a prio qdisc whose third band carries a netem delay,
/// with u32 filters steering UDP port 53 into it. Other traffic flows
/// through the default bands untouched.
pub async fn apply(
    sidecars: &SidecarManager,
    fault: &Fault,
    target: &ResolvedTarget,
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    let p = &fault.params;
    let delay_ms = p.get_f64("delay_ms")?.unwrap_or(500.0);
    let failure_rate = p.probability("failure_rate")?.unwrap_or(0.0);

    let id = &target.container_id;

    // Clear leftovers from any previous run.
    let _ = sidecars
        .exec_in_sidecar(id, &["tc", "qdisc", "del", "dev", DEVICE, "root"], cancel)
        .await;

    run_in_sidecar(
        sidecars,
        id,
        &["tc", "qdisc", "add", "dev", DEVICE, "root", "handle", "1:", "prio"],
        cancel,
    )
    .await?;

    let delay = format!("{}ms", delay_ms);
    let mut netem: Vec<String> = vec![
        "tc".into(),
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        DEVICE.into(),
        "parent".into(),
        "1:3".into(),
        "handle".into(),
        "30:".into(),
        "netem".into(),
        "delay".into(),
        delay,
    ];
    if failure_rate > 0.0 {
        netem.push("loss".into());
        netem.push(format!("{}%", failure_rate * 100.0));
    }
    let argv: Vec<&str> = netem.iter().map(String::as_str).collect();
    run_in_sidecar(sidecars, id, &argv, cancel).await?;

    // UDP port 53 → band 3.
    run_in_sidecar(
        sidecars,
        id,
        &[
            "tc", "filter", "add", "dev", DEVICE, "protocol", "ip", "parent", "1:0", "prio",
            "1", "u32", "match", "ip", "protocol", "17", "0xff", "match", "ip", "dport", "53",
            "0xffff", "flowid", "1:3",
        ],
        cancel,
    )
    .await?;

    info!(target = %target.name, delay_ms, failure_rate, "dns delay applied");
    Ok(())
}

/// Inverse: drop the root qdisc, taking the prio tree and filters with it.
pub async fn remove(
    sidecars: &SidecarManager,
    target_id: &str,
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    let _ = sidecars
        .exec_in_sidecar(target_id, &["tc", "qdisc", "del", "dev", DEVICE, "root"], cancel)
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_docker::FakeRuntime;
    use havoc_domain::{FaultKind, FaultParams};
    use std::sync::Arc;

    #[tokio::test]
    async fn dns_fault_builds_prio_netem_filter_stack() {
        let rt = FakeRuntime::new();
        let target_id = rt.add_container("validator1", "node:v1", None).await;
        let sidecars = Arc::new(SidecarManager::new(
            Arc::new(rt.clone()),
            "havoc/netshaper:latest",
        ));
        let cancel = CancellationToken::new();
        let sidecar = sidecars.create_sidecar(&target_id, &cancel).await.unwrap();

        let fault = Fault {
            phase: "dns".into(),
            description: None,
            target_alias: "t".into(),
            kind: FaultKind::Dns,
            params: FaultParams::new()
                .with("delay_ms", 750)
                .with("failure_rate", 0.25),
        };
        let target = ResolvedTarget {
            alias: "t".into(),
            container_id: target_id.clone(),
            name: "validator1".into(),
            ip: None,
        };

        apply(&sidecars, &fault, &target, &cancel).await.unwrap();

        let transcript = rt.transcript_for(&sidecar).await;
        assert!(transcript.iter().any(|c| c.contains("root handle 1: prio")));
        let netem = transcript.iter().find(|c| c.contains("netem")).unwrap();
        assert!(netem.contains("delay 750ms"));
        assert!(netem.contains("loss 25%"));
        let filter = transcript.iter().find(|c| c.contains("filter")).unwrap();
        assert!(filter.contains("dport 53"));
        assert!(filter.contains("protocol 17"));
    }
}
