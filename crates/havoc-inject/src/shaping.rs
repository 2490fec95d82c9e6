use havoc_domain::{Fault, ResolvedTarget};
use havoc_sidecar::SidecarManager;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::error::InjectError;

const DEFAULT_DEVICE: &str = "eth0";

/// Network degradation via the sidecar's traffic-shaping tool.
///
/// Plain latency/loss/bandwidth shaping goes through `tcset`; packet
/// reordering needs netem's `reorder` discipline, which `tcset` doesn't
/// expose, so that path drives `tc` directly. Either way the previous rules
/// are cleared first, making injection idempotent under retries.
pub async fn apply(
    sidecars: &SidecarManager,
    fault: &Fault,
    target: &ResolvedTarget,
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    let p = &fault.params;
    let device = p.get_str("device")?.unwrap_or(DEFAULT_DEVICE).to_string();

    // Clear any rules a previous (possibly crashed) run left behind.
    stop_shaping(sidecars, &target.container_id, &device, cancel).await;

    let reorder = p.percent("reorder")?.unwrap_or(0.0);
    if reorder > 0.0 {
        apply_reorder(sidecars, fault, target, &device, reorder, cancel).await
    } else {
        apply_tcset(sidecars, fault, target, &device, cancel).await
    }
}

/// Remove shaping: ask the shaping tool to clear its rules, then delete the
/// root qdisc for anything applied via direct `tc`.
pub async fn remove(
    sidecars: &SidecarManager,
    target_id: &str,
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    stop_shaping(sidecars, target_id, DEFAULT_DEVICE, cancel).await;
    debug!(target = %target_id, "network shaping removed");
    Ok(())
}

/// Best-effort rule clearing. "No rules to delete" is not a failure.
async fn stop_shaping(
    sidecars: &SidecarManager,
    target_id: &str,
    device: &str,
    cancel: &CancellationToken,
) {
    let _ = sidecars
        .exec_in_sidecar(target_id, &["tcdel", "--device", device, "--all"], cancel)
        .await;
    let _ = sidecars
        .exec_in_sidecar(target_id, &["tc", "qdisc", "del", "dev", device, "root"], cancel)
        .await;
}

async fn apply_tcset(
    sidecars: &SidecarManager,
    fault: &Fault,
    target: &ResolvedTarget,
    device: &str,
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    let p = &fault.params;

    let latency = p.get_f64("latency")?;
    let jitter = p.get_f64("jitter")?;
    let loss = p.percent("packet_loss")?;
    let bandwidth = p.get_f64("bandwidth")?;
    let protos = p.get_csv("target_proto")?;
    let ports = p.get_csv("target_ports")?;
    let ips = p.get_csv("target_ips")?;
    let cidr = p.get_str("target_cidr")?.map(String::from);

    let mut base: Vec<String> = vec!["tcset".into(), "--device".into(), device.into()];
    if let Some(ms) = latency {
        base.push("--delay".into());
        base.push(format!("{}ms", ms));
    }
    if let Some(ms) = jitter {
        base.push("--delay-distro".into());
        base.push(format!("{}", ms));
    }
    if let Some(pct) = loss {
        base.push("--loss".into());
        base.push(format!("{}%", pct));
    }
    if let Some(kbps) = bandwidth {
        base.push("--rate".into());
        base.push(format!("{}kbps", kbps));
    }
    for proto in &protos {
        base.push("--protocol".into());
        base.push(proto.clone());
    }

    // Build one invocation per (network, port) combination; the first takes
    // --overwrite, the rest --add so the rules accumulate.
    let mut networks: Vec<Option<String>> = ips.into_iter().map(Some).collect();
    if let Some(c) = cidr {
        networks.push(Some(c));
    }
    if networks.is_empty() {
        networks.push(None);
    }
    let port_list: Vec<Option<String>> = if ports.is_empty() {
        vec![None]
    } else {
        ports.into_iter().map(Some).collect()
    };

    let mut first = true;
    for network in &networks {
        for port in &port_list {
            let mut cmd = base.clone();
            if let Some(net) = network {
                cmd.push("--network".into());
                cmd.push(net.clone());
            }
            if let Some(port) = port {
                cmd.push("--port".into());
                cmd.push(port.clone());
            }
            cmd.push(if first { "--overwrite" } else { "--add" }.into());
            first = false;

            let argv: Vec<&str> = cmd.iter().map(String::as_str).collect();
            run_in_sidecar(sidecars, &target.container_id, &argv, cancel).await?;
        }
    }

    info!(target = %target.name, phase = %fault.phase, "network shaping applied");
    Ok(())
}

/// Reorder path: `tc qdisc add ... netem delay Xms reorder N% [C%]`.
/// netem requires a delay for reordering to have an effect.
async fn apply_reorder(
    sidecars: &SidecarManager,
    fault: &Fault,
    target: &ResolvedTarget,
    device: &str,
    reorder: f64,
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    let p = &fault.params;
    let latency = p.get_f64("latency")?.unwrap_or(10.0);
    let correlation = p.percent("reorder_correlation")?;
    let loss = p.percent("packet_loss")?;

    let mut cmd: Vec<String> = vec![
        "tc".into(),
        "qdisc".into(),
        "add".into(),
        "dev".into(),
        device.into(),
        "root".into(),
        "netem".into(),
        "delay".into(),
        format!("{}ms", latency),
        "reorder".into(),
        format!("{}%", reorder),
    ];
    if let Some(c) = correlation {
        cmd.push(format!("{}%", c));
    }
    if let Some(l) = loss {
        cmd.push("loss".into());
        cmd.push(format!("{}%", l));
    }

    let argv: Vec<&str> = cmd.iter().map(String::as_str).collect();
    run_in_sidecar(sidecars, &target.container_id, &argv, cancel).await?;

    info!(target = %target.name, reorder = reorder, "packet reordering applied");
    Ok(())
}

pub(crate) async fn run_in_sidecar(
    sidecars: &SidecarManager,
    target_id: &str,
    argv: &[&str],
    cancel: &CancellationToken,
) -> Result<(), InjectError> {
    let out = sidecars.exec_in_sidecar(target_id, argv, cancel).await?;
    if !out.success() {
        return Err(InjectError::CommandFailed {
            target: target_id.to_string(),
            command: argv.join(" "),
            exit_code: out.exit_code,
            output: out.output,
        });
    }
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
            phase: "net".into(),
            description: None,
            target_alias: "t".into(),
            kind: FaultKind::Network,
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
    async fn latency_fault_clears_then_sets() {
        let (rt, sidecars, target, sidecar) = setup().await;
        let cancel = CancellationToken::new();

        let f = fault(
            FaultParams::new()
                .with("latency", 500)
                .with("jitter", 50)
                .with("target_proto", "tcp"),
        );
        apply(&sidecars, &f, &resolved(&target), &cancel).await.unwrap();

        let transcript = rt.transcript_for(&sidecar).await;
        assert!(transcript[0].starts_with("tcdel --device eth0"));
        let set = transcript.iter().find(|c| c.starts_with("tcset")).unwrap();
        assert!(set.contains("--delay 500ms"));
        assert!(set.contains("--delay-distro 50"));
        assert!(set.contains("--protocol tcp"));
        assert!(set.contains("--overwrite"));
    }

    #[tokio::test]
    async fn multiple_ports_accumulate_rules() {
        let (rt, sidecars, target, sidecar) = setup().await;
        let cancel = CancellationToken::new();

        let f = fault(
            FaultParams::new()
                .with("latency", 100)
                .with("target_ports", "8545,8546"),
        );
        apply(&sidecars, &f, &resolved(&target), &cancel).await.unwrap();

        let transcript = rt.transcript_for(&sidecar).await;
        let sets: Vec<&String> = transcript.iter().filter(|c| c.starts_with("tcset")).collect();
        assert_eq!(sets.len(), 2);
        assert!(sets[0].contains("--port 8545") && sets[0].contains("--overwrite"));
        assert!(sets[1].contains("--port 8546") && sets[1].contains("--add"));
    }

    #[tokio::test]
    async fn reorder_uses_direct_tc() {
        let (rt, sidecars, target, sidecar) = setup().await;
        let cancel = CancellationToken::new();

        let f = fault(
            FaultParams::new()
                .with("latency", 20)
                .with("reorder", 25)
                .with("reorder_correlation", 50),
        );
        apply(&sidecars, &f, &resolved(&target), &cancel).await.unwrap();

        let transcript = rt.transcript_for(&sidecar).await;
        let tc = transcript
            .iter()
            .find(|c| c.contains("netem"))
            .expect("expected a direct tc command");
        assert!(tc.contains("delay 20ms"));
        assert!(tc.contains("reorder 25%"));
        assert!(tc.contains("50%"));
    }

    #[tokio::test]
    async fn failed_tcset_surfaces_command_error() {
        let (rt, sidecars, target, _) = setup().await;
        rt.script_exec("tcset", "RTNETLINK answers: File exists", 1).await;
        let cancel = CancellationToken::new();

        let f = fault(FaultParams::new().with("latency", 100));
        let err = apply(&sidecars, &f, &resolved(&target), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, InjectError::CommandFailed { .. }));
    }

    #[tokio::test]
    async fn remove_clears_both_tool_and_raw_qdisc() {
        let (rt, sidecars, target, sidecar) = setup().await;
        let cancel = CancellationToken::new();

        remove(&sidecars, &target, &cancel).await.unwrap();
        let transcript = rt.transcript_for(&sidecar).await;
        assert!(transcript.iter().any(|c| c.starts_with("tcdel")));
        assert!(transcript.iter().any(|c| c == "tc qdisc del dev eth0 root"));
    }
}
