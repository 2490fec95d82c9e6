use std::sync::Arc;

use havoc_docker::ContainerApi;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::error::SidecarError;

/// What a namespace scan found. `clean` is the conjunction of the four
/// artifact checks.
#[derive(Debug, Clone, Default)]
pub struct Verification {
    pub clean: bool,
    pub tc_found: bool,
    pub pfilter_found: bool,
    pub nft_found: bool,
    pub envoy_found: bool,
    pub details: Vec<String>,
}

impl Verification {
    fn finish(mut self) -> Self {
        self.clean =
            !(self.tc_found || self.pfilter_found || self.nft_found || self.envoy_found);
        self
    }
}

/// Scans a target's namespace for leftover fault artifacts and remediates.
///
/// All checks run through the exec primitive in the target container and are
/// tolerant of missing tools: a diagnostic command that fails or is absent
/// counts as "no finding" (with a detail note), never as an error.
pub struct Verifier {
    api: Arc<dyn ContainerApi>,
}

impl Verifier {
    pub fn new(api: Arc<dyn ContainerApi>) -> Self {
        Self { api }
    }

    /// Inspect the target's namespace for traffic-control queues, chaos
    /// packet-filter rules, chaos nftables tables, and leftover proxy
    /// processes.
    pub async fn verify_clean(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Verification, SidecarError> {
        let mut v = Verification::default();

        match self.try_exec(target_id, &["tc", "qdisc", "show"], cancel).await {
            Some(out) => {
                for line in out.lines() {
                    if line.contains("netem") || line.contains("tbf") {
                        v.tc_found = true;
                        v.details.push(format!("tc: {}", line.trim()));
                    }
                }
            }
            None => v.details.push("tc unavailable; skipping qdisc check".into()),
        }

        match self.try_exec(target_id, &["iptables", "-S"], cancel).await {
            Some(out) => {
                for line in out.lines() {
                    if line.to_ascii_lowercase().contains("chaos") {
                        v.pfilter_found = true;
                        v.details.push(format!("iptables: {}", line.trim()));
                    }
                }
            }
            None => v.details.push("iptables unavailable; skipping rule check".into()),
        }

        match self.try_exec(target_id, &["nft", "list", "tables"], cancel).await {
            Some(out) => {
                if out.contains("chaos_utils") {
                    v.nft_found = true;
                    v.details.push("nft: chaos_utils table present".into());
                }
            }
            None => v.details.push("nft unavailable; skipping table check".into()),
        }

        match self.try_exec(target_id, &["ps", "aux"], cancel).await {
            Some(out) => {
                for line in out.lines() {
                    if line.contains("envoy") {
                        v.envoy_found = true;
                        v.details.push(format!("process: {}", line.trim()));
                    }
                }
            }
            None => v.details.push("ps unavailable; skipping process check".into()),
        }

        let v = v.finish();
        debug!(
            target = %target_id,
            clean = v.clean,
            tc = v.tc_found,
            pfilter = v.pfilter_found,
            nft = v.nft_found,
            envoy = v.envoy_found,
            "namespace verified"
        );
        Ok(v)
    }

    /// Best-effort removal of whatever [`Verifier::verify_clean`] found,
    /// followed by a re-verify. A still-dirty result is returned for the
    /// caller to surface, not raised as an error.
    pub async fn cleanup_artifacts(
        &self,
        target_id: &str,
        cancel: &CancellationToken,
    ) -> Result<Verification, SidecarError> {
        let before = self.verify_clean(target_id, cancel).await?;
        if before.clean {
            return Ok(before);
        }

        if before.tc_found {
            self.try_exec(target_id, &["tc", "qdisc", "del", "dev", "eth0", "root"], cancel)
                .await;
        }
        if before.pfilter_found {
            self.try_exec(target_id, &["iptables", "-F", "CHAOS_DROP"], cancel).await;
            self.try_exec(target_id, &["iptables", "-D", "INPUT", "-j", "CHAOS_DROP"], cancel)
                .await;
            self.try_exec(target_id, &["iptables", "-X", "CHAOS_DROP"], cancel).await;
        }
        if before.nft_found {
            self.try_exec(
                target_id,
                &["nft", "delete", "table", "inet", "chaos_utils"],
                cancel,
            )
            .await;
        }
        if before.envoy_found {
            self.try_exec(target_id, &["pkill", "-9", "envoy"], cancel).await;
        }

        let after = self.verify_clean(target_id, cancel).await?;
        if !after.clean {
            warn!(target = %target_id, details = ?after.details, "namespace still dirty after remediation");
        }
        Ok(after)
    }

    /// Exec that treats every failure as "tool unavailable". Returns the
    /// combined output only on a zero exit.
    async fn try_exec(
        &self,
        target_id: &str,
        argv: &[&str],
        cancel: &CancellationToken,
    ) -> Option<String> {
        match self.api.exec(target_id, argv, cancel).await {
            Ok(out) if out.success() => Some(out.output),
            Ok(out) => {
                debug!(target = %target_id, ?argv, exit = out.exit_code, "diagnostic exec non-zero");
                None
            }
            Err(e) => {
                debug!(target = %target_id, ?argv, error = %e, "diagnostic exec failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use havoc_docker::FakeRuntime;

    #[tokio::test]
    async fn clean_namespace_passes() {
        let rt = FakeRuntime::new();
        let target = rt.add_container("validator1", "node:v1", None).await;
        let verifier = Verifier::new(Arc::new(rt));
        let cancel = CancellationToken::new();

        let v = verifier.verify_clean(&target, &cancel).await.unwrap();
        assert!(v.clean);
    }

    #[tokio::test]
    async fn netem_qdisc_flags_dirty() {
        let rt = FakeRuntime::new();
        let target = rt.add_container("validator1", "node:v1", None).await;
        rt.script_exec(
            "tc qdisc show",
            "qdisc netem 8001: dev eth0 root refcnt 2 limit 1000 delay 500ms\n",
            0,
        )
        .await;
        let verifier = Verifier::new(Arc::new(rt));
        let cancel = CancellationToken::new();

        let v = verifier.verify_clean(&target, &cancel).await.unwrap();
        assert!(!v.clean);
        assert!(v.tc_found);
        assert!(!v.pfilter_found);
    }

    #[tokio::test]
    async fn chaos_chain_flags_dirty() {
        let rt = FakeRuntime::new();
        let target = rt.add_container("validator1", "node:v1", None).await;
        rt.script_exec("iptables -S", "-P INPUT ACCEPT\n-N CHAOS_DROP\n", 0)
            .await;
        let verifier = Verifier::new(Arc::new(rt));
        let cancel = CancellationToken::new();

        let v = verifier.verify_clean(&target, &cancel).await.unwrap();
        assert!(v.pfilter_found);
        assert!(!v.clean);
    }

    #[tokio::test]
    async fn missing_tools_count_as_clean() {
        let rt = FakeRuntime::new();
        let target = rt.add_container("validator1", "node:v1", None).await;
        rt.script_exec("tc qdisc show", "sh: tc: not found\n", 127).await;
        rt.script_exec("nft list tables", "", 127).await;
        let verifier = Verifier::new(Arc::new(rt));
        let cancel = CancellationToken::new();

        let v = verifier.verify_clean(&target, &cancel).await.unwrap();
        assert!(v.clean);
        assert!(v.details.iter().any(|d| d.contains("unavailable")));
    }

    #[tokio::test]
    async fn cleanup_issues_remediation_commands() {
        let rt = FakeRuntime::new();
        let target = rt.add_container("validator1", "node:v1", None).await;
        rt.script_exec(
            "tc qdisc show",
            "qdisc netem 8001: dev eth0 root refcnt 2\n",
            0,
        )
        .await;
        let verifier = Verifier::new(Arc::new(rt.clone()));
        let cancel = CancellationToken::new();

        // The fake keeps reporting the netem qdisc, so remediation runs and
        // the result stays dirty — which the caller must surface.
        let v = verifier.cleanup_artifacts(&target, &cancel).await.unwrap();
        assert!(!v.clean);

        let transcript = rt.transcript_for(&target).await;
        assert!(transcript
            .iter()
            .any(|c| c == "tc qdisc del dev eth0 root"));
    }
}
