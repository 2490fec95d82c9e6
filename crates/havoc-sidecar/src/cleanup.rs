use std::sync::Arc;

use havoc_domain::AuditEntry;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::manager::SidecarManager;
use crate::verify::Verifier;

/// Drives sidecar destruction and namespace verification to completion.
///
/// Invoked by the orchestrator at TEARDOWN and by the emergency controller
/// on interruption or panic. Both paths are safe after cleanup already ran:
/// an empty binding map simply produces no entries. Per-target failures are
/// recorded and the loop continues.
pub struct CleanupCoordinator {
    sidecars: Arc<SidecarManager>,
    verifier: Verifier,
}

impl CleanupCoordinator {
    pub fn new(sidecars: Arc<SidecarManager>, verifier: Verifier) -> Self {
        Self { sidecars, verifier }
    }

    /// For every bound target: destroy the sidecar, verify the namespace,
    /// and remediate + re-verify if dirty. Returns the audit trail.
    pub async fn cleanup_all(&self, cancel: &CancellationToken) -> Vec<AuditEntry> {
        let bindings = self.sidecars.bindings().await;
        if bindings.is_empty() {
            return Vec::new();
        }

        info!(count = bindings.len(), "cleaning up sidecars");
        let mut audit = Vec::new();

        let mut targets: Vec<String> = bindings.keys().cloned().collect();
        targets.sort();

        for target in targets {
            match self.sidecars.destroy_sidecar(&target, cancel).await {
                Ok(()) => audit.push(AuditEntry::ok("destroy_sidecar", &target, "sidecar removed")),
                Err(e) => {
                    warn!(target = %target, error = %e, "sidecar destroy failed");
                    audit.push(AuditEntry::failed("destroy_sidecar", &target, e.to_string()));
                }
            }

            let verification = match self.verifier.verify_clean(&target, cancel).await {
                Ok(v) => v,
                Err(e) => {
                    audit.push(AuditEntry::failed("verify_namespace", &target, e.to_string()));
                    continue;
                }
            };

            if verification.clean {
                audit.push(AuditEntry::ok("verify_namespace", &target, "namespace clean"));
                continue;
            }

            audit.push(AuditEntry::failed(
                "verify_namespace",
                &target,
                verification.details.join("; "),
            ));

            match self.verifier.cleanup_artifacts(&target, cancel).await {
                Ok(after) if after.clean => {
                    audit.push(AuditEntry::ok(
                        "cleanup_artifacts",
                        &target,
                        "artifacts removed; namespace clean",
                    ));
                }
                Ok(after) => {
                    audit.push(AuditEntry::failed(
                        "cleanup_artifacts",
                        &target,
                        format!("still dirty: {}", after.details.join("; ")),
                    ));
                }
                Err(e) => {
                    audit.push(AuditEntry::failed("cleanup_artifacts", &target, e.to_string()));
                }
            }
        }

        audit
    }
}
