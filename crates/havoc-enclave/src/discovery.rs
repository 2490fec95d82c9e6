use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::error::DiscoveryError;

/// How long one `port print` invocation may take before it is killed.
const PORT_PRINT_TIMEOUT: Duration = Duration::from_secs(15);

/// Wrapper around the enclave orchestration binary on PATH.
#[derive(Debug, Clone)]
pub struct EnclaveTool {
    binary: String,
}

impl Default for EnclaveTool {
    fn default() -> Self {
        Self {
            binary: "kurtosis".to_string(),
        }
    }
}

impl EnclaveTool {
    pub fn new(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Resolve a service port to a URL via the tool's port-print facility.
    ///
    /// Tries `candidates` in order (e.g. `["metrics-001", "metrics"]`) and
    /// returns the first output line starting with `http://` or `https://`.
    pub async fn discover_endpoint(
        &self,
        enclave: &str,
        candidates: &[&str],
        port_name: &str,
    ) -> Result<String, DiscoveryError> {
        for service in candidates {
            match self.port_print(enclave, service, port_name).await {
                Ok(Some(url)) => {
                    debug!(enclave, service, port_name, url = %url, "endpoint discovered");
                    return Ok(url);
                }
                Ok(None) => {
                    debug!(enclave, service, port_name, "no url in port print output");
                }
                Err(e) => {
                    // A missing service is expected while walking candidates.
                    debug!(enclave, service, error = %e, "port print attempt failed");
                }
            }
        }
        Err(DiscoveryError::EndpointNotFound {
            enclave: enclave.to_string(),
            port_name: port_name.to_string(),
            tried: candidates.join(", "),
        })
    }

    /// Run `<binary> port print <enclave> <service> <port>` and scan stdout
    /// for a URL line.
    async fn port_print(
        &self,
        enclave: &str,
        service: &str,
        port_name: &str,
    ) -> Result<Option<String>, DiscoveryError> {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["port", "print", enclave, service, port_name])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::null());

        let mut child = cmd
            .spawn()
            .map_err(|e| DiscoveryError::ToolFailed(format!("spawn {}: {}", self.binary, e)))?;

        let stdout = child.stdout.take().expect("stdout piped");

        let scan = async {
            let mut lines = BufReader::new(stdout).lines();
            let mut found = None;
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.starts_with("http://") || line.starts_with("https://") {
                    found = Some(line.to_string());
                    break;
                }
            }
            found
        };

        let found = match tokio::time::timeout(PORT_PRINT_TIMEOUT, scan).await {
            Ok(found) => found,
            Err(_) => {
                let _ = child.kill().await;
                warn!(enclave, service, "port print timed out");
                return Err(DiscoveryError::ToolFailed(format!(
                    "{} port print timed out after {}s",
                    self.binary,
                    PORT_PRINT_TIMEOUT.as_secs()
                )));
            }
        };

        let status = child
            .wait()
            .await
            .map_err(|e| DiscoveryError::ToolFailed(format!("wait {}: {}", self.binary, e)))?;

        if !status.success() && found.is_none() {
            return Err(DiscoveryError::ToolFailed(format!(
                "{} port print exited with {:?}",
                self.binary,
                status.code()
            )));
        }

        Ok(found)
    }
}
