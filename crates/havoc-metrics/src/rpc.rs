use std::time::Duration;

use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::error::MetricsError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Minimal EVM JSON-RPC client; only `eth_call` is needed for
/// contract-address invariant checks.
#[derive(Debug, Clone)]
pub struct RpcClient {
    endpoint: String,
    http: reqwest::Client,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<String>,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

impl RpcClient {
    pub fn new(endpoint: impl Into<String>) -> Result<Self, MetricsError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            endpoint: endpoint.into(),
            http,
        })
    }

    /// `eth_call` against the latest block; returns the raw hex string.
    pub async fn eth_call(&self, to: &str, data: &str) -> Result<String, MetricsError> {
        debug!(to, "eth_call");
        let body = json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "eth_call",
            "params": [{"to": to, "data": data}, "latest"],
        });

        let resp = self.http.post(&self.endpoint).json(&body).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MetricsError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: RpcResponse = resp.json().await?;
        if let Some(err) = parsed.error {
            return Err(MetricsError::RpcError {
                code: err.code,
                message: err.message,
            });
        }
        parsed
            .result
            .ok_or_else(|| MetricsError::BadResponse("rpc response missing result".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn eth_call_returns_result_hex() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({"method": "eth_call"})))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": "0x0000000000000000000000000000000000000000000000000000000000000001"
            })))
            .mount(&server)
            .await;

        let client = RpcClient::new(server.uri()).unwrap();
        let result = client
            .eth_call("0x0000000000000000000000000000000000000001", "0x")
            .await
            .unwrap();
        assert!(result.ends_with("01"));
    }

    #[tokio::test]
    async fn rpc_error_object_is_typed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1,
                "error": {"code": -32000, "message": "execution reverted"}
            })))
            .mount(&server)
            .await;

        let client = RpcClient::new(server.uri()).unwrap();
        let err = client.eth_call("0x0a", "0x").await.unwrap_err();
        assert!(matches!(err, MetricsError::RpcError { code: -32000, .. }));
    }
}
