use havoc_domain::{CheckMode, CriterionCheck, SuccessCriterion, Threshold};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::client::MetricsClient;
use crate::error::MetricsError;
use crate::rpc::RpcClient;

/// Outcome of one success criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionResult {
    pub name: String,
    pub passed: bool,
    pub critical: bool,
    /// Observed value for metric criteria.
    pub value: Option<f64>,
    pub message: String,
    /// Set when the check could not run at all (e.g. RPC endpoint
    /// unreachable while itself under fault); never aborts the experiment.
    pub soft_fail: bool,
}

/// Evaluates criteria after TEARDOWN so measurement traffic is not subject
/// to the faults it measures.
pub struct Evaluator {
    metrics: MetricsClient,
    rpc: Option<RpcClient>,
}

impl Evaluator {
    pub fn new(metrics: MetricsClient, rpc: Option<RpcClient>) -> Self {
        Self { metrics, rpc }
    }

    /// Evaluate one criterion.
    ///
    /// Metrics-service transport failures are hard errors (the testbed's
    /// observability must be reachable at DETECT time); RPC transport
    /// failures soft-fail.
    pub async fn evaluate(
        &self,
        criterion: &SuccessCriterion,
    ) -> Result<CriterionResult, MetricsError> {
        let result = match &criterion.check {
            CriterionCheck::MetricQuery { query, threshold } => {
                self.eval_metric(criterion, query, threshold).await?
            }
            CriterionCheck::Rpc {
                address,
                call_data,
                check_mode,
                expected,
            } => {
                self.eval_rpc(criterion, address, call_data, *check_mode, expected.as_deref())
                    .await
            }
            CriterionCheck::HealthCheck { service } => {
                let query = match service {
                    Some(job) => format!("up{{job=\"{}\"}}", job),
                    None => "up".to_string(),
                };
                self.eval_metric(criterion, &query, "> 0").await?
            }
        };

        if result.passed {
            info!(criterion = %result.name, "criterion passed");
        } else {
            warn!(
                criterion = %result.name,
                critical = result.critical,
                soft = result.soft_fail,
                message = %result.message,
                "criterion failed"
            );
        }
        Ok(result)
    }

    async fn eval_metric(
        &self,
        criterion: &SuccessCriterion,
        query: &str,
        threshold: &str,
    ) -> Result<CriterionResult, MetricsError> {
        let threshold: Threshold = threshold.parse()?;
        let samples = self.metrics.query_latest(query).await?;

        let Some(sample) = samples.first() else {
            return Ok(CriterionResult {
                name: criterion.name.clone(),
                passed: false,
                critical: criterion.critical,
                value: None,
                message: format!("no results for query '{}'", query),
                soft_fail: false,
            });
        };

        let passed = threshold.matches(sample.value);
        Ok(CriterionResult {
            name: criterion.name.clone(),
            passed,
            critical: criterion.critical,
            value: Some(sample.value),
            message: format!("observed {} against threshold {}", sample.value, threshold),
            soft_fail: false,
        })
    }

    async fn eval_rpc(
        &self,
        criterion: &SuccessCriterion,
        address: &str,
        call_data: &str,
        check_mode: CheckMode,
        expected: Option<&str>,
    ) -> CriterionResult {
        let Some(rpc) = &self.rpc else {
            return CriterionResult {
                name: criterion.name.clone(),
                passed: false,
                critical: criterion.critical,
                value: None,
                message: "rpc endpoint unavailable: none configured".into(),
                soft_fail: true,
            };
        };

        let returned = match rpc.eth_call(address, call_data).await {
            Ok(hex) => hex,
            Err(MetricsError::RpcError { code, message }) => {
                // The endpoint answered; the call itself failed.
                return CriterionResult {
                    name: criterion.name.clone(),
                    passed: false,
                    critical: criterion.critical,
                    value: None,
                    message: format!("rpc error {}: {}", code, message),
                    soft_fail: false,
                };
            }
            Err(e) => {
                // Transport-level failure: the target RPC may itself be the
                // component under fault. Record and move on.
                return CriterionResult {
                    name: criterion.name.clone(),
                    passed: false,
                    critical: criterion.critical,
                    value: None,
                    message: format!("rpc endpoint unavailable: {}", e),
                    soft_fail: true,
                };
            }
        };

        let empty = returned.is_empty() || returned == "0x";
        let (passed, message) = match check_mode {
            CheckMode::Exact => {
                let want = expected.unwrap_or("");
                (
                    returned == want,
                    format!("returned '{}', expected '{}'", returned, want),
                )
            }
            CheckMode::NonEmpty => (!empty, format!("returned '{}'", returned)),
            CheckMode::Empty => (empty, format!("returned '{}'", returned)),
        };

        CriterionResult {
            name: criterion.name.clone(),
            passed,
            critical: criterion.critical,
            value: None,
            message,
            soft_fail: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn metric_criterion(name: &str, query: &str, threshold: &str, critical: bool) -> SuccessCriterion {
        SuccessCriterion {
            name: name.into(),
            description: None,
            critical,
            window: None,
            check: CriterionCheck::MetricQuery {
                query: query.into(),
                threshold: threshold.into(),
            },
        }
    }

    fn rpc_criterion(check_mode: CheckMode, expected: Option<&str>) -> SuccessCriterion {
        SuccessCriterion {
            name: "precompile".into(),
            description: None,
            critical: false,
            window: None,
            check: CriterionCheck::Rpc {
                address: "0x0000000000000000000000000000000000000001".into(),
                call_data: "0x".into(),
                check_mode,
                expected: expected.map(String::from),
            },
        }
    }

    async fn metrics_with_value(value: &str) -> MockServer {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [{"metric": {}, "value": [1714000000.0, value]}]
            }
        });
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;
        server
    }

    #[tokio::test]
    async fn metric_criterion_passes_above_threshold() {
        let server = metrics_with_value("5").await;
        let evaluator = Evaluator::new(MetricsClient::new(server.uri()).unwrap(), None);

        let result = evaluator
            .evaluate(&metric_criterion("blocks", "rate(blocks[1m])", "> 0", true))
            .await
            .unwrap();
        assert!(result.passed);
        assert_eq!(result.value, Some(5.0));
    }

    #[tokio::test]
    async fn metric_criterion_fails_below_threshold() {
        let server = metrics_with_value("5").await;
        let evaluator = Evaluator::new(MetricsClient::new(server.uri()).unwrap(), None);

        let result = evaluator
            .evaluate(&metric_criterion("blocks", "rate(blocks[1m])", "> 1e9", true))
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(!result.soft_fail);
    }

    #[tokio::test]
    async fn zero_results_fail_with_no_results_message() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "status": "success",
            "data": {"resultType": "vector", "result": []}
        });
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let evaluator = Evaluator::new(MetricsClient::new(server.uri()).unwrap(), None);
        let result = evaluator
            .evaluate(&metric_criterion("ghost", "missing", "> 0", false))
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.message.contains("no results"));
    }

    #[tokio::test]
    async fn metrics_transport_failure_is_hard() {
        // Nothing listens on this port.
        let evaluator = Evaluator::new(MetricsClient::new("http://127.0.0.1:9").unwrap(), None);
        let err = evaluator
            .evaluate(&metric_criterion("blocks", "up", "> 0", true))
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn rpc_transport_failure_is_soft() {
        let server = metrics_with_value("1").await;
        let evaluator = Evaluator::new(
            MetricsClient::new(server.uri()).unwrap(),
            Some(RpcClient::new("http://127.0.0.1:9").unwrap()),
        );

        let result = evaluator
            .evaluate(&rpc_criterion(CheckMode::NonEmpty, None))
            .await
            .unwrap();
        assert!(!result.passed);
        assert!(result.soft_fail);
        assert!(result.message.contains("unavailable"));
    }

    #[tokio::test]
    async fn rpc_check_modes_compare_hex() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "jsonrpc": "2.0", "id": 1, "result": "0x"
            })))
            .mount(&server)
            .await;
        let metrics_server = metrics_with_value("1").await;
        let evaluator = Evaluator::new(
            MetricsClient::new(metrics_server.uri()).unwrap(),
            Some(RpcClient::new(server.uri()).unwrap()),
        );

        let empty = evaluator
            .evaluate(&rpc_criterion(CheckMode::Empty, None))
            .await
            .unwrap();
        assert!(empty.passed);

        let non_empty = evaluator
            .evaluate(&rpc_criterion(CheckMode::NonEmpty, None))
            .await
            .unwrap();
        assert!(!non_empty.passed);

        let exact = evaluator
            .evaluate(&rpc_criterion(CheckMode::Exact, Some("0x")))
            .await
            .unwrap();
        assert!(exact.passed);
    }

    #[tokio::test]
    async fn health_check_uses_up_series() {
        let server = metrics_with_value("1").await;
        let evaluator = Evaluator::new(MetricsClient::new(server.uri()).unwrap(), None);

        let criterion = SuccessCriterion {
            name: "node-up".into(),
            description: None,
            critical: true,
            window: None,
            check: CriterionCheck::HealthCheck {
                service: Some("heimdall".into()),
            },
        };
        let result = evaluator.evaluate(&criterion).await.unwrap();
        assert!(result.passed);
    }
}
