use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tracing::debug;

use crate::error::MetricsError;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// One instant-vector element.
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: f64,
    pub value: f64,
    pub labels: HashMap<String, String>,
}

/// One range-vector (matrix) series.
#[derive(Debug, Clone)]
pub struct RangeSeries {
    pub labels: HashMap<String, String>,
    /// (timestamp, value) pairs in time order.
    pub points: Vec<(f64, f64)>,
}

/// Client for the metrics service's instant and range query endpoints.
#[derive(Debug, Clone)]
pub struct MetricsClient {
    base_url: String,
    http: reqwest::Client,
}

// The standard vector/matrix response envelope.
#[derive(Debug, Deserialize)]
struct ApiResponse {
    status: String,
    #[serde(default)]
    data: Option<ApiData>,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiData {
    #[serde(rename = "resultType")]
    result_type: String,
    #[serde(default)]
    result: Vec<ApiResult>,
}

#[derive(Debug, Deserialize)]
struct ApiResult {
    #[serde(default)]
    metric: HashMap<String, String>,
    /// Instant queries: [ts, "value"].
    #[serde(default)]
    value: Option<(f64, String)>,
    /// Range queries: [[ts, "value"], ...].
    #[serde(default)]
    values: Option<Vec<(f64, String)>>,
}

impl MetricsClient {
    pub fn new(base_url: impl Into<String>) -> Result<Self, MetricsError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    /// Instant query: latest value per matching series.
    pub async fn query_latest(&self, query: &str) -> Result<Vec<Sample>, MetricsError> {
        let url = format!("{}/api/v1/query", self.base_url.trim_end_matches('/'));
        debug!(query, "instant query");

        let resp = self.http.get(&url).query(&[("query", query)]).send().await?;
        let data = Self::unwrap_envelope(resp).await?;

        let samples = data
            .result
            .into_iter()
            .filter_map(|r| {
                let (ts, raw) = r.value?;
                let value = raw.parse::<f64>().ok()?;
                Some(Sample {
                    timestamp: ts,
                    value,
                    labels: r.metric,
                })
            })
            .collect();
        Ok(samples)
    }

    /// Range query over [start, end] at `step` resolution.
    pub async fn query_range(
        &self,
        query: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        step: Duration,
    ) -> Result<Vec<RangeSeries>, MetricsError> {
        let url = format!("{}/api/v1/query_range", self.base_url.trim_end_matches('/'));
        debug!(query, %start, %end, "range query");

        let resp = self
            .http
            .get(&url)
            .query(&[
                ("query", query.to_string()),
                ("start", start.timestamp().to_string()),
                ("end", end.timestamp().to_string()),
                ("step", format!("{}s", step.as_secs().max(1))),
            ])
            .send()
            .await?;
        let data = Self::unwrap_envelope(resp).await?;

        let series = data
            .result
            .into_iter()
            .map(|r| RangeSeries {
                labels: r.metric,
                points: r
                    .values
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|(ts, raw)| raw.parse::<f64>().ok().map(|v| (ts, v)))
                    .collect(),
            })
            .collect();
        Ok(series)
    }

    async fn unwrap_envelope(resp: reqwest::Response) -> Result<ApiData, MetricsError> {
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(MetricsError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }
        let envelope: ApiResponse = resp.json().await?;
        if envelope.status != "success" {
            return Err(MetricsError::BadResponse(
                envelope.error.unwrap_or_else(|| "query failed".into()),
            ));
        }
        envelope
            .data
            .ok_or_else(|| MetricsError::BadResponse("missing data field".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn vector_body(value: &str) -> serde_json::Value {
        serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {
                        "metric": {"__name__": "up", "job": "heimdall"},
                        "value": [1714000000.123, value]
                    }
                ]
            }
        })
    }

    #[tokio::test]
    async fn instant_query_parses_vector() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", "up"))
            .respond_with(ResponseTemplate::new(200).set_body_json(vector_body("1")))
            .mount(&server)
            .await;

        let client = MetricsClient::new(server.uri()).unwrap();
        let samples = client.query_latest("up").await.unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].value, 1.0);
        assert_eq!(samples[0].labels.get("job").unwrap(), "heimdall");
    }

    #[tokio::test]
    async fn empty_vector_is_zero_samples() {
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

        let client = MetricsClient::new(server.uri()).unwrap();
        let samples = client.query_latest("missing_metric").await.unwrap();
        assert!(samples.is_empty());
    }

    #[tokio::test]
    async fn error_status_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .mount(&server)
            .await;

        let client = MetricsClient::new(server.uri()).unwrap();
        let err = client.query_latest("up").await.unwrap_err();
        assert!(matches!(err, MetricsError::BadStatus { status: 503, .. }));
    }

    #[tokio::test]
    async fn range_query_parses_matrix() {
        let server = MockServer::start().await;
        let body = serde_json::json!({
            "status": "success",
            "data": {
                "resultType": "matrix",
                "result": [
                    {
                        "metric": {"__name__": "height"},
                        "values": [[1714000000.0, "100"], [1714000015.0, "101"]]
                    }
                ]
            }
        });
        Mock::given(method("GET"))
            .and(path("/api/v1/query_range"))
            .respond_with(ResponseTemplate::new(200).set_body_json(body))
            .mount(&server)
            .await;

        let client = MetricsClient::new(server.uri()).unwrap();
        let series = client
            .query_range(
                "height",
                Utc::now() - chrono::Duration::seconds(60),
                Utc::now(),
                Duration::from_secs(15),
            )
            .await
            .unwrap();
        assert_eq!(series.len(), 1);
        assert_eq!(series[0].points, vec![(1714000000.0, 100.0), (1714000015.0, 101.0)]);
    }
}
