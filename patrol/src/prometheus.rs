const BASE_DELAY: u64 = 100;
const MAX_RETRIES: u32 = 2;

use crate::types::CardinalitySample;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;

#[derive(thiserror::Error, Debug)]
pub enum QueryError {
    #[error("request to metrics backend failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid URL: {0}")]
    InvalidUrl(String),
    #[error("metrics backend returned {status}: {body}")]
    Status { status: StatusCode, body: String },
    #[error("query rejected ({error_type}): {error}")]
    Api { error_type: String, error: String },
    #[error("could not decode query response: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("unexpected result type {0:?}, expected vector")]
    UnexpectedResultType(String),
    #[error("invalid sample value {0:?}")]
    InvalidSample(String),
    #[error("query timed out after {0:?}")]
    Timeout(Duration),
}

/// The one question the patrol asks of the metrics backend.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// The `top_n` metrics matching `selector` with the most distinct values
    /// of `label`, as currently ingested.
    async fn top_cardinality(
        &self,
        selector: &str,
        label: &str,
        top_n: usize,
    ) -> Result<Vec<CardinalitySample>, QueryError>;
}

#[derive(Deserialize)]
struct QueryResponse {
    status: String,
    data: Option<QueryData>,
    #[serde(rename = "errorType")]
    error_type: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryData {
    result_type: String,
    result: serde_json::Value,
}

#[derive(Deserialize)]
struct VectorSample {
    metric: HashMap<String, String>,
    // (unix timestamp, value as string)
    value: (f64, String),
}

/// Instant-query client for the Prometheus HTTP API.
pub struct PrometheusClient {
    client: reqwest::Client,
    query_url: Url,
}

impl PrometheusClient {
    pub fn new(base_url: &Url, timeout: Duration) -> Result<Self, QueryError> {
        let query_url = Url::parse(&format!(
            "{}/api/v1/query",
            base_url.as_str().trim_end_matches('/')
        ))
        .map_err(|e| QueryError::InvalidUrl(e.to_string()))?;

        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(PrometheusClient { client, query_url })
    }

    async fn instant_query(&self, query: &str) -> Result<Vec<VectorSample>, QueryError> {
        const RETRIABLE_STATUS_CODES: &[StatusCode] = &[
            StatusCode::TOO_MANY_REQUESTS,   // 429
            StatusCode::BAD_GATEWAY,         // 502
            StatusCode::SERVICE_UNAVAILABLE, // 503
            StatusCode::GATEWAY_TIMEOUT,     // 504
        ];

        let mut retries = 0;

        let (status, body) = loop {
            let response = self
                .client
                .get(self.query_url.clone())
                .query(&[("query", query)])
                .send()
                .await?;

            let status = response.status();
            if RETRIABLE_STATUS_CODES.contains(&status) && retries < MAX_RETRIES {
                sleep(Duration::from_millis(BASE_DELAY * 2_u64.pow(retries))).await;
                retries += 1;
                continue;
            }

            break (status, response.bytes().await?);
        };

        // Prometheus reports rejected queries with a JSON body on 4xx/5xx.
        let parsed = match serde_json::from_slice::<QueryResponse>(&body) {
            Ok(parsed) => parsed,
            Err(_) if !status.is_success() => {
                return Err(QueryError::Status {
                    status,
                    body: String::from_utf8_lossy(&body).into_owned(),
                });
            }
            Err(e) => return Err(e.into()),
        };

        if parsed.status != "success" {
            return Err(QueryError::Api {
                error_type: parsed.error_type.unwrap_or_default(),
                error: parsed.error.unwrap_or_default(),
            });
        }

        let data = parsed
            .data
            .ok_or_else(|| QueryError::UnexpectedResultType("none".into()))?;
        if data.result_type != "vector" {
            return Err(QueryError::UnexpectedResultType(data.result_type));
        }

        Ok(serde_json::from_value(data.result)?)
    }
}

#[async_trait]
impl MetricsBackend for PrometheusClient {
    async fn top_cardinality(
        &self,
        selector: &str,
        label: &str,
        top_n: usize,
    ) -> Result<Vec<CardinalitySample>, QueryError> {
        let query = cardinality_query(selector, label, top_n);
        tracing::debug!(%query, "querying label cardinality");

        let mut samples = Vec::new();
        for sample in self.instant_query(&query).await? {
            let Some(metric_name) = sample.metric.get("__name__") else {
                tracing::warn!(label, "cardinality sample without a metric name, skipping");
                continue;
            };

            samples.push(CardinalitySample {
                metric_name: metric_name.clone(),
                label_name: label.to_string(),
                distinct_values: parse_count(&sample.value.1)?,
            });
        }

        Ok(samples)
    }
}

/// Counts distinct values of `label` per metric name and keeps the `top_n` largest.
pub fn cardinality_query(selector: &str, label: &str, top_n: usize) -> String {
    let selector = with_matcher(selector, &format!("{label}!=\"\""));
    format!("topk({top_n}, count by (__name__) (count by (__name__, {label}) ({selector})))")
}

fn with_matcher(selector: &str, matcher: &str) -> String {
    let selector = selector.trim();
    match selector.strip_suffix('}') {
        Some(head) if head.trim_end().ends_with('{') => format!("{head}{matcher}}}"),
        Some(head) => format!("{head}, {matcher}}}"),
        None => format!("{selector}{{{matcher}}}"),
    }
}

fn parse_count(raw: &str) -> Result<u64, QueryError> {
    match raw.parse::<f64>() {
        Ok(value) if value.is_finite() && value >= 0.0 => Ok(value as u64),
        _ => Err(QueryError::InvalidSample(raw.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SELECTOR: &str = r#"{__name__=~".+"}"#;

    fn client(server: &MockServer) -> PrometheusClient {
        let url = Url::parse(&server.uri()).unwrap();
        PrometheusClient::new(&url, Duration::from_secs(2)).unwrap()
    }

    #[test]
    fn test_cardinality_query() {
        assert_eq!(
            cardinality_query(SELECTOR, "user_id", 5),
            r#"topk(5, count by (__name__) (count by (__name__, user_id) ({__name__=~".+", user_id!=""})))"#
        );
    }

    #[test]
    fn test_with_matcher() {
        assert_eq!(with_matcher("{}", "a!=\"\""), "{a!=\"\"}");
        assert_eq!(with_matcher("http_requests_total", "a!=\"\""), "http_requests_total{a!=\"\"}");
        assert_eq!(
            with_matcher(r#"up{job="api"}"#, "a!=\"\""),
            r#"up{job="api", a!=""}"#
        );
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("150").unwrap(), 150);
        assert_eq!(parse_count("3e2").unwrap(), 300);
        assert!(parse_count("NaN").is_err());
        assert!(parse_count("-1").is_err());
        assert!(parse_count("many").is_err());
    }

    #[tokio::test]
    async fn test_top_cardinality() {
        let server = MockServer::start().await;

        let body = r#"{
            "status": "success",
            "data": {
                "resultType": "vector",
                "result": [
                    {"metric": {"__name__": "http_requests_total"}, "value": [1757030409.123, "150"]},
                    {"metric": {"__name__": "rpc_duration_seconds_count"}, "value": [1757030409.123, "12"]},
                    {"metric": {}, "value": [1757030409.123, "7"]}
                ]
            }
        }"#;

        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .and(query_param("query", cardinality_query(SELECTOR, "user_id", 5)))
            .respond_with(ResponseTemplate::new(200).set_body_string(body))
            .mount(&server)
            .await;

        let samples = client(&server)
            .top_cardinality(SELECTOR, "user_id", 5)
            .await
            .unwrap();

        assert_eq!(
            samples,
            vec![
                CardinalitySample {
                    metric_name: "http_requests_total".into(),
                    label_name: "user_id".into(),
                    distinct_values: 150,
                },
                CardinalitySample {
                    metric_name: "rpc_duration_seconds_count".into(),
                    label_name: "user_id".into(),
                    distinct_values: 12,
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_api_error() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"status":"error","errorType":"bad_data","error":"parse error at char 5"}"#,
            ))
            .mount(&server)
            .await;

        let result = client(&server).top_cardinality(SELECTOR, "user_id", 5).await;
        match result {
            Err(QueryError::Api { error_type, error }) => {
                assert_eq!(error_type, "bad_data");
                assert!(error.contains("parse error"));
            }
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unavailable_backend_retries_then_fails() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
            .expect(u64::from(MAX_RETRIES) + 1)
            .mount(&server)
            .await;

        let result = client(&server).top_cardinality(SELECTOR, "user_id", 5).await;
        assert!(matches!(
            result,
            Err(QueryError::Status { status: StatusCode::SERVICE_UNAVAILABLE, .. })
        ));
    }

    #[tokio::test]
    async fn test_unexpected_result_type() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api/v1/query"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"status":"success","data":{"resultType":"scalar","result":[1757030409.1,"3"]}}"#,
            ))
            .mount(&server)
            .await;

        let result = client(&server).top_cardinality(SELECTOR, "user_id", 5).await;
        assert!(matches!(result, Err(QueryError::UnexpectedResultType(t)) if t == "scalar"));
    }
}
