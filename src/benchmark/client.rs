// src/benchmark/client.rs
//! HTTP client for synthetic load and peer metrics

use crate::event::RoutingTarget;
use crate::producer::ROUTING_HINT_HEADER;
use crate::utils::errors::{PipelineError, Result};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::header::{ACCEPT, CONTENT_TYPE};
use hyper::{Method, Request, StatusCode};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::debug;

const BENCH_PASSWORD: &str = "BenchPass123!";

/// Result of one synthetic actor iteration (register, then login)
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IterationOutcome {
    pub registered: bool,
    /// Only attempted after a successful register
    pub logged_in: bool,
    /// Latency of every call that got a response
    pub latencies_ms: Vec<f64>,
}

impl IterationOutcome {
    /// An iteration fails when either call fails
    pub fn failed(&self) -> bool {
        !(self.registered && self.logged_in)
    }
}

/// Client used by the orchestrator
pub struct LoadClient {
    http: Client<HttpConnector, Full<Bytes>>,
    timeout: Duration,
}

impl LoadClient {
    /// Client whose requests give up after `timeout`
    pub fn new(timeout: Duration) -> Self {
        let http = Client::builder(TokioExecutor::new()).build_http();
        Self { http, timeout }
    }

    /// Register a fresh synthetic user, then log in as that user
    pub async fn run_iteration(
        &self,
        base_url: &str,
        target: Option<RoutingTarget>,
    ) -> IterationOutcome {
        let email = synthetic_email();
        let mut outcome = IterationOutcome::default();

        let register = json!({
            "email": email,
            "password": BENCH_PASSWORD,
            "firstname": "Benchmark",
            "lastname": "User",
            "phoneNumber": "1234567890",
        });
        match self
            .post_json(&format!("{}/auth/register-user", base_url), &register, target)
            .await
        {
            Ok((status, ms)) => {
                outcome.latencies_ms.push(ms);
                outcome.registered = status.is_success();
            }
            Err(e) => debug!("Register call failed: {}", e),
        }
        if !outcome.registered {
            return outcome;
        }

        let login = json!({ "email": email, "password": BENCH_PASSWORD });
        match self
            .post_json(&format!("{}/auth/login", base_url), &login, target)
            .await
        {
            Ok((status, ms)) => {
                outcome.latencies_ms.push(ms);
                outcome.logged_in = status.is_success();
            }
            Err(e) => debug!("Login call failed: {}", e),
        }

        outcome
    }

    /// GET a sink's metrics endpoint and return the payload verbatim
    pub async fn fetch_metrics(&self, url: &str) -> Result<Value> {
        let request = Request::builder()
            .method(Method::GET)
            .uri(url)
            .header(ACCEPT, "application/json")
            .body(Full::new(Bytes::new()))
            .map_err(|e| PipelineError::MetricsFetchFailure(format!("Request build error: {}", e)))?;

        let (status, body) = self
            .send(request)
            .await
            .map_err(|e| PipelineError::MetricsFetchFailure(e.to_string()))?;
        if !status.is_success() {
            return Err(PipelineError::MetricsFetchFailure(format!(
                "{} answered {}",
                url, status
            )));
        }

        serde_json::from_slice(&body)
            .map_err(|e| PipelineError::MetricsFetchFailure(format!("Invalid metrics body: {}", e)))
    }

    async fn post_json(
        &self,
        url: &str,
        body: &Value,
        target: Option<RoutingTarget>,
    ) -> Result<(StatusCode, f64)> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(url)
            .header(CONTENT_TYPE, "application/json");
        if let Some(target) = target {
            builder = builder.header(ROUTING_HINT_HEADER, target.as_str());
        }
        let request = builder
            .body(Full::new(Bytes::from(body.to_string())))
            .map_err(|e| PipelineError::Http(format!("Request build error: {}", e)))?;

        let started = Instant::now();
        let (status, _) = self.send(request).await?;
        Ok((status, started.elapsed().as_secs_f64() * 1000.0))
    }

    async fn send(&self, request: Request<Full<Bytes>>) -> Result<(StatusCode, Bytes)> {
        let exchange = async {
            let response = self
                .http
                .request(request)
                .await
                .map_err(|e| PipelineError::Http(format!("Request failed: {}", e)))?;
            let status = response.status();
            let body = response
                .into_body()
                .collect()
                .await
                .map_err(|e| PipelineError::Http(format!("Response body error: {}", e)))?
                .to_bytes();
            Ok::<_, PipelineError>((status, body))
        };

        tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| PipelineError::Http(format!("Timed out after {:?}", self.timeout)))?
    }
}

/// Unique address on the benchmark domain
fn synthetic_email() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect();
    format!(
        "u{}-{}@bench.local",
        chrono::Utc::now().timestamp_millis(),
        suffix
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_iteration_failure() {
        let mut outcome = IterationOutcome::default();
        assert!(outcome.failed());
        outcome.registered = true;
        assert!(outcome.failed());
        outcome.logged_in = true;
        assert!(!outcome.failed());
    }

    #[test]
    fn test_synthetic_emails_differ() {
        let a = synthetic_email();
        let b = synthetic_email();
        assert!(a.ends_with("@bench.local"));
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_unreachable_target_fails_iteration() {
        let client = LoadClient::new(Duration::from_secs(2));
        let outcome = client.run_iteration("http://127.0.0.1:1", None).await;
        assert!(!outcome.registered);
        assert!(outcome.latencies_ms.is_empty());
    }

    #[tokio::test]
    async fn test_fetch_metrics_failure() {
        let client = LoadClient::new(Duration::from_secs(2));
        let result = client.fetch_metrics("http://127.0.0.1:1/metrics").await;
        assert!(matches!(result, Err(PipelineError::MetricsFetchFailure(_))));
    }
}
