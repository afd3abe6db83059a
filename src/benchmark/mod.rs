// src/benchmark/mod.rs
//! Benchmark orchestrator
//!
//! Drives synthetic register + login traffic through the public entry point,
//! then snapshots the sink consumers' metrics and persists one result row.
//!
//! ```text
//! tick ──► batch of `vus` iterations (concurrent) ──► tally ──► sleep(tick)
//!   ▲                                                             │
//!   └───────────────────── until deadline ◄───────────────────────┘
//!                               │
//!            local snapshots + peer fetch ──► BenchmarkStore::insert
//! ```
//!
//! Batches are issued one after another, so at most `vus` iterations are in
//! flight at any time. Nothing is retried within a run.

pub mod client;
pub mod params;
pub mod store;

use crate::consumer::ConsumerMetrics;
use crate::event::RoutingTarget;
use crate::utils::config::BenchmarkConfig;
use crate::utils::errors::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, warn};

pub use client::{IterationOutcome, LoadClient};
pub use params::{BenchmarkParams, BenchmarkRequest};
pub use store::BenchmarkStore;

/// One sink's metrics at run end
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SinkSummary {
    pub processed: Option<u64>,
    pub errors: Option<u64>,
    pub throughput_per_sec: Option<f64>,
    pub last_db_write_ms: Option<f64>,
    pub error_rate: Option<f64>,
}

impl SinkSummary {
    /// Pick the known fields out of a metrics payload; missing ones stay empty
    pub fn from_raw(raw: &Value) -> Self {
        Self {
            processed: raw.get("processed").and_then(Value::as_u64),
            errors: raw.get("errors").and_then(Value::as_u64),
            throughput_per_sec: raw.get("throughputPerSec").and_then(Value::as_f64),
            last_db_write_ms: raw.get("lastDbWriteMs").and_then(Value::as_f64),
            error_rate: raw.get("errorRate").and_then(Value::as_f64),
        }
    }
}

/// Everything measured by one run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunMeasurement {
    pub run_label: String,
    pub duration_sec: u64,
    pub http_reqs: u64,
    pub http_req_duration_avg_ms: Option<f64>,
    pub http_req_duration_p95_ms: Option<f64>,
    /// Failed iterations over HTTP requests; absent when no iteration failed
    pub error_rate: Option<f64>,
    pub successful_registrations: u64,
    pub relational: Option<SinkSummary>,
    pub document: Option<SinkSummary>,
    pub raw_summary: Value,
    pub raw_relational_metrics: Option<Value>,
    pub raw_document_metrics: Option<Value>,
}

/// Persisted benchmark run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkResult {
    pub id: i64,
    pub run_at: DateTime<Utc>,
    #[serde(flatten)]
    pub measurement: RunMeasurement,
}

/// Running totals of the load phase
#[derive(Debug, Default)]
struct LoadTally {
    iterations: u64,
    http_reqs: u64,
    failed_iterations: u64,
    successful_registrations: u64,
    latencies_ms: Vec<f64>,
}

impl LoadTally {
    fn record(&mut self, outcome: IterationOutcome) {
        self.iterations += 1;
        self.http_reqs += 2;
        if outcome.failed() {
            self.failed_iterations += 1;
        }
        if outcome.registered {
            self.successful_registrations += 1;
        }
        self.latencies_ms.extend(outcome.latencies_ms);
    }

    fn error_rate(&self) -> Option<f64> {
        (self.failed_iterations > 0).then(|| self.failed_iterations as f64 / self.http_reqs as f64)
    }

    fn avg_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        Some(self.latencies_ms.iter().sum::<f64>() / self.latencies_ms.len() as f64)
    }

    /// Nearest-rank 95th percentile
    fn p95_ms(&self) -> Option<f64> {
        if self.latencies_ms.is_empty() {
            return None;
        }
        let mut sorted = self.latencies_ms.clone();
        sorted.sort_by(|a, b| a.total_cmp(b));
        let rank = ((sorted.len() as f64) * 0.95).ceil() as usize;
        Some(sorted[rank.saturating_sub(1).min(sorted.len() - 1)])
    }
}

/// Runs benchmarks and records their results
pub struct BenchmarkOrchestrator {
    client: LoadClient,
    store: Arc<BenchmarkStore>,
    local: BTreeMap<RoutingTarget, Arc<ConsumerMetrics>>,
    peers: BTreeMap<RoutingTarget, String>,
    tick: Duration,
    default_base_url: String,
}

impl BenchmarkOrchestrator {
    /// Orchestrator persisting into `store`, with no sink metrics attached yet
    pub fn new(store: Arc<BenchmarkStore>, config: &BenchmarkConfig) -> Self {
        Self {
            client: LoadClient::new(Duration::from_millis(config.request_timeout_ms)),
            store,
            local: BTreeMap::new(),
            peers: BTreeMap::new(),
            tick: Duration::from_millis(config.tick_ms),
            default_base_url: config.base_url.clone(),
        }
    }

    /// Metrics of a consumer running in this process
    pub fn with_local_metrics(mut self, target: RoutingTarget, metrics: Arc<ConsumerMetrics>) -> Self {
        self.local.insert(target, metrics);
        self
    }

    /// Metrics endpoint of a consumer running elsewhere
    pub fn with_peer_metrics(mut self, target: RoutingTarget, url: impl Into<String>) -> Self {
        self.peers.insert(target, url.into());
        self
    }

    pub fn store(&self) -> Arc<BenchmarkStore> {
        self.store.clone()
    }

    /// Validate a raw trigger body and run it
    pub async fn trigger(&self, request: BenchmarkRequest) -> Result<BenchmarkResult> {
        let params = request.into_params(&self.default_base_url)?;
        self.run(params).await
    }

    /// Apply load for the requested duration and persist the measurement.
    ///
    /// Only a failed final write fails the run; the load already applied is
    /// not undone.
    pub async fn run(&self, params: BenchmarkParams) -> Result<BenchmarkResult> {
        info!(
            "Benchmark {:?} starting: {}s, {} vus against {} (target {:?})",
            params.run_label, params.duration_sec, params.vus, params.base_url, params.routing_target
        );

        let started = Instant::now();
        let deadline = started + Duration::from_secs(params.duration_sec);
        let mut tally = LoadTally::default();

        while Instant::now() < deadline {
            let batch = (0..params.vus)
                .map(|_| self.client.run_iteration(&params.base_url, params.routing_target));
            for outcome in join_all(batch).await {
                tally.record(outcome);
            }
            tokio::time::sleep(self.tick).await;
        }

        let elapsed = started.elapsed();
        info!(
            "Benchmark {:?} load finished in {:.1}s: {} requests, {} failed iterations",
            params.run_label,
            elapsed.as_secs_f64(),
            tally.http_reqs,
            tally.failed_iterations
        );

        let raw_relational = self.sink_metrics(RoutingTarget::Relational).await;
        let raw_document = self.sink_metrics(RoutingTarget::Document).await;

        let measurement = RunMeasurement {
            run_label: params.run_label.clone(),
            duration_sec: params.duration_sec,
            http_reqs: tally.http_reqs,
            http_req_duration_avg_ms: tally.avg_ms(),
            http_req_duration_p95_ms: tally.p95_ms(),
            error_rate: tally.error_rate(),
            successful_registrations: tally.successful_registrations,
            relational: raw_relational.as_ref().map(SinkSummary::from_raw),
            document: raw_document.as_ref().map(SinkSummary::from_raw),
            raw_summary: json!({
                "base_url": params.base_url,
                "vus": params.vus,
                "routing_target": params.routing_target,
                "elapsed_ms": elapsed.as_millis() as u64,
                "iterations": tally.iterations,
                "http_reqs": tally.http_reqs,
                "failed_iterations": tally.failed_iterations,
            }),
            raw_relational_metrics: raw_relational,
            raw_document_metrics: raw_document,
        };

        match self.store.insert(&measurement).await {
            Ok(result) => {
                info!("Benchmark {:?} saved as {}", params.run_label, result.id);
                Ok(result)
            }
            Err(e) => {
                error!("Benchmark {:?} could not be saved: {}", params.run_label, e);
                Err(e)
            }
        }
    }

    /// Local snapshot if the consumer runs here, else the peer's payload;
    /// an unreachable peer yields `None`
    async fn sink_metrics(&self, target: RoutingTarget) -> Option<Value> {
        if let Some(metrics) = self.local.get(&target) {
            return serde_json::to_value(metrics.snapshot()).ok();
        }

        let url = self.peers.get(&target)?;
        match self.client.fetch_metrics(url).await {
            Ok(raw) => Some(raw),
            Err(e) => {
                warn!("{} metrics unavailable for benchmark: {}", target, e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tally_rates() {
        let mut tally = LoadTally::default();
        assert!(tally.error_rate().is_none());
        assert!(tally.p95_ms().is_none());

        tally.record(IterationOutcome {
            registered: true,
            logged_in: true,
            latencies_ms: vec![10.0, 20.0],
        });
        tally.record(IterationOutcome {
            registered: true,
            logged_in: false,
            latencies_ms: vec![30.0, 40.0],
        });
        tally.record(IterationOutcome::default());

        assert_eq!(tally.http_reqs, 6);
        assert_eq!(tally.failed_iterations, 2);
        assert_eq!(tally.successful_registrations, 2);
        assert_eq!(tally.error_rate(), Some(2.0 / 6.0));
        assert_eq!(tally.avg_ms(), Some(25.0));
        assert_eq!(tally.p95_ms(), Some(40.0));
    }

    #[test]
    fn test_error_rate_counts_iterations() {
        let mut clean = LoadTally::default();
        for _ in 0..4 {
            clean.record(IterationOutcome {
                registered: true,
                logged_in: true,
                latencies_ms: vec![1.0, 1.0],
            });
        }
        assert_eq!(clean.http_reqs, 8);
        assert!(clean.error_rate().is_none());

        let mut down = LoadTally::default();
        for _ in 0..10 {
            down.record(IterationOutcome::default());
        }
        assert_eq!(down.http_reqs, 20);
        assert_eq!(down.failed_iterations, 10);
        assert_eq!(down.error_rate(), Some(0.5));
    }

    #[test]
    fn test_p95_nearest_rank() {
        let mut tally = LoadTally::default();
        tally.latencies_ms = (1..=100).map(f64::from).collect();
        assert_eq!(tally.p95_ms(), Some(95.0));
    }

    #[test]
    fn test_summary_from_partial_payload() {
        let summary = SinkSummary::from_raw(&json!({"processed": 3, "errorRate": 0.0}));
        assert_eq!(summary.processed, Some(3));
        assert_eq!(summary.error_rate, Some(0.0));
        assert!(summary.errors.is_none());
        assert_eq!(SinkSummary::from_raw(&json!("oops")), SinkSummary::default());
    }

    #[tokio::test]
    async fn test_invalid_base_url_rejected_before_load() {
        let store = Arc::new(BenchmarkStore::open(":memory:").await.unwrap());
        let orchestrator = BenchmarkOrchestrator::new(store.clone(), &BenchmarkConfig::default());

        let request: BenchmarkRequest =
            serde_json::from_value(json!({"base_url": "http://string", "duration_sec": 5})).unwrap();
        let started = Instant::now();
        let result = orchestrator.trigger(request).await;

        assert!(matches!(result, Err(crate::utils::errors::PipelineError::Validation { .. })));
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(store.list(10, 0).await.unwrap().1, 0);
    }

    #[tokio::test]
    async fn test_unreachable_peer_metrics_are_absent() {
        let store = Arc::new(BenchmarkStore::open(":memory:").await.unwrap());
        let orchestrator = BenchmarkOrchestrator::new(store, &BenchmarkConfig::default())
            .with_local_metrics(RoutingTarget::Relational, Arc::new(ConsumerMetrics::new()))
            .with_peer_metrics(RoutingTarget::Document, "http://127.0.0.1:1/metrics");

        let local = orchestrator.sink_metrics(RoutingTarget::Relational).await.unwrap();
        assert_eq!(local["processed"], 0);
        assert!(orchestrator.sink_metrics(RoutingTarget::Document).await.is_none());
    }
}
