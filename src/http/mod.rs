// src/http/mod.rs
//! HTTP surface
//!
//! A plain hyper 1.x server. Which routes answer depends on what the process
//! hosts: sink consumers expose their metrics and health, the relational
//! process also hosts the benchmark endpoints, the ingress process hosts the
//! auth endpoints. The standalone role hosts all of them.
//!
//! | Route | Hosted by |
//! |---|---|
//! | `GET /`, `GET /health`, `GET /metrics/prometheus` | all |
//! | `GET /metrics`, `GET /metrics/{sink}` | sink consumers |
//! | `POST /benchmark-results/run`, `GET /benchmark-results[/{id}]` | orchestrator |
//! | `POST /auth/register-user`, `POST /auth/login` | ingress |

pub mod routes;

use crate::benchmark::BenchmarkOrchestrator;
use crate::consumer::ConsumerMetrics;
use crate::event::RoutingTarget;
use crate::ingress::AuthTrigger;
use crate::sink::AuditSink;
use crate::utils::errors::{PipelineError, Result};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use metrics_exporter_prometheus::PrometheusHandle;
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Everything the handlers can reach
pub struct AppState {
    /// Service name reported by `/` and `/health`
    pub service: String,
    pub metrics: BTreeMap<RoutingTarget, Arc<ConsumerMetrics>>,
    pub sinks: Vec<Arc<dyn AuditSink>>,
    pub auth: Option<Arc<AuthTrigger>>,
    pub benchmark: Option<Arc<BenchmarkOrchestrator>>,
    pub prometheus: Option<PrometheusHandle>,
}

impl AppState {
    /// State reporting `service` on the health route, with no optional routes wired
    pub fn new(service: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            metrics: BTreeMap::new(),
            sinks: Vec::new(),
            auth: None,
            benchmark: None,
            prometheus: None,
        }
    }

    /// Host a sink consumer's metrics and health
    pub fn with_consumer(mut self, sink: Arc<dyn AuditSink>, metrics: Arc<ConsumerMetrics>) -> Self {
        self.metrics.insert(sink.target(), metrics);
        self.sinks.push(sink);
        self
    }

    /// Serve `/auth/register-user` and `/auth/login`
    pub fn with_auth(mut self, auth: Arc<AuthTrigger>) -> Self {
        self.auth = Some(auth);
        self
    }

    /// Serve the benchmark trigger and results routes
    pub fn with_benchmark(mut self, benchmark: Arc<BenchmarkOrchestrator>) -> Self {
        self.benchmark = Some(benchmark);
        self
    }

    /// Render the Prometheus text format on `/metrics/prometheus`
    pub fn with_prometheus(mut self, handle: PrometheusHandle) -> Self {
        self.prometheus = Some(handle);
        self
    }
}

/// HTTP server over [`AppState`]
pub struct HttpServer {
    state: Arc<AppState>,
}

impl HttpServer {
    pub fn new(state: AppState) -> Self {
        Self {
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> Arc<AppState> {
        self.state.clone()
    }

    /// Bind the listen socket
    pub async fn bind(addr: &str) -> Result<TcpListener> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| PipelineError::Http(format!("Failed to bind {}: {}", addr, e)))?;
        Ok(listener)
    }

    /// Accept connections until `shutdown` fires
    pub async fn serve(&self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let local: SocketAddr = listener.local_addr()?;
        info!("{} listening on {}", self.state.service, local);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("HTTP server on {} stopping", local);
                    return Ok(());
                }
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        let state = Arc::clone(&self.state);

                        tokio::spawn(async move {
                            debug!("Accepted connection from {}", addr);

                            let io = TokioIo::new(stream);

                            let service = service_fn(move |req| {
                                let state = Arc::clone(&state);
                                async move { Ok::<_, Infallible>(routes::route(&state, req).await) }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!("Connection error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        error!("Failed to accept connection: {}", e);
                    }
                }
            }
        }
    }
}
