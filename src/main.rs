// src/main.rs
//! Audit Fan-out Service
//!
//! Runs one role of the audit pipeline (ingress, relational sink, document
//! sink) or all of them in one process, depending on configuration.

use anyhow::Result;
use audit_fanout::benchmark::{BenchmarkOrchestrator, BenchmarkStore};
use audit_fanout::consumer::{ConsumerMetrics, SinkConsumer};
use audit_fanout::event::RoutingTarget;
use audit_fanout::http::{AppState, HttpServer};
use audit_fanout::ingress::AuthTrigger;
use audit_fanout::observability::{init_metrics, init_tracing};
use audit_fanout::producer::{BrokerConnector, EventProducer};
use audit_fanout::sink::{AuditSink, DocumentSink, RelationalSink};
use audit_fanout::utils::config::{PipelineConfig, ServiceRole};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration
    let config = PipelineConfig::load()?;

    // Initialize observability (tracing, metrics)
    init_tracing(&config.logging)?;
    let prometheus = init_metrics()?;

    let role = config.service.role;
    info!(
        "Starting audit-fanout v{} as {:?}",
        audit_fanout::VERSION,
        role
    );

    // Producer and consumers each hold their own broker handle
    let connector = BrokerConnector::new(&config.broker);
    let topology = connector.topology();
    let mut handles = Vec::new();

    let shutdown = CancellationToken::new();
    let mut tasks: Vec<JoinHandle<()>> = Vec::new();
    let mut state = AppState::new(format!("audit-fanout-{:?}", role).to_lowercase())
        .with_prometheus(prometheus);

    let hosts_relational = matches!(role, ServiceRole::Relational | ServiceRole::Standalone);
    let hosts_document = matches!(role, ServiceRole::Document | ServiceRole::Standalone);
    let hosts_ingress = matches!(role, ServiceRole::Ingress | ServiceRole::Standalone);

    let mut relational = None;
    if hosts_relational {
        relational = Some(Arc::new(RelationalSink::open(&config.relational).await?));
    }

    let mut sinks: Vec<Arc<dyn AuditSink>> = Vec::new();
    if let Some(sink) = &relational {
        sinks.push(sink.clone());
    }
    if hosts_document {
        sinks.push(Arc::new(DocumentSink::connect(&config.document).await?));
    }

    let mut local_metrics = Vec::new();
    for sink in sinks {
        let metrics = Arc::new(ConsumerMetrics::new());
        local_metrics.push((sink.target(), metrics.clone()));
        state = state.with_consumer(sink.clone(), metrics.clone());

        let handle = connector.open().await;
        let Some(broker) = handle.broker() else {
            warn!("No broker connection; {} consumer not started", sink.target());
            continue;
        };

        handles.push(handle);

        let consumer = SinkConsumer::new(sink, metrics).with_max_in_flight(config.broker.max_in_flight);
        let subscribed = consumer
            .subscribe(&*broker, &topology, config.broker.prefetch)
            .await;
        match subscribed {
            Ok(deliveries) => {
                let token = shutdown.clone();
                tasks.push(tokio::spawn(async move {
                    consumer.run(deliveries, token).await;
                }));
            }
            Err(e) => error!("{} consumer setup failed: {}", consumer.target(), e),
        }
    }

    if let Some(sink) = &relational {
        let store = Arc::new(BenchmarkStore::with_connection(sink.connection()).await?);
        let mut orchestrator = BenchmarkOrchestrator::new(store, &config.benchmark);
        for (target, metrics) in &local_metrics {
            orchestrator = orchestrator.with_local_metrics(*target, metrics.clone());
        }
        if let Some(url) = &config.benchmark.peer_metrics_url {
            orchestrator = orchestrator.with_peer_metrics(RoutingTarget::Document, url.clone());
        }
        state = state.with_benchmark(Arc::new(orchestrator));
    }

    if hosts_ingress {
        let handle = connector.open().await;
        handles.push(handle.clone());
        let producer = EventProducer::new(handle);
        state = state.with_auth(Arc::new(AuthTrigger::new(producer)));
    }

    // Start HTTP server
    let listener = HttpServer::bind(&config.listen_addr()).await?;
    let server = HttpServer::new(state);
    let token = shutdown.clone();
    tasks.push(tokio::spawn(async move {
        if let Err(e) = server.serve(listener, token).await {
            error!("HTTP server error: {}", e);
        }
    }));

    // Graceful shutdown handler
    tokio::signal::ctrl_c().await?;
    info!("Received shutdown signal, cleaning up...");
    shutdown.cancel();

    for task in tasks {
        if let Err(e) = task.await {
            error!("Task failed during shutdown: {}", e);
        }
    }

    for handle in handles {
        if let Err(e) = handle.close().await {
            warn!("Broker close failed: {}", e);
        }
    }

    info!("Stopped gracefully");
    Ok(())
}
