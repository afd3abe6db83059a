// src/lib.rs
//! Audit Fan-out Pipeline Library
//!
//! A producer publishes audit events to a durable direct exchange, which
//! fans each event out to two independently consumed queues: one drained
//! into a relational store, one into a document store. A benchmark harness
//! drives synthetic traffic through the whole chain and records one
//! measurement row per run.
//!
//! # Architecture
//!
//! - **event**: The audit-event envelope and routing targets
//! - **broker**: Broker abstraction, topology, AMQP and in-memory brokers
//! - **producer**: Publishing with graceful degradation when the broker is down
//! - **sink**: Relational (SQLite) and document (MongoDB) stores
//! - **consumer**: Per-sink consume loops and their metrics
//! - **benchmark**: Load generation and result persistence
//! - **ingress**: Auth entry point that triggers audit events
//! - **http**: HTTP server and routes
//! - **observability**: Tracing and Prometheus export
//! - **utils**: Configuration and errors
//!
//! ```text
//! ingress ──► EventProducer ──► audit.direct ──┬─► audit.relational ──► SinkConsumer ──► SQLite
//!                                              └─► audit.document   ──► SinkConsumer ──► MongoDB
//! ```

pub mod benchmark;
pub mod broker;
pub mod consumer;
pub mod event;
pub mod http;
pub mod ingress;
pub mod observability;
pub mod producer;
pub mod sink;
pub mod utils;

// Re-export commonly used types
pub use benchmark::{BenchmarkOrchestrator, BenchmarkResult, BenchmarkStore};
pub use broker::{AmqpBroker, Broker, MemoryBroker, Topology};
pub use consumer::{ConsumerMetrics, MetricsSnapshot, SinkConsumer};
pub use event::{AuditEvent, AuditRecord, RoutingTarget};
pub use producer::{BrokerHandle, EventProducer};
pub use utils::config::PipelineConfig;
pub use utils::errors::{PipelineError, Result};

// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
