// src/consumer/mod.rs
//! Sink consumers
//!
//! One long-lived loop per sink, bound to that sink's queue. The loops never
//! share state, so a sink whose store is down only fails its own messages.
//!
//! # Per-message state machine
//!
//! ```text
//! Received ──parse ok──► Parsed ──► WriteAttempted ──ok──► Acked
//!    │                                   │
//!    └──parse failed──► Rejected ◄───────┘ write failed
//! ```
//!
//! Rejection never requeues: a poison message is dropped and counted instead
//! of stalling the queue. Nothing is retried here.

pub mod metrics;

use crate::broker::{Broker, Delivery, DeliveryStream, Topology};
use crate::event::{AuditEvent, RoutingTarget};
use crate::sink::AuditSink;
use crate::utils::errors::{PipelineError, Result};
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use self::metrics::{Clock, ConsumerMetrics, ManualClock, MetricsSnapshot, SystemClock};

/// How a delivery was settled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    Acked,
    /// Dropped without requeue; carries the error kind
    Rejected(&'static str),
}

/// Consumer loop of one sink
pub struct SinkConsumer {
    sink: Arc<dyn AuditSink>,
    metrics: Arc<ConsumerMetrics>,
    max_in_flight: usize,
}

impl SinkConsumer {
    /// Consumer draining into `sink`, recording into `metrics`
    pub fn new(sink: Arc<dyn AuditSink>, metrics: Arc<ConsumerMetrics>) -> Self {
        Self {
            sink,
            metrics,
            max_in_flight: 1,
        }
    }

    /// Handle up to `n` deliveries concurrently
    pub fn with_max_in_flight(mut self, n: usize) -> Self {
        self.max_in_flight = n.max(1);
        self
    }

    pub fn target(&self) -> RoutingTarget {
        self.sink.target()
    }

    pub fn metrics(&self) -> Arc<ConsumerMetrics> {
        self.metrics.clone()
    }

    pub fn sink(&self) -> Arc<dyn AuditSink> {
        self.sink.clone()
    }

    /// Declare this sink's queue and start consuming it
    pub async fn subscribe(
        &self,
        broker: &dyn Broker,
        topology: &Topology,
        prefetch: u16,
    ) -> Result<DeliveryStream> {
        let target = self.target();
        topology.declare_for(broker, target).await?;
        broker
            .subscribe(&topology.binding(target).queue, prefetch)
            .await
    }

    /// Drain `deliveries` until the stream ends or `shutdown` fires
    pub async fn run(&self, deliveries: DeliveryStream, shutdown: CancellationToken) {
        let target = self.target();
        info!(
            "{} consumer started (max in flight {})",
            target, self.max_in_flight
        );

        deliveries
            .take_until(shutdown.cancelled_owned())
            .for_each_concurrent(self.max_in_flight, |delivery| async move {
                match delivery {
                    Ok(delivery) => {
                        self.handle(delivery).await;
                    }
                    Err(e) => warn!("{} consumer stream error: {}", target, e),
                }
            })
            .await;

        let snapshot = self.metrics.snapshot();
        info!(
            "{} consumer stopped (processed {}, errors {})",
            target, snapshot.processed, snapshot.errors
        );
    }

    /// Process one delivery through parse, write and settle
    pub async fn handle(&self, delivery: Delivery) -> MessageOutcome {
        let received = Instant::now();
        let target = self.target();

        let event = match AuditEvent::from_bytes(&delivery.body) {
            Ok(event) => event,
            Err(e) => {
                warn!("{} consumer dropping delivery {}: {}", target, delivery.delivery_tag, e);
                return self.reject(delivery, &e).await;
            }
        };

        let write_started = Instant::now();
        if let Err(e) = self.sink.write(&event).await {
            warn!("{} consumer failed to store {}: {}", target, event.action, e);
            return self.reject(delivery, &e).await;
        }
        let db_write_ms = write_started.elapsed().as_millis() as u64;

        let tag = delivery.delivery_tag;
        if let Err(e) = delivery.ack().await {
            warn!("{} consumer could not ack {}: {}", target, tag, e);
        }

        let process_ms = received.elapsed().as_millis() as u64;
        self.metrics.record_success(db_write_ms, process_ms);
        ::metrics::counter!("audit_consumer_processed_total", "sink" => target.as_str())
            .increment(1);
        ::metrics::histogram!("audit_consumer_db_write_ms", "sink" => target.as_str())
            .record(db_write_ms as f64);

        debug!(
            "{} consumer stored {} on {} in {}ms",
            target, event.action, event.entity, db_write_ms
        );
        MessageOutcome::Acked
    }

    async fn reject(&self, delivery: Delivery, cause: &PipelineError) -> MessageOutcome {
        let target = self.target();
        let kind = cause.kind();
        self.metrics.record_error();
        ::metrics::counter!(
            "audit_consumer_errors_total",
            "sink" => target.as_str(),
            "kind" => kind
        )
        .increment(1);

        let tag = delivery.delivery_tag;
        if let Err(e) = delivery.reject(false).await {
            warn!("{} consumer could not reject {}: {}", target, tag, e);
        }
        MessageOutcome::Rejected(kind)
    }
}
