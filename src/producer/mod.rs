// src/producer/mod.rs
//! Audit event producer
//!
//! The producing service must keep working when the audit pipeline is down,
//! so the broker handle is either `Connected` or `Disabled`, and publishing
//! through a disabled handle is a successful no-op.

use crate::broker::{AmqpBroker, Broker, MemoryBroker, Topology};
use crate::event::{resolve_targets, AuditEvent, RoutingTarget};
use crate::utils::config::{BrokerConfig, BrokerKind};
use crate::utils::errors::Result;
use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Request header carrying a per-event routing restriction
pub const ROUTING_HINT_HEADER: &str = "x-audit-target";

/// Broker connection as seen by the producer
#[derive(Clone)]
pub enum BrokerHandle {
    Connected {
        broker: Arc<dyn Broker>,
        topology: Topology,
    },
    Disabled,
}

impl BrokerHandle {
    /// Connect to the configured AMQP broker and declare the full topology.
    ///
    /// A missing URL or an unreachable broker yields `Disabled`.
    pub async fn establish(config: &BrokerConfig) -> Self {
        let Some(url) = config.url.as_deref() else {
            warn!("Broker URL not set; audit events will not be published");
            return BrokerHandle::Disabled;
        };

        let topology = Topology::from_config(config);
        let broker: Arc<dyn Broker> = match AmqpBroker::connect(url).await {
            Ok(broker) => Arc::new(broker),
            Err(e) => {
                warn!("Audit broker unreachable, publishing disabled: {}", e);
                return BrokerHandle::Disabled;
            }
        };

        Self::with_broker(broker, topology).await
    }

    /// Wrap an already-open broker, declaring the full topology on it
    pub async fn with_broker(broker: Arc<dyn Broker>, topology: Topology) -> Self {
        match topology.declare_all(broker.as_ref()).await {
            Ok(()) => {
                info!("Audit producer connected via {} broker", broker.name());
                BrokerHandle::Connected { broker, topology }
            }
            Err(e) => {
                warn!("Audit topology setup failed, publishing disabled: {}", e);
                BrokerHandle::Disabled
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, BrokerHandle::Connected { .. })
    }

    /// The connected broker, if any
    pub fn broker(&self) -> Option<Arc<dyn Broker>> {
        match self {
            BrokerHandle::Connected { broker, .. } => Some(broker.clone()),
            BrokerHandle::Disabled => None,
        }
    }

    /// Close the underlying broker, if any
    pub async fn close(&self) -> Result<()> {
        match self {
            BrokerHandle::Connected { broker, .. } => broker.close().await,
            BrokerHandle::Disabled => Ok(()),
        }
    }
}

/// Opens broker handles for the producer and each consumer of a process.
///
/// Every `open` over AMQP is a separate connection and channel. The in-memory
/// broker is one exchange per process, so its handles wrap the same instance.
pub struct BrokerConnector {
    config: BrokerConfig,
    memory: Option<Arc<MemoryBroker>>,
}

impl BrokerConnector {
    /// Connector for `config`; a memory broker is created up front
    pub fn new(config: &BrokerConfig) -> Self {
        let memory = match config.kind {
            BrokerKind::Memory => Some(Arc::new(MemoryBroker::new())),
            BrokerKind::Amqp => None,
        };
        Self {
            config: config.clone(),
            memory,
        }
    }

    pub fn topology(&self) -> Topology {
        Topology::from_config(&self.config)
    }

    /// A fresh handle; `Disabled` when the broker cannot be reached
    pub async fn open(&self) -> BrokerHandle {
        match &self.memory {
            Some(memory) => BrokerHandle::with_broker(memory.clone(), self.topology()).await,
            None => BrokerHandle::establish(&self.config).await,
        }
    }
}

/// Publishes audit events to the sink queues
#[derive(Clone)]
pub struct EventProducer {
    handle: BrokerHandle,
}

impl EventProducer {
    pub fn new(handle: BrokerHandle) -> Self {
        Self { handle }
    }

    /// Producer that drops every event
    pub fn disabled() -> Self {
        Self::new(BrokerHandle::Disabled)
    }

    pub fn handle(&self) -> &BrokerHandle {
        &self.handle
    }

    /// Publish `event` to the queues selected by `targets`.
    ///
    /// An empty `targets` broadcasts to every sink. The event timestamp is
    /// stamped here unless the caller already set one. Returns the sinks the
    /// event was handed to; a disabled producer hands it to none.
    pub async fn publish(
        &self,
        event: AuditEvent,
        targets: &[RoutingTarget],
    ) -> Result<Vec<RoutingTarget>> {
        let (broker, topology) = match &self.handle {
            BrokerHandle::Connected { broker, topology } => (broker, topology),
            BrokerHandle::Disabled => {
                metrics::counter!("audit_events_dropped_total").increment(1);
                return Ok(Vec::new());
            }
        };

        event.validate()?;
        let event = match event.timestamp {
            Some(_) => event,
            None => event.with_timestamp(Utc::now()),
        };
        let body = event.to_bytes()?;

        let resolved = resolve_targets(targets);
        for target in &resolved {
            let binding = topology.binding(*target);
            broker
                .publish(&topology.exchange, &binding.routing_key, &body)
                .await?;
            metrics::counter!(
                "audit_events_published_total",
                "routing_key" => binding.routing_key.clone()
            )
            .increment(1);
        }

        debug!(
            "Published {} on {} to {:?}",
            event.action, event.entity, resolved
        );
        Ok(resolved)
    }
}

/// Parse a routing-hint header value into a target restriction.
///
/// Values are comma separated; unknown values are ignored, so a hint with no
/// recognised target broadcasts.
pub fn targets_from_hint(value: Option<&str>) -> Vec<RoutingTarget> {
    let Some(value) = value else {
        return Vec::new();
    };

    value
        .split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .filter_map(|part| match part.parse::<RoutingTarget>() {
            Ok(target) => Some(target),
            Err(_) => {
                warn!("Ignoring unknown audit routing hint {:?}", part);
                None
            }
        })
        .collect()
}
