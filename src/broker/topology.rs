// src/broker/topology.rs
//! Broker topology: one durable direct exchange, one durable queue per sink

use crate::broker::Broker;
use crate::event::RoutingTarget;
use crate::utils::config::BrokerConfig;
use crate::utils::errors::Result;
use tracing::info;

/// Queue and the routing key it is bound with
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueBinding {
    pub queue: String,
    pub routing_key: String,
}

impl QueueBinding {
    pub fn new(queue: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            queue: queue.into(),
            routing_key: routing_key.into(),
        }
    }
}

/// Names of every broker object the pipeline uses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topology {
    pub exchange: String,
    pub relational: QueueBinding,
    pub document: QueueBinding,
}

impl Topology {
    /// Names taken from the broker section of the config
    pub fn from_config(config: &BrokerConfig) -> Self {
        Self {
            exchange: config.exchange.clone(),
            relational: QueueBinding::new(&config.relational_queue, &config.relational_routing_key),
            document: QueueBinding::new(&config.document_queue, &config.document_routing_key),
        }
    }

    /// Queue and routing key serving `target`
    pub fn binding(&self, target: RoutingTarget) -> &QueueBinding {
        match target {
            RoutingTarget::Relational => &self.relational,
            RoutingTarget::Document => &self.document,
        }
    }

    /// Declare the exchange and both sink queues.
    ///
    /// The producer does this so that events published before a consumer
    /// first attaches are held in the queue instead of being unroutable.
    pub async fn declare_all(&self, broker: &dyn Broker) -> Result<()> {
        broker.declare_exchange(&self.exchange).await?;
        for target in RoutingTarget::ALL {
            self.declare_binding(broker, target).await?;
        }
        info!("Declared audit topology on exchange {}", self.exchange);
        Ok(())
    }

    /// Declare the exchange and the queue of one sink
    pub async fn declare_for(&self, broker: &dyn Broker, target: RoutingTarget) -> Result<()> {
        broker.declare_exchange(&self.exchange).await?;
        self.declare_binding(broker, target).await?;
        info!(
            "Declared {} queue {} on exchange {}",
            target,
            self.binding(target).queue,
            self.exchange
        );
        Ok(())
    }

    async fn declare_binding(&self, broker: &dyn Broker, target: RoutingTarget) -> Result<()> {
        let binding = self.binding(target);
        broker.declare_queue(&binding.queue).await?;
        broker
            .bind_queue(&binding.queue, &self.exchange, &binding.routing_key)
            .await
    }
}

impl Default for Topology {
    fn default() -> Self {
        Self::from_config(&BrokerConfig::default())
    }
}
