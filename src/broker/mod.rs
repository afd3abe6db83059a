// src/broker/mod.rs
//! Message broker abstraction
//!
//! The pipeline needs a small slice of AMQP: durable direct exchanges, durable
//! queues bound by routing key, persistent publishes, and explicit
//! acknowledge/reject on consume. [`Broker`] captures exactly that slice so the
//! producer and consumers never depend on a concrete client.
//!
//! - **AmqpBroker**: RabbitMQ via `lapin`
//! - **MemoryBroker**: in-process direct exchange with the same delivery rules
//! - **Topology**: exchange, queue and binding names, declared idempotently
//!
//! # Delivery flow
//!
//! ```text
//! publish(exchange, key) ──► exchange ──key──► queue ──► subscribe() stream
//!                                                          │
//!                                              Delivery::ack / reject
//! ```

pub mod amqp;
pub mod memory;
pub mod topology;

use crate::utils::errors::Result;
use async_trait::async_trait;
use futures::stream::BoxStream;
use std::fmt;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;
pub use topology::{QueueBinding, Topology};

/// Stream of deliveries from one queue subscription
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Broker operations used by the pipeline.
///
/// Declarations are durable and idempotent: repeating one with the same
/// parameters succeeds, so any process may set up the topology in any order.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short name for logs
    fn name(&self) -> &'static str;

    /// Declare a durable direct exchange: a message goes to the queues whose
    /// binding key equals its routing key
    async fn declare_exchange(&self, exchange: &str) -> Result<()>;

    async fn declare_queue(&self, queue: &str) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Publish a persistent message. Returns once the broker accepted the
    /// frame; consumer outcome is never observed.
    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()>;

    /// Start consuming `queue` with at most `prefetch` unacknowledged deliveries
    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream>;

    /// Close the connection; unacknowledged deliveries return to their queues
    async fn close(&self) -> Result<()>;
}

/// Settles one delivery with the broker
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// A received message awaiting acknowledgement
pub struct Delivery {
    pub delivery_tag: u64,
    pub body: Vec<u8>,
    pub redelivered: bool,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        delivery_tag: u64,
        body: Vec<u8>,
        redelivered: bool,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            delivery_tag,
            body,
            redelivered,
            acker,
        }
    }

    /// Acknowledge; the broker forgets the message
    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    /// Reject, optionally putting the message back on its queue
    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("delivery_tag", &self.delivery_tag)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .finish()
    }
}
