// src/broker/memory.rs
//! In-process broker with AMQP delivery rules
//!
//! Used by tests and by the standalone role. It keeps the semantics the
//! pipeline relies on:
//!
//! - direct exchanges route by exact routing key, unroutable messages are dropped
//! - declarations are idempotent; re-declaring an exchange with another kind fails
//! - at most `prefetch` unacknowledged deliveries per subscription
//! - `reject(requeue = false)` discards, `reject(requeue = true)` returns the
//!   message to the head of its queue
//! - dropping a subscription (or closing the broker) returns its unacknowledged
//!   deliveries to the head of the queue, flagged as redelivered

use crate::broker::{Acknowledger, Broker, Delivery, DeliveryStream};
use crate::utils::errors::{PipelineError, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone)]
struct StoredMessage {
    body: Vec<u8>,
    redelivered: bool,
}

struct MemoryQueue {
    name: String,
    ready: Mutex<VecDeque<StoredMessage>>,
    unacked: Mutex<BTreeMap<u64, StoredMessage>>,
    notify: Notify,
    discarded: AtomicU64,
}

impl MemoryQueue {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ready: Mutex::new(VecDeque::new()),
            unacked: Mutex::new(BTreeMap::new()),
            notify: Notify::new(),
            discarded: AtomicU64::new(0),
        }
    }

    fn push(&self, message: StoredMessage) {
        self.ready.lock().push_back(message);
        self.notify.notify_waiters();
    }

    /// Move an unacknowledged message back to the head of the queue
    fn requeue(&self, tag: u64) -> bool {
        let message = self.unacked.lock().remove(&tag);
        match message {
            Some(mut message) => {
                message.redelivered = true;
                self.ready.lock().push_front(message);
                self.notify.notify_waiters();
                true
            }
            None => false,
        }
    }

    fn settle(&self, tag: u64) -> bool {
        let settled = self.unacked.lock().remove(&tag).is_some();
        if settled {
            self.notify.notify_waiters();
        }
        settled
    }
}

struct ExchangeState {
    /// (routing key, queue)
    bindings: Vec<(String, String)>,
}

/// In-memory broker
pub struct MemoryBroker {
    exchanges: DashMap<String, ExchangeState>,
    queues: DashMap<String, Arc<MemoryQueue>>,
    next_tag: Arc<AtomicU64>,
    unroutable: AtomicU64,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

impl MemoryBroker {
    /// Empty broker with no exchanges or queues
    pub fn new() -> Self {
        Self {
            exchanges: DashMap::new(),
            queues: DashMap::new(),
            next_tag: Arc::new(AtomicU64::new(1)),
            unroutable: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
        }
    }

    /// Messages waiting in `queue`, `None` if it was never declared
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|q| q.ready.lock().len())
    }

    /// Delivered but not yet settled messages of `queue`
    pub fn unacked_count(&self, queue: &str) -> Option<usize> {
        self.queues.get(queue).map(|q| q.unacked.lock().len())
    }

    /// Messages rejected without requeue from `queue`
    pub fn discarded_count(&self, queue: &str) -> Option<u64> {
        self.queues
            .get(queue)
            .map(|q| q.discarded.load(Ordering::Relaxed))
    }

    /// Bindings on `exchange`; `None` if it was never declared
    pub fn binding_count(&self, exchange: &str) -> Option<usize> {
        self.exchanges.get(exchange).map(|e| e.bindings.len())
    }

    /// Published messages that matched no binding
    pub fn unroutable_count(&self) -> u64 {
        self.unroutable.load(Ordering::Relaxed)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            Err(PipelineError::BrokerUnavailable("memory broker is closed".into()))
        } else {
            Ok(())
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn declare_exchange(&self, exchange: &str) -> Result<()> {
        self.ensure_open()?;
        self.exchanges
            .entry(exchange.to_string())
            .or_insert_with(|| ExchangeState {
                bindings: Vec::new(),
            });
        Ok(())
    }

    async fn declare_queue(&self, queue: &str) -> Result<()> {
        self.ensure_open()?;
        self.queues
            .entry(queue.to_string())
            .or_insert_with(|| Arc::new(MemoryQueue::new(queue)));
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.ensure_open()?;
        if !self.queues.contains_key(queue) {
            return Err(PipelineError::NotFound(format!("queue '{}'", queue)));
        }
        let mut state = self
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| PipelineError::NotFound(format!("exchange '{}'", exchange)))?;

        let binding = (routing_key.to_string(), queue.to_string());
        if !state.bindings.contains(&binding) {
            debug!("Binding {} to {} with key {}", queue, exchange, routing_key);
            state.bindings.push(binding);
        }
        Ok(())
    }

    async fn publish(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<()> {
        self.ensure_open()?;

        let targets: BTreeSet<String> = {
            let state = self.exchanges.get(exchange).ok_or_else(|| {
                PipelineError::PublishRejected(format!("no exchange '{}'", exchange))
            })?;
            state
                .bindings
                .iter()
                .filter(|(key, _)| key == routing_key)
                .map(|(_, queue)| queue.clone())
                .collect()
        };

        if targets.is_empty() {
            self.unroutable.fetch_add(1, Ordering::Relaxed);
            debug!("Dropped unroutable message on {} with key {}", exchange, routing_key);
            return Ok(());
        }

        for name in targets {
            if let Some(queue) = self.queues.get(&name) {
                queue.push(StoredMessage {
                    body: body.to_vec(),
                    redelivered: false,
                });
            }
        }
        Ok(())
    }

    async fn subscribe(&self, queue: &str, prefetch: u16) -> Result<DeliveryStream> {
        self.ensure_open()?;
        let queue = self
            .queues
            .get(queue)
            .map(|q| Arc::clone(q.value()))
            .ok_or_else(|| PipelineError::NotFound(format!("queue '{}'", queue)))?;

        info!("Subscribed to in-memory queue {}", queue.name);

        let subscription = Subscription {
            queue,
            inflight: Arc::new(Mutex::new(BTreeSet::new())),
            prefetch: prefetch as usize,
            next_tag: Arc::clone(&self.next_tag),
            shutdown: self.shutdown.clone(),
        };

        let stream = futures::stream::unfold(subscription, |mut sub| async move {
            let delivery = sub.next_delivery().await?;
            Some((Ok(delivery), sub))
        });
        Ok(stream.boxed())
    }

    async fn close(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            info!("Closing in-memory broker");
            self.shutdown.cancel();
        }
        Ok(())
    }
}

/// Consumer-side state of one subscription
struct Subscription {
    queue: Arc<MemoryQueue>,
    inflight: Arc<Mutex<BTreeSet<u64>>>,
    /// 0 = unlimited
    prefetch: usize,
    next_tag: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl Subscription {
    async fn next_delivery(&mut self) -> Option<Delivery> {
        loop {
            let notified = self.queue.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.shutdown.is_cancelled() {
                return None;
            }
            if let Some(delivery) = self.try_take() {
                return Some(delivery);
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return None,
                _ = &mut notified => {}
            }
        }
    }

    fn try_take(&self) -> Option<Delivery> {
        let mut inflight = self.inflight.lock();
        if self.prefetch > 0 && inflight.len() >= self.prefetch {
            return None;
        }

        let message = self.queue.ready.lock().pop_front()?;
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.queue.unacked.lock().insert(tag, message.clone());
        inflight.insert(tag);

        let acker = MemoryAcker {
            queue: Arc::clone(&self.queue),
            inflight: Arc::clone(&self.inflight),
            tag,
        };
        Some(Delivery::new(
            tag,
            message.body,
            message.redelivered,
            Box::new(acker),
        ))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let outstanding = std::mem::take(&mut *self.inflight.lock());
        if outstanding.is_empty() {
            return;
        }
        debug!(
            "Returning {} unacknowledged deliveries to {}",
            outstanding.len(),
            self.queue.name
        );
        for tag in outstanding.into_iter().rev() {
            self.queue.requeue(tag);
        }
    }
}

struct MemoryAcker {
    queue: Arc<MemoryQueue>,
    inflight: Arc<Mutex<BTreeSet<u64>>>,
    tag: u64,
}

impl MemoryAcker {
    fn unknown_tag(&self) -> PipelineError {
        PipelineError::BrokerUnavailable(format!(
            "unknown delivery tag {} on {}",
            self.tag, self.queue.name
        ))
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.inflight.lock().remove(&self.tag);
        if self.queue.settle(self.tag) {
            Ok(())
        } else {
            Err(self.unknown_tag())
        }
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.inflight.lock().remove(&self.tag);
        let settled = if requeue {
            self.queue.requeue(self.tag)
        } else {
            let settled = self.queue.settle(self.tag);
            if settled {
                self.queue.discarded.fetch_add(1, Ordering::Relaxed);
            }
            settled
        };
        if settled {
            Ok(())
        } else {
            Err(self.unknown_tag())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    async fn broker_with_queues() -> MemoryBroker {
        let broker = MemoryBroker::new();
        broker.declare_exchange("ex").await.unwrap();
        broker.declare_queue("a").await.unwrap();
        broker.declare_queue("b").await.unwrap();
        broker.bind_queue("a", "ex", "key.a").await.unwrap();
        broker.bind_queue("b", "ex", "key.b").await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_direct_routing() {
        let broker = broker_with_queues().await;

        broker.publish("ex", "key.a", b"one").await.unwrap();
        broker.publish("ex", "key.a", b"two").await.unwrap();
        broker.publish("ex", "key.b", b"three").await.unwrap();

        assert_eq!(broker.queue_depth("a"), Some(2));
        assert_eq!(broker.queue_depth("b"), Some(1));
    }

    #[tokio::test]
    async fn test_unroutable_is_dropped() {
        let broker = broker_with_queues().await;
        broker.publish("ex", "key.none", b"lost").await.unwrap();

        assert_eq!(broker.unroutable_count(), 1);
        assert_eq!(broker.queue_depth("a"), Some(0));
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        let broker = MemoryBroker::new();
        let result = broker.publish("nope", "k", b"x").await;
        assert!(matches!(result, Err(PipelineError::PublishRejected(_))));
    }

    #[tokio::test]
    async fn test_redeclare_keeps_bindings() {
        let broker = broker_with_queues().await;
        broker.declare_exchange("ex").await.unwrap();
        broker.declare_queue("a").await.unwrap();
        broker.bind_queue("a", "ex", "key.a").await.unwrap();

        assert_eq!(broker.binding_count("ex"), Some(2));
        broker.publish("ex", "key.a", b"one").await.unwrap();
        assert_eq!(broker.queue_depth("a"), Some(1));
    }

    #[tokio::test]
    async fn test_ack_settles() {
        let broker = broker_with_queues().await;
        broker.publish("ex", "key.a", b"hello").await.unwrap();

        let mut stream = broker.subscribe("a", 10).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        assert_eq!(delivery.body, b"hello");
        assert!(!delivery.redelivered);
        assert_eq!(broker.unacked_count("a"), Some(1));

        delivery.ack().await.unwrap();
        assert_eq!(broker.unacked_count("a"), Some(0));
        assert_eq!(broker.queue_depth("a"), Some(0));
    }

    #[tokio::test]
    async fn test_reject_without_requeue_discards() {
        let broker = broker_with_queues().await;
        broker.publish("ex", "key.a", b"poison").await.unwrap();

        let mut stream = broker.subscribe("a", 10).await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.reject(false).await.unwrap();

        assert_eq!(broker.queue_depth("a"), Some(0));
        assert_eq!(broker.discarded_count("a"), Some(1));
    }

    #[tokio::test]
    async fn test_reject_with_requeue_redelivers() {
        let broker = broker_with_queues().await;
        broker.publish("ex", "key.a", b"again").await.unwrap();

        let mut stream = broker.subscribe("a", 10).await.unwrap();
        let first = stream.next().await.unwrap().unwrap();
        first.reject(true).await.unwrap();

        let second = stream.next().await.unwrap().unwrap();
        assert_eq!(second.body, b"again");
        assert!(second.redelivered);
    }

    #[tokio::test]
    async fn test_dropped_subscription_returns_unacked() {
        let broker = broker_with_queues().await;
        broker.publish("ex", "key.a", b"m1").await.unwrap();
        broker.publish("ex", "key.a", b"m2").await.unwrap();

        {
            let mut stream = broker.subscribe("a", 10).await.unwrap();
            let _d1 = stream.next().await.unwrap().unwrap();
            let _d2 = stream.next().await.unwrap().unwrap();
            assert_eq!(broker.queue_depth("a"), Some(0));
        }

        assert_eq!(broker.queue_depth("a"), Some(2));
        let mut stream = broker.subscribe("a", 10).await.unwrap();
        let d1 = stream.next().await.unwrap().unwrap();
        assert_eq!(d1.body, b"m1");
        assert!(d1.redelivered);
    }

    #[tokio::test]
    async fn test_prefetch_limits_unacked() {
        let broker = broker_with_queues().await;
        broker.publish("ex", "key.a", b"m1").await.unwrap();
        broker.publish("ex", "key.a", b"m2").await.unwrap();

        let mut stream = broker.subscribe("a", 1).await.unwrap();
        let d1 = stream.next().await.unwrap().unwrap();

        let blocked = tokio::time::timeout(Duration::from_millis(50), stream.next()).await;
        assert!(blocked.is_err());

        d1.ack().await.unwrap();
        let d2 = stream.next().await.unwrap().unwrap();
        assert_eq!(d2.body, b"m2");
    }

    #[tokio::test]
    async fn test_close_ends_streams() {
        let broker = broker_with_queues().await;
        let mut stream = broker.subscribe("a", 10).await.unwrap();

        broker.close().await.unwrap();
        assert!(stream.next().await.is_none());
        assert!(broker.publish("ex", "key.a", b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_waiting_subscriber_wakes_on_publish() {
        let broker = Arc::new(broker_with_queues().await);
        let mut stream = broker.subscribe("b", 10).await.unwrap();

        let publisher = Arc::clone(&broker);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("ex", "key.b", b"late").await.unwrap();
        });

        let delivery = tokio::time::timeout(Duration::from_secs(2), stream.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(delivery.body, b"late");
    }
}
