//! In-memory broker implementation.
//!
//! This module provides a pure in-process implementation of the domain-level
//! `Broker` trait. It is intended primarily for testing, local execution,
//! and as a reference for broker semantics.
//!
//! ## Reference Semantics
//!
//! - Exchanges route directly: a message with routing key `K` reaches every
//!   queue bound with binding key `K`. The default exchange `""` routes to
//!   the queue named `K`. Unroutable messages are dropped and counted.
//! - Messages wait in a queue until a consumer attaches. A queue's consumers
//!   receive messages round-robin.
//! - Delivery tags are per channel and start at 1. Acknowledging an unknown
//!   tag is an error (and is counted), as it is on a real broker.
//! - Closing a channel cancels its consumers, requeues its unacknowledged
//!   deliveries with `redelivered` set, deletes the exclusive queues it
//!   declared, and deletes auto-delete queues that lost their last consumer.
//!
//! ## Non-Goals
//!
//! - Persistence or durability (`durable` is recorded, not honored)
//! - Prefetch flow control (`set_prefetch` is recorded, not enforced)
//! - Network behavior beyond [`MemoryHub::sever_consumers_of`] and
//!   [`MemoryHub::set_accepting`]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::connection::lock_ignore_poison;
use crate::{
    // ---
    log_debug,
    log_warn,
    Broker,
    BrokerFactory,
    BrokerPtr,
    ConsumeOptions,
    ConsumerHandle,
    Delivery,
    ExchangeSpec,
    MessageProperties,
    OutboundMessage,
    QueueSpec,
    Result,
    RpcError,
};

/// Counters describing everything a hub has done since it was created.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct HubStats {
    /// Messages accepted by `publish`.
    pub published: u64,
    /// Messages that matched no queue.
    pub unroutable: u64,
    /// Deliveries handed to consumers (including redeliveries).
    pub delivered: u64,
    /// Successful acknowledgments.
    pub acked: u64,
    /// Acknowledgments for unknown delivery tags.
    pub ack_errors: u64,
    /// Unacknowledged deliveries returned to their queue by a channel close.
    pub requeued: u64,
}

/// A message waiting in a queue.
#[derive(Clone)]
struct Stored {
    exchange: String,
    routing_key: String,
    properties: MessageProperties,
    body: Bytes,
    redelivered: bool,
}

struct ConsumerSlot {
    tag: String,
    channel: u64,
    auto_ack: bool,
    tx: mpsc::UnboundedSender<Delivery>,
}

struct QueueState {
    spec: QueueSpec,
    /// Declaring channel of an exclusive queue.
    owner: Option<u64>,
    ready: VecDeque<Stored>,
    consumers: Vec<ConsumerSlot>,
    next_consumer: usize,
    /// Set once any consumer attached; auto-delete only applies afterwards.
    had_consumers: bool,
}

#[derive(Default)]
struct ChannelState {
    open: bool,
    next_tag: u64,
    prefetch: u16,
    unacked: HashMap<u64, (String, Stored)>,
}

#[derive(Default)]
struct HubState {
    accepting: bool,
    /// Exchange name → (binding key, queue name) pairs.
    exchanges: HashMap<String, Vec<(String, String)>>,
    queues: HashMap<String, QueueState>,
    channels: HashMap<u64, ChannelState>,
    stats: HubStats,
}

/// Shared message bus for the in-memory broker.
///
/// Simulates a broker within a single process. Every [`MemoryBroker`]
/// opened from the same hub sees the same exchanges and queues, exactly as
/// connections to a real broker would. Cheap to clone.
///
/// A hub is also a [`BrokerFactory`]; each `connect()` opens a new channel.
#[derive(Clone)]
pub struct MemoryHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    state: Mutex<HubState>,
    next_channel: AtomicU64,
    next_name: AtomicU64,
}

impl MemoryHub {
    // ---
    /// Create a new, empty hub that accepts connections.
    pub fn new() -> Self {
        // ---
        let state = HubState {
            accepting: true,
            ..HubState::default()
        };

        Self {
            inner: Arc::new(HubInner {
                state: Mutex::new(state),
                next_channel: AtomicU64::new(1),
                next_name: AtomicU64::new(1),
            }),
        }
    }

    /// Open a new channel on this hub.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Transport`] while the hub refuses connections.
    pub fn open(&self) -> Result<MemoryBroker> {
        // ---
        let mut state = self.lock();
        if !state.accepting {
            return Err(RpcError::transport("memory: connection refused"));
        }

        let id = self.inner.next_channel.fetch_add(1, Ordering::Relaxed);
        state.channels.insert(
            id,
            ChannelState {
                open: true,
                ..ChannelState::default()
            },
        );

        log_debug!("memory-{id}: channel opened");

        Ok(MemoryBroker {
            hub: self.clone(),
            channel: id,
            broker_id: format!("memory-{id}"),
        })
    }

    /// Make subsequent `open()`/`connect()` calls succeed or fail.
    pub fn set_accepting(&self, accepting: bool) {
        self.lock().accepting = accepting;
    }

    /// Close, as if the connection dropped, every channel that consumes `queue`.
    ///
    /// Returns the number of channels closed.
    pub fn sever_consumers_of(&self, queue: &str) -> usize {
        // ---
        let mut state = self.lock();

        let mut channels: Vec<u64> = state
            .queues
            .get(queue)
            .map(|q| q.consumers.iter().map(|c| c.channel).collect())
            .unwrap_or_default();
        channels.sort_unstable();
        channels.dedup();

        for channel in &channels {
            log_warn!("memory-{channel}: severed");
            close_channel(&mut state, *channel);
        }

        channels.len()
    }

    /// Snapshot of the hub counters.
    pub fn stats(&self) -> HubStats {
        self.lock().stats
    }

    /// Names of all currently declared queues, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        // ---
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether the named exchange has been declared.
    pub fn has_exchange(&self, name: &str) -> bool {
        self.lock().exchanges.contains_key(name)
    }

    /// Binding keys of `queue` on `exchange`.
    pub fn bindings(&self, exchange: &str, queue: &str) -> Vec<String> {
        // ---
        self.lock()
            .exchanges
            .get(exchange)
            .map(|b| b.iter().filter(|(_, q)| q == queue).map(|(k, _)| k.clone()).collect())
            .unwrap_or_default()
    }

    /// Messages waiting (not yet delivered) in `queue`.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    /// Deliveries currently awaiting acknowledgment, over all channels.
    pub fn unacked_count(&self) -> usize {
        self.lock().channels.values().map(|c| c.unacked.len()).sum()
    }

    /// Prefetch count last set on a channel consuming `queue`, if any.
    pub fn prefetch_of(&self, queue: &str) -> Option<u16> {
        // ---
        let state = self.lock();
        let channel = state.queues.get(queue)?.consumers.first()?.channel;
        state.channels.get(&channel).map(|c| c.prefetch)
    }

    fn lock(&self) -> MutexGuard<'_, HubState> {
        lock_ignore_poison(&self.inner.state)
    }

    fn generated_queue_name(&self) -> String {
        let n = self.inner.next_name.fetch_add(1, Ordering::Relaxed);
        format!("amq.gen-{n}-{}", uuid::Uuid::new_v4().simple())
    }
}

impl Default for MemoryHub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl BrokerFactory for MemoryHub {
    async fn connect(&self) -> Result<BrokerPtr> {
        Ok(Arc::new(self.open()?))
    }
}

/// One channel on a [`MemoryHub`].
pub struct MemoryBroker {
    hub: MemoryHub,
    channel: u64,
    broker_id: String,
}

impl MemoryBroker {
    /// Close this channel as if the connection dropped.
    pub fn sever(&self) {
        let mut state = self.hub.lock();
        close_channel(&mut state, self.channel);
    }

    fn ensure_open(&self, state: &HubState) -> Result<()> {
        // ---
        match state.channels.get(&self.channel) {
            Some(c) if c.open => Ok(()),
            _ => Err(RpcError::transport(format!("{}: channel closed", self.broker_id))),
        }
    }
}

#[async_trait::async_trait]
impl Broker for MemoryBroker {
    // ---
    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        // ---
        let mut state = self.hub.lock();
        self.ensure_open(&state)?;

        state.exchanges.entry(spec.name.clone()).or_default();
        log_debug!("{}: declared exchange {}", self.broker_id, spec.name);
        Ok(())
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        // ---
        let name = if spec.name.is_empty() {
            self.hub.generated_queue_name()
        } else {
            spec.name.clone()
        };

        let mut state = self.hub.lock();
        self.ensure_open(&state)?;

        if let Some(existing) = state.queues.get(&name) {
            if let Some(owner) = existing.owner {
                if owner != self.channel {
                    return Err(RpcError::transport(format!(
                        "RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"
                    )));
                }
            }
            return Ok(name);
        }

        let owner = spec.exclusive.then_some(self.channel);
        state.queues.insert(
            name.clone(),
            QueueState {
                spec: QueueSpec {
                    name: name.clone(),
                    ..spec.clone()
                },
                owner,
                ready: VecDeque::new(),
                consumers: Vec::new(),
                next_consumer: 0,
                had_consumers: false,
            },
        );

        log_debug!("{}: declared queue {name}", self.broker_id);
        Ok(name)
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        // ---
        let mut state = self.hub.lock();
        self.ensure_open(&state)?;

        if !state.queues.contains_key(queue) {
            return Err(RpcError::transport(format!("NOT_FOUND - no queue '{queue}'")));
        }

        let bindings = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| RpcError::transport(format!("NOT_FOUND - no exchange '{exchange}'")))?;

        let binding = (binding_key.to_string(), queue.to_string());
        if !bindings.contains(&binding) {
            bindings.push(binding);
        }
        Ok(())
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        // ---
        let mut state = self.hub.lock();
        self.ensure_open(&state)?;

        if let Some(channel) = state.channels.get_mut(&self.channel) {
            channel.prefetch = count;
        }
        Ok(())
    }

    async fn publish(&self, msg: OutboundMessage) -> Result<()> {
        // ---
        let mut state = self.hub.lock();
        self.ensure_open(&state)?;

        let targets: Vec<String> = if msg.exchange.is_empty() {
            state
                .queues
                .contains_key(&msg.routing_key)
                .then(|| msg.routing_key.clone())
                .into_iter()
                .collect()
        } else {
            let bindings = state.exchanges.get(&msg.exchange).ok_or_else(|| {
                RpcError::transport(format!("NOT_FOUND - no exchange '{}'", msg.exchange))
            })?;
            bindings
                .iter()
                .filter(|(key, _)| *key == msg.routing_key)
                .map(|(_, queue)| queue.clone())
                .collect()
        };

        state.stats.published += 1;
        if targets.is_empty() {
            state.stats.unroutable += 1;
            log_debug!(
                "{}: unroutable message {}/{}",
                self.broker_id,
                msg.exchange,
                msg.routing_key
            );
            return Ok(());
        }

        let stored = Stored {
            exchange: msg.exchange,
            routing_key: msg.routing_key,
            properties: msg.properties,
            body: msg.body,
            redelivered: false,
        };

        for queue in targets {
            if let Some(q) = state.queues.get_mut(&queue) {
                q.ready.push_back(stored.clone());
            }
            pump_queue(&mut state, &queue);
        }

        Ok(())
    }

    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<ConsumerHandle> {
        // ---
        let mut state = self.hub.lock();
        self.ensure_open(&state)?;

        let (tx, rx) = mpsc::unbounded_channel();
        let tag = format!("ctag-{}-{}", self.channel, uuid::Uuid::new_v4().simple());

        let q = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| RpcError::transport(format!("NOT_FOUND - no queue '{queue}'")))?;

        if opts.exclusive && !q.consumers.is_empty() {
            return Err(RpcError::transport(format!(
                "ACCESS_REFUSED - queue '{queue}' already has consumers"
            )));
        }

        q.had_consumers = true;
        q.consumers.push(ConsumerSlot {
            tag: tag.clone(),
            channel: self.channel,
            auto_ack: opts.auto_ack,
            tx,
        });

        pump_queue(&mut state, queue);

        log_debug!("{}: consuming {queue} as {tag}", self.broker_id);
        Ok(ConsumerHandle {
            consumer_tag: tag,
            inbox: rx,
        })
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        // ---
        let mut state = self.hub.lock();
        self.ensure_open(&state)?;

        let removed = state
            .channels
            .get_mut(&self.channel)
            .and_then(|c| c.unacked.remove(&delivery_tag));

        match removed {
            Some(_) => {
                state.stats.acked += 1;
                Ok(())
            }
            None => {
                state.stats.ack_errors += 1;
                Err(RpcError::transport(format!(
                    "PRECONDITION_FAILED - unknown delivery tag {delivery_tag}"
                )))
            }
        }
    }

    async fn close(&self) -> Result<()> {
        // ---
        let mut state = self.hub.lock();
        close_channel(&mut state, self.channel);
        Ok(())
    }
}

impl Drop for MemoryBroker {
    fn drop(&mut self) {
        let mut state = self.hub.lock();
        close_channel(&mut state, self.channel);
    }
}

/// Hand ready messages of `queue` to its consumers, round-robin.
fn pump_queue(state: &mut HubState, queue: &str) {
    // ---
    loop {
        let Some(q) = state.queues.get_mut(queue) else {
            return;
        };
        if q.consumers.is_empty() {
            return;
        }
        let Some(msg) = q.ready.pop_front() else {
            return;
        };

        let idx = q.next_consumer % q.consumers.len();
        q.next_consumer = idx + 1;

        let (channel, auto_ack, tx) = {
            let slot = &q.consumers[idx];
            (slot.channel, slot.auto_ack, slot.tx.clone())
        };

        let Some(chan) = state.channels.get_mut(&channel) else {
            continue;
        };
        chan.next_tag += 1;
        let delivery_tag = chan.next_tag;

        let delivery = Delivery {
            delivery_tag,
            exchange: msg.exchange.clone(),
            routing_key: msg.routing_key.clone(),
            redelivered: msg.redelivered,
            properties: msg.properties.clone(),
            body: msg.body.clone(),
        };

        if tx.send(delivery).is_err() {
            // Receiver dropped: forget that consumer and retry the message.
            if let Some(q) = state.queues.get_mut(queue) {
                q.consumers.remove(idx);
                q.ready.push_front(msg);
            }
            continue;
        }

        if !auto_ack {
            chan.unacked.insert(delivery_tag, (queue.to_string(), msg));
        }
        state.stats.delivered += 1;
    }
}

/// Cancel a channel's consumers, requeue its unacked deliveries, and drop
/// the queues that closing it deletes. Idempotent.
fn close_channel(state: &mut HubState, channel: u64) {
    // ---
    let Some(chan) = state.channels.get_mut(&channel) else {
        return;
    };
    if !chan.open {
        return;
    }
    chan.open = false;
    let mut unacked: Vec<(u64, (String, Stored))> = chan.unacked.drain().collect();

    for q in state.queues.values_mut() {
        q.consumers.retain(|c| c.channel != channel);
    }

    // Requeue at the front, preserving delivery order.
    unacked.sort_by_key(|(tag, _)| *tag);
    let mut touched = Vec::new();
    for (_, (queue, mut msg)) in unacked.into_iter().rev() {
        if let Some(q) = state.queues.get_mut(&queue) {
            msg.redelivered = true;
            q.ready.push_front(msg);
            state.stats.requeued += 1;
            touched.push(queue);
        }
    }

    let doomed: Vec<String> = state
        .queues
        .iter()
        .filter(|(_, q)| {
            q.owner == Some(channel) || (q.spec.auto_delete && q.had_consumers && q.consumers.is_empty())
        })
        .map(|(name, _)| name.clone())
        .collect();

    for name in &doomed {
        state.queues.remove(name);
        for bindings in state.exchanges.values_mut() {
            bindings.retain(|(_, q)| q != name);
        }
    }

    touched.sort();
    touched.dedup();
    for queue in touched {
        pump_queue(state, &queue);
    }

    log_debug!("memory-{channel}: channel closed");
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;

    fn msg(exchange: &str, key: &str, body: &'static [u8]) -> OutboundMessage {
        OutboundMessage {
            exchange: exchange.to_string(),
            routing_key: key.to_string(),
            properties: MessageProperties::default(),
            body: Bytes::from_static(body),
        }
    }

    fn durable_queue(name: &str) -> QueueSpec {
        QueueSpec {
            name: name.to_string(),
            durable: true,
            ..QueueSpec::default()
        }
    }

    async fn setup(hub: &MemoryHub, queue: &str) -> MemoryBroker {
        // ---
        let broker = hub.open().unwrap();
        broker
            .declare_exchange(&ExchangeSpec {
                name: "ex".into(),
                durable: false,
                auto_delete: false,
            })
            .await
            .unwrap();
        broker.declare_queue(&durable_queue(queue)).await.unwrap();
        broker.bind_queue(queue, "ex", queue).await.unwrap();
        broker
    }

    #[tokio::test]
    async fn test_direct_routing_and_buffering() {
        // ---
        let hub = MemoryHub::new();
        let broker = setup(&hub, "q").await;

        broker.publish(msg("ex", "q", b"one")).await.unwrap();
        broker.publish(msg("ex", "other", b"lost")).await.unwrap();
        assert_eq!(hub.queue_depth("q"), 1);

        let mut handle = broker.consume("q", ConsumeOptions::default()).await.unwrap();
        let d = handle.inbox.recv().await.unwrap();
        assert_eq!(&d.body[..], b"one");
        assert_eq!(d.delivery_tag, 1);
        assert!(!d.redelivered);

        let stats = hub.stats();
        assert_eq!(stats.published, 2);
        assert_eq!(stats.unroutable, 1);
        assert_eq!(stats.delivered, 1);
    }

    #[tokio::test]
    async fn test_default_exchange_routes_by_queue_name() {
        // ---
        let hub = MemoryHub::new();
        let broker = hub.open().unwrap();
        let name = broker.declare_queue(&QueueSpec::private()).await.unwrap();
        assert!(name.starts_with("amq.gen-"));

        let mut handle = broker
            .consume(&name, ConsumeOptions { auto_ack: true, exclusive: false })
            .await
            .unwrap();
        broker.publish(msg("", &name, b"hi")).await.unwrap();

        assert_eq!(&handle.inbox.recv().await.unwrap().body[..], b"hi");
        assert_eq!(hub.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_to_missing_exchange_fails() {
        // ---
        let hub = MemoryHub::new();
        let broker = hub.open().unwrap();
        let err = broker.publish(msg("nope", "q", b"x")).await.unwrap_err();
        assert!(matches!(err, RpcError::Transport(_)));
    }

    #[tokio::test]
    async fn test_ack_bookkeeping() {
        // ---
        let hub = MemoryHub::new();
        let broker = setup(&hub, "q").await;
        let mut handle = broker.consume("q", ConsumeOptions::default()).await.unwrap();

        broker.publish(msg("ex", "q", b"x")).await.unwrap();
        let d = handle.inbox.recv().await.unwrap();
        assert_eq!(hub.unacked_count(), 1);

        broker.ack(d.delivery_tag).await.unwrap();
        assert!(broker.ack(d.delivery_tag).await.is_err());

        let stats = hub.stats();
        assert_eq!(stats.acked, 1);
        assert_eq!(stats.ack_errors, 1);
        assert_eq!(hub.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_round_robin_between_consumers() {
        // ---
        let hub = MemoryHub::new();
        let a = setup(&hub, "q").await;
        let b = hub.open().unwrap();

        let opts = ConsumeOptions { auto_ack: true, exclusive: false };
        let mut ha = a.consume("q", opts.clone()).await.unwrap();
        let mut hb = b.consume("q", opts).await.unwrap();

        for _ in 0..4 {
            a.publish(msg("ex", "q", b"x")).await.unwrap();
        }

        let mut count_a = 0;
        while ha.inbox.try_recv().is_ok() {
            count_a += 1;
        }
        let mut count_b = 0;
        while hb.inbox.try_recv().is_ok() {
            count_b += 1;
        }
        assert_eq!((count_a, count_b), (2, 2));
    }

    #[tokio::test]
    async fn test_sever_requeues_unacked_as_redelivered() {
        // ---
        let hub = MemoryHub::new();
        let first = setup(&hub, "q").await;
        let mut handle = first.consume("q", ConsumeOptions::default()).await.unwrap();

        first.publish(msg("ex", "q", b"x")).await.unwrap();
        handle.inbox.recv().await.unwrap();

        assert_eq!(hub.sever_consumers_of("q"), 1);
        assert!(handle.inbox.recv().await.is_none());
        assert!(first.publish(msg("ex", "q", b"y")).await.is_err());
        assert_eq!(hub.stats().requeued, 1);

        let second = hub.open().unwrap();
        let mut handle = second.consume("q", ConsumeOptions::default()).await.unwrap();
        let d = handle.inbox.recv().await.unwrap();
        assert!(d.redelivered);
        assert_eq!(d.delivery_tag, 1);
    }

    #[tokio::test]
    async fn test_close_deletes_exclusive_and_auto_delete_queues() {
        // ---
        let hub = MemoryHub::new();
        let broker = hub.open().unwrap();

        let private = broker.declare_queue(&QueueSpec::private()).await.unwrap();
        let shared = QueueSpec {
            name: "shared".into(),
            auto_delete: true,
            ..QueueSpec::default()
        };
        broker.declare_queue(&shared).await.unwrap();
        let _handle = broker.consume("shared", ConsumeOptions::default()).await.unwrap();

        assert_eq!(hub.queue_names().len(), 2);
        broker.close().await.unwrap();
        assert!(hub.queue_names().is_empty(), "{private} should be gone");
    }

    #[tokio::test]
    async fn test_exclusive_queue_locked_to_owner() {
        // ---
        let hub = MemoryHub::new();
        let owner = hub.open().unwrap();
        let other = hub.open().unwrap();

        let spec = QueueSpec {
            name: "mine".into(),
            exclusive: true,
            ..QueueSpec::default()
        };
        owner.declare_queue(&spec).await.unwrap();
        assert!(other.declare_queue(&spec).await.is_err());
    }

    #[tokio::test]
    async fn test_refused_connections() {
        // ---
        let hub = MemoryHub::new();
        hub.set_accepting(false);
        assert!(hub.connect().await.is_err());

        hub.set_accepting(true);
        assert!(hub.connect().await.is_ok());
    }
}
