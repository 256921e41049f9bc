// src/domain/broker.rs

//! Broker domain abstractions.
//!
//! This module defines the minimal set of broker primitives the RPC core
//! needs: declare an exchange, declare and bind queues, publish, consume,
//! acknowledge. It intentionally avoids any reference to a concrete broker
//! client library.
//!
//! The broker layer is responsible only for moving opaque message bodies
//! with their properties. Higher-level semantics such as correlation,
//! timeouts, handler dispatch, and reply routing are handled elsewhere.
//!
//! Concrete implementations of this interface live under `src/transport/`.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::Result;

/// Message headers. Values are plain strings on the wire.
pub type Headers = BTreeMap<String, String>;

/// Exchange declaration parameters. Exchanges are always direct-routing.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExchangeSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
}

/// Queue declaration parameters.
///
/// An empty `name` asks the broker to generate one; the generated name is
/// returned from [`Broker::declare_queue`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub auto_delete: bool,
    /// Broker-level exclusivity: only the declaring connection may use it.
    pub exclusive: bool,
}

impl QueueSpec {
    /// Spec for a broker-named, connection-private, auto-deleted queue.
    pub fn private() -> Self {
        Self {
            name: String::new(),
            durable: false,
            auto_delete: true,
            exclusive: true,
        }
    }
}

/// Options for [`Broker::consume`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged as soon as they are sent.
    pub auto_ack: bool,
    /// Ask the broker for exclusive consumer access to the queue.
    pub exclusive: bool,
}

/// Message properties relevant to RPC.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Correlation identifier linking a reply to its request.
    pub correlation_id: Option<Arc<str>>,

    /// Queue address where the reply should be published.
    ///
    /// Absent when the caller requested no result.
    pub reply_to: Option<Arc<str>>,

    /// String headers (`consumer_name` on requests, the error flag on replies).
    pub headers: Headers,

    /// MIME type of the body.
    pub content_type: Option<Arc<str>>,
}

impl MessageProperties {
    /// Look up a header value.
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// A message to publish.
#[derive(Clone, Debug)]
pub struct OutboundMessage {
    /// Target exchange (`""` is the default exchange, routing by queue name).
    pub exchange: String,
    /// Routing key matched against binding keys.
    pub routing_key: String,
    pub properties: MessageProperties,
    pub body: Bytes,
}

/// A message delivered to a consumer.
#[derive(Clone, Debug)]
pub struct Delivery {
    /// Broker-assigned handle used to acknowledge this delivery. Only
    /// meaningful on the channel that received it.
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    /// Set when the broker delivers the message again after a lost ack.
    pub redelivered: bool,
    pub properties: MessageProperties,
    pub body: Bytes,
}

/// Handle returned from a successful [`Broker::consume`].
///
/// The inbox closes when the consumer is cancelled or the connection
/// closes. A closed inbox without a deliberate shutdown is how the layers
/// above detect an unexpected connection close.
pub struct ConsumerHandle {
    /// Consumer tag assigned by the broker.
    pub consumer_tag: String,

    /// Receiver for deliveries on the consumed queue.
    pub inbox: mpsc::UnboundedReceiver<Delivery>,
}

/// One broker connection with one channel.
///
/// Implementations must be safe to share (`Send + Sync`), but callers on
/// the server side route every publish and ack through the connection's
/// [`Scheduler`](crate::Scheduler) so that channel side effects happen in
/// a single, ordered execution context.
///
/// # Notes
///
/// This trait uses `async_trait`; the expanded documentation may show
/// explicit lifetimes and a boxed `Future`. Treat methods as normal
/// `async fn`s.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    // ---
    /// Identifier for log lines.
    fn broker_id(&self) -> &str;

    /// Declare a direct exchange.
    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()>;

    /// Declare a queue and return its actual name.
    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String>;

    /// Bind `queue` to `exchange` under `binding_key`.
    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries in flight on this channel.
    async fn set_prefetch(&self, count: u16) -> Result<()>;

    /// Publish a message.
    async fn publish(&self, msg: OutboundMessage) -> Result<()>;

    /// Start consuming a queue.
    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<ConsumerHandle>;

    /// Acknowledge a delivery received on this channel.
    async fn ack(&self, delivery_tag: u64) -> Result<()>;

    /// Close the channel and connection. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// Shared broker pointer.
///
/// This is an `Arc<dyn Broker>`, which means:
/// - `.clone()` is cheap (only increments a reference count)
/// - Multiple clones share the same underlying connection
pub type BrokerPtr = Arc<dyn Broker>;

/// Opens broker connections.
///
/// Used once at startup and again for each reconnect attempt.
#[async_trait::async_trait]
pub trait BrokerFactory: Send + Sync {
    /// Open a new connection and channel.
    async fn connect(&self) -> Result<BrokerPtr>;
}

/// Shared broker factory pointer.
pub type BrokerFactoryPtr = Arc<dyn BrokerFactory>;
