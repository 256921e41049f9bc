// src/client/mod.rs
//! RPC client implementation.
//!
//! This module contains the [`RpcClient`] type which publishes call requests
//! to the exchange and waits for the matching replies.
//!
//! # Architecture
//!
//! The client owns one blocking-mode connection. The first call that wants
//! a result declares a broker-named, exclusive, auto-delete reply queue,
//! binds it to the exchange under its own name and consumes it with
//! automatic acknowledgement. Every request that wants a result carries
//! that name in `reply_to` and a fresh correlation id.
//!
//! Waiting is a poll loop: drain the reply inbox, file each reply under its
//! correlation id, check the caller's own entry, sleep for the configured
//! poll interval. Replies for ids nobody waits on (late replies after a
//! timeout, stray messages) are dropped.
//!
//! # Concurrency
//!
//! Multiple calls can be in flight at once from clones of the same client.
//! Whichever caller drains the inbox files replies for all of them.

mod pending;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex, OnceCell};

use crate::codec::CodecSet;
use crate::connection::lock_ignore_poison;
use crate::protocol::{request_message, ErrorFlag, HEADER_ERROR_FLAG};
use crate::{
    // ---
    log_debug,
    log_info,
    log_warn,
    BrokerFactoryPtr,
    BrokerPtr,
    CallArgs,
    ConnectionMode,
    ConsumeOptions,
    Connector,
    CorrelationId,
    Delivery,
    QueueSpec,
    Result,
    RpcConfig,
    RpcError,
};

use pending::{PendingCalls, PollState};

/// A call timeout as callers like to write it.
///
/// Seconds as a number, a [`Duration`], or a string holding a number of
/// seconds. Validated when the call starts, before anything is published.
#[derive(Debug, Clone, PartialEq)]
pub enum TimeoutSpec {
    Seconds(f64),
    Duration(Duration),
    Text(String),
}

impl TimeoutSpec {
    /// Convert to a duration, rejecting negative, non-finite or unparsable
    /// values.
    pub fn resolve(&self) -> Result<Duration> {
        // ---
        let seconds = match self {
            Self::Duration(d) => return Ok(*d),
            Self::Seconds(s) => *s,
            Self::Text(text) => text
                .trim()
                .parse::<f64>()
                .map_err(|_| RpcError::config(format!("invalid timeout '{text}'")))?,
        };

        if !seconds.is_finite() || seconds < 0.0 {
            return Err(RpcError::config(format!("invalid timeout {seconds}")));
        }
        Duration::try_from_secs_f64(seconds)
            .map_err(|e| RpcError::config(format!("invalid timeout {seconds}: {e}")))
    }

    /// The instant a call started at `now` gives up, rejecting timeouts
    /// too far out to represent.
    fn deadline_from(timeout: Duration, now: Instant) -> Result<Instant> {
        // ---
        now.checked_add(timeout)
            .ok_or_else(|| RpcError::config(format!("timeout {timeout:?} is out of range")))
    }
}

impl From<f64> for TimeoutSpec {
    fn from(value: f64) -> Self {
        Self::Seconds(value)
    }
}

impl From<u64> for TimeoutSpec {
    fn from(value: u64) -> Self {
        Self::Duration(Duration::from_secs(value))
    }
}

impl From<Duration> for TimeoutSpec {
    fn from(value: Duration) -> Self {
        Self::Duration(value)
    }
}

impl From<&str> for TimeoutSpec {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for TimeoutSpec {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

/// Per-call options. The defaults wait forever for a result on the
/// configured exchange and routing key.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    /// Publish without `reply_to` and return `Value::Null` immediately.
    pub ignore_result: bool,
    /// Overrides [`RpcConfig::exchange`].
    pub exchange: Option<String>,
    /// Overrides [`RpcConfig::routing_key`].
    pub routing_key: Option<String>,
    /// `None` waits forever.
    pub timeout: Option<TimeoutSpec>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ignore_result(mut self, ignore: bool) -> Self {
        self.ignore_result = ignore;
        self
    }

    pub fn with_exchange(mut self, exchange: impl Into<String>) -> Self {
        self.exchange = Some(exchange.into());
        self
    }

    pub fn with_routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.routing_key = Some(routing_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: impl Into<TimeoutSpec>) -> Self {
        self.timeout = Some(timeout.into());
        self
    }
}

struct ReplyQueue {
    name: String,
    inbox: Mutex<mpsc::UnboundedReceiver<Delivery>>,
}

/// Running RPC client instance.
///
/// Cheap to clone (internally `Arc`-backed).
#[derive(Clone)]
pub struct RpcClient {
    inner: Arc<Inner>,
}

struct Inner {
    // ---
    config: RpcConfig,
    broker: BrokerPtr,
    connector: AsyncMutex<Connector>,
    codecs: CodecSet,
    reply: OnceCell<ReplyQueue>,
    pending: Mutex<PendingCalls>,
}

impl RpcClient {
    // ---
    /// Connect using the broker named by `config.broker_uri`.
    pub async fn connect(config: RpcConfig) -> Result<Self> {
        // ---
        let factory = crate::create_broker_factory(&config)?;
        Self::with_factory(factory, config).await
    }

    /// Connect through an explicit broker factory.
    ///
    /// The client always runs its connection in blocking mode, whatever
    /// `config.mode` says.
    pub async fn with_factory(factory: BrokerFactoryPtr, config: RpcConfig) -> Result<Self> {
        // ---
        let config = config.with_mode(ConnectionMode::Blocking);
        let connector = Connector::new(factory, config.clone());
        let broker = connector.connect().await?;

        log_info!(
            "[{}] client ready on exchange '{}'",
            config.connection_name,
            config.exchange
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                broker,
                connector: AsyncMutex::new(connector),
                codecs: CodecSet::default(),
                reply: OnceCell::new(),
                pending: Mutex::new(PendingCalls::new()),
            }),
        })
    }

    /// Use `codecs` to decode replies whose content type names one of them.
    pub fn with_codecs(self, codecs: CodecSet) -> Self {
        // ---
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                inner.codecs = codecs;
                Self {
                    inner: Arc::new(inner),
                }
            }
            Err(inner) => Self { inner },
        }
    }

    pub fn config(&self) -> &RpcConfig {
        &self.inner.config
    }

    /// Name of the reply queue, once the first result-bearing call made it.
    pub fn reply_queue_name(&self) -> Option<&str> {
        self.inner.reply.get().map(|q| q.name.as_str())
    }

    /// Number of calls currently waiting for a reply.
    pub fn pending_count(&self) -> usize {
        lock_ignore_poison(&self.inner.pending).len()
    }

    /// Start building a call to `name`.
    pub fn function(&self, name: impl Into<String>) -> RemoteFunction<'_> {
        RemoteFunction {
            client: self,
            name: name.into(),
            args: CallArgs::new(),
            options: CallOptions::new(),
        }
    }

    /// Call remote function `function` and wait for its result.
    ///
    /// # Errors
    ///
    /// - [`RpcError::Configuration`] for an invalid or unrepresentable timeout
    ///   (nothing is sent)
    /// - [`RpcError::Timeout`] when no reply arrives in time
    /// - [`RpcError::RemoteFunction`] when the remote side reports an error
    /// - [`RpcError::ConnectionLost`] when the reply inbox closes
    pub async fn call(&self, function: &str, args: CallArgs, options: CallOptions) -> Result<Value> {
        // ---
        let deadline = match options.timeout.as_ref() {
            Some(spec) => Some(TimeoutSpec::deadline_from(spec.resolve()?, Instant::now())?),
            None => None,
        };

        let config = &self.inner.config;
        let exchange = options.exchange.as_deref().unwrap_or(&config.exchange);
        let routing_key = options.routing_key.as_deref().unwrap_or(&config.routing_key);
        let correlation_id = CorrelationId::generate();

        if options.ignore_result {
            let msg = request_message(
                exchange,
                routing_key,
                function,
                &args,
                config.codec.as_ref(),
                &correlation_id,
                None,
            )?;
            self.inner.broker.publish(msg).await?;
            log_debug!("[{}] sent '{function}' without reply", config.connection_name);
            return Ok(Value::Null);
        }

        let reply = self.reply_queue().await?;
        let msg = request_message(
            exchange,
            routing_key,
            function,
            &args,
            config.codec.as_ref(),
            &correlation_id,
            Some(&reply.name),
        )?;

        // Registered before publishing so a fast reply finds its slot. The
        // guard drops the entry however this future ends, cancellation included.
        lock_ignore_poison(&self.inner.pending).register(correlation_id.clone(), deadline);
        let _registered = PendingGuard {
            pending: &self.inner.pending,
            id: &correlation_id,
        };

        self.inner.broker.publish(msg).await?;
        log_debug!(
            "[{}] sent '{function}' correlation_id={correlation_id}",
            config.connection_name
        );

        let delivery = self.wait_for(reply, &correlation_id, function).await?;
        self.decode_reply(&delivery)
    }

    async fn wait_for(
        &self,
        reply: &ReplyQueue,
        correlation_id: &CorrelationId,
        function: &str,
    ) -> Result<Delivery> {
        // ---
        loop {
            self.pump(reply)?;

            let now = Instant::now();
            let state = lock_ignore_poison(&self.inner.pending).poll(correlation_id, now);
            match state {
                PollState::Ready(delivery) => return Ok(delivery),
                PollState::Expired => {
                    log_warn!(
                        "[{}] '{function}' timed out (correlation_id={correlation_id})",
                        self.inner.config.connection_name
                    );
                    return Err(RpcError::Timeout {
                        function: function.to_string(),
                    });
                }
                PollState::Unknown => return Err(RpcError::ConnectionLost),
                PollState::Waiting => {}
            }

            tokio::time::sleep(self.inner.config.poll_interval).await;
        }
    }

    /// Move everything sitting in the reply inbox into the pending table.
    fn pump(&self, reply: &ReplyQueue) -> Result<()> {
        // ---
        let mut inbox = lock_ignore_poison(&reply.inbox);
        loop {
            match inbox.try_recv() {
                Ok(delivery) => {
                    let Some(id) = delivery.properties.correlation_id.clone() else {
                        log_debug!("reply without correlation_id dropped");
                        continue;
                    };
                    let filed = lock_ignore_poison(&self.inner.pending).file(&id, delivery);
                    if !filed {
                        log_debug!("reply for unknown correlation_id={id} dropped");
                    }
                }
                Err(mpsc::error::TryRecvError::Empty) => return Ok(()),
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    return Err(RpcError::ConnectionLost)
                }
            }
        }
    }

    fn decode_reply(&self, delivery: &Delivery) -> Result<Value> {
        // ---
        let props = &delivery.properties;
        let codec = props
            .content_type
            .as_deref()
            .and_then(|ct| self.inner.codecs.by_content_type(ct))
            .unwrap_or(&self.inner.config.codec);

        let value = codec.decode(&delivery.body)?;

        if ErrorFlag::from_header(props.header(HEADER_ERROR_FLAG)).is_error() {
            let message = match value {
                Value::String(s) => s,
                other => other.to_string(),
            };
            return Err(RpcError::RemoteFunction(message));
        }
        Ok(value)
    }

    async fn reply_queue(&self) -> Result<&ReplyQueue> {
        // ---
        self.inner
            .reply
            .get_or_try_init(|| async {
                let broker = &self.inner.broker;
                let exchange = &self.inner.config.exchange;

                let name = broker.declare_queue(&QueueSpec::private()).await?;
                broker.bind_queue(&name, exchange, &name).await?;

                let opts = ConsumeOptions {
                    auto_ack: true,
                    exclusive: false,
                };
                let consumer = broker.consume(&name, opts).await?;

                log_debug!(
                    "[{}] reply queue '{name}' bound to '{exchange}'",
                    self.inner.config.connection_name
                );
                Ok(ReplyQueue {
                    name,
                    inbox: Mutex::new(consumer.inbox),
                })
            })
            .await
    }

    /// Close the connection. Calls still waiting fail with
    /// [`RpcError::ConnectionLost`].
    pub async fn close(&self) -> Result<()> {
        // ---
        self.inner.connector.lock().await.close().await
    }
}

/// A call under construction, from [`RpcClient::function`].
pub struct RemoteFunction<'a> {
    client: &'a RpcClient,
    name: String,
    args: CallArgs,
    options: CallOptions,
}

impl RemoteFunction<'_> {
    // ---
    /// Append a positional argument.
    pub fn arg(mut self, value: impl Into<Value>) -> Self {
        self.args = self.args.arg(value);
        self
    }

    /// Set a named argument.
    pub fn kwarg(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.args = self.args.kwarg(name, value);
        self
    }

    /// Replace all arguments.
    pub fn args(mut self, args: CallArgs) -> Self {
        self.args = args;
        self
    }

    pub fn timeout(mut self, timeout: impl Into<TimeoutSpec>) -> Self {
        self.options.timeout = Some(timeout.into());
        self
    }

    pub fn ignore_result(mut self) -> Self {
        self.options.ignore_result = true;
        self
    }

    pub fn exchange(mut self, exchange: impl Into<String>) -> Self {
        self.options.exchange = Some(exchange.into());
        self
    }

    pub fn routing_key(mut self, routing_key: impl Into<String>) -> Self {
        self.options.routing_key = Some(routing_key.into());
        self
    }

    /// Send the call and wait for the raw result.
    pub async fn invoke(self) -> Result<Value> {
        self.client.call(&self.name, self.args, self.options).await
    }

    /// Send the call and convert the result.
    pub async fn invoke_as<T: DeserializeOwned>(self) -> Result<T> {
        // ---
        let value = self.invoke().await?;
        Ok(serde_json::from_value(value)?)
    }
}

/// Removes a registered call from the pending table when dropped.
struct PendingGuard<'a> {
    pending: &'a Mutex<PendingCalls>,
    id: &'a CorrelationId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        lock_ignore_poison(self.pending).remove(self.id);
    }
}

#[cfg(test)]
mod tests {
    // ---
    use super::*;
    use crate::codec::JsonCodec;
    use crate::protocol::reply_message;
    use crate::{Broker, MemoryHub};
    use serde_json::json;

    async fn client_on(hub: &MemoryHub) -> RpcClient {
        let config = RpcConfig::memory().with_poll_interval(Duration::from_millis(2));
        RpcClient::with_factory(Arc::new(hub.clone()), config)
            .await
            .unwrap()
    }

    #[test]
    fn test_timeout_spec_resolve() {
        // ---
        assert_eq!(TimeoutSpec::from(0.5).resolve().unwrap(), Duration::from_millis(500));
        assert_eq!(TimeoutSpec::from("2").resolve().unwrap(), Duration::from_secs(2));
        assert_eq!(TimeoutSpec::from(3u64).resolve().unwrap(), Duration::from_secs(3));
        assert!(matches!(
            TimeoutSpec::from("soon").resolve(),
            Err(RpcError::Configuration(_))
        ));
        assert!(TimeoutSpec::from(-1.0).resolve().is_err());
        assert!(TimeoutSpec::from(f64::NAN).resolve().is_err());
    }

    #[test]
    fn test_huge_timeout_is_a_configuration_error() {
        // ---
        assert!(matches!(
            TimeoutSpec::from(1e300).resolve(),
            Err(RpcError::Configuration(_))
        ));
        assert!(matches!(
            TimeoutSpec::from("1e300").resolve(),
            Err(RpcError::Configuration(_))
        ));
        assert!(matches!(
            TimeoutSpec::deadline_from(Duration::MAX, Instant::now()),
            Err(RpcError::Configuration(_))
        ));
    }

    #[tokio::test]
    async fn test_unrepresentable_deadline_sends_nothing() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;

        let err = client
            .function("echo")
            .timeout(u64::MAX)
            .invoke()
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Configuration(_)));
        assert_eq!(hub.stats().published, 0);
        assert!(client.reply_queue_name().is_none());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_call_clears_pending() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;

        let call = client.function("nobody").invoke();
        let waited = tokio::time::timeout(Duration::from_millis(50), call).await;
        assert!(waited.is_err());
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_invalid_timeout_sends_nothing() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;

        let err = client
            .function("echo")
            .timeout("abc")
            .invoke()
            .await
            .unwrap_err();
        assert!(matches!(err, RpcError::Configuration(_)));
        assert_eq!(hub.stats().published, 0);
        assert!(client.reply_queue_name().is_none());
    }

    #[tokio::test]
    async fn test_ignore_result_skips_reply_queue() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;

        let result = client.function("log").arg("hi").ignore_result().invoke().await.unwrap();
        assert_eq!(result, Value::Null);
        assert!(client.reply_queue_name().is_none());
        assert_eq!(client.pending_count(), 0);
        // Nothing bound under "default", so the request is unroutable.
        assert_eq!(hub.stats().unroutable, 1);
    }

    #[tokio::test]
    async fn test_timeout_clears_pending() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;

        let err = client.function("slow").timeout(0.05).invoke().await.unwrap_err();
        match err {
            RpcError::Timeout { function } => assert_eq!(function, "slow"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(client.pending_count(), 0);

        let reply_queue = client.reply_queue_name().unwrap().to_string();
        assert_eq!(hub.bindings("default", &reply_queue), vec![reply_queue.clone()]);
    }

    /// A hand-rolled responder standing in for a server.
    async fn answer_next(hub: &MemoryHub, flag: ErrorFlag, result: Value) {
        // ---
        let server = hub.open().unwrap();
        let queue = QueueSpec {
            name: "default".into(),
            ..Default::default()
        };
        server.declare_queue(&queue).await.unwrap();
        server.bind_queue("default", "default", "default").await.unwrap();
        let mut consumer = server.consume("default", ConsumeOptions::default()).await.unwrap();

        tokio::spawn(async move {
            if let Some(request) = consumer.inbox.recv().await {
                let reply_to = request.properties.reply_to.clone().unwrap();
                let reply = reply_message(
                    "default",
                    &reply_to,
                    request.properties.correlation_id.clone(),
                    &result,
                    flag,
                    &JsonCodec,
                )
                .unwrap();
                server.publish(reply).await.unwrap();
                server.ack(request.delivery_tag).await.unwrap();
            }
        });
    }

    #[tokio::test]
    async fn test_reply_decoded_by_content_type() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;
        answer_next(&hub, ErrorFlag::NoError, json!({"ok": true})).await;

        let result = client.function("anything").timeout(2.0).invoke().await.unwrap();
        assert_eq!(result, json!({"ok": true}));
        assert_eq!(client.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_error_reply_becomes_remote_function_error() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;
        answer_next(&hub, ErrorFlag::HasError, json!("boom")).await;

        let err = client.function("fails").timeout(2.0).invoke().await.unwrap_err();
        match err {
            RpcError::RemoteFunction(msg) => assert_eq!(msg, "boom"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_inbox_is_connection_lost() {
        // ---
        let hub = MemoryHub::new();
        let client = client_on(&hub).await;
        let _ = client.reply_queue().await.unwrap();

        let queue = client.reply_queue_name().unwrap().to_string();
        assert_eq!(hub.sever_consumers_of(&queue), 1);

        // The severed channel refuses the publish, or the closed inbox is seen first.
        let err = client.function("any").invoke().await.unwrap_err();
        assert!(matches!(err, RpcError::ConnectionLost | RpcError::Transport(_)));
        assert_eq!(client.pending_count(), 0);
    }
}
