//! AMQP broker implementation using `lapin`.
//!
//! This module provides an implementation of the `Broker` trait backed by
//! an AMQP 0-9-1 connection. It follows an **actor-based concurrency model**
//! to safely integrate with the underlying AMQP client.
//!
//! ## Concurrency model
//!
//! - A single background **actor task** owns the AMQP connection and channel.
//! - Every channel operation (declare, bind, qos, publish, consume, ack,
//!   close) is a command sent to the actor and answered over a oneshot.
//! - One forwarding task per consumer turns lapin deliveries into domain
//!   [`Delivery`] values. When the connection drops the lapin consumer
//!   stream ends, the forwarder exits, and the consumer's inbox closes.
//!
//! Commands are executed strictly in arrival order, so the order in which
//! the server's scheduler submits replies and acks is the order in which
//! they reach the broker.
//!
//! ## Header encoding
//!
//! Domain headers are strings. They travel as AMQP long strings; on receipt,
//! long and short string header values are accepted and anything else is
//! ignored.

use std::sync::Arc;

use bytes::Bytes;
use lapin::{
    //
    options::{
        //
        BasicAckOptions,
        BasicConsumeOptions,
        BasicPublishOptions,
        BasicQosOptions,
        ExchangeDeclareOptions,
        QueueBindOptions,
        QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    uri::{AMQPUri, AMQPUserInfo},
    BasicProperties,
    Channel,
    Connection,
    ConnectionProperties,
    ExchangeKind,
};
use tokio::sync::{mpsc, oneshot};

use crate::{
    //
    log_debug,
    log_error,
    log_info,
    Broker,
    BrokerFactory,
    BrokerPtr,
    ConsumeOptions,
    ConsumerHandle,
    Delivery,
    ExchangeSpec,
    Headers,
    MessageProperties,
    OutboundMessage,
    QueueSpec,
    Result,
    RpcConfig,
    RpcError,
};

//
// Actor commands
//

type Resp<T> = oneshot::Sender<Result<T>>;

enum Cmd {
    //
    DeclareExchange { spec: ExchangeSpec, resp: Resp<()> },
    DeclareQueue { spec: QueueSpec, resp: Resp<String> },
    Bind { queue: String, exchange: String, key: String, resp: Resp<()> },
    Qos { count: u16, resp: Resp<()> },
    Publish { msg: OutboundMessage, resp: Resp<()> },
    Consume { queue: String, opts: ConsumeOptions, resp: Resp<ConsumerHandle> },
    Ack { tag: u64, resp: Resp<()> },
    Close { resp: Resp<()> },
}

/// AMQP broker connection using lapin.
pub struct AmqpBroker {
    // ---
    broker_id: String,
    cmd_tx: mpsc::Sender<Cmd>,
}

impl AmqpBroker {
    /// Spawns the actor task that owns `connection` and `channel`.
    fn create(broker_id: &str, connection: Connection, channel: Channel) -> BrokerPtr {
        // ---
        let (cmd_tx, cmd_rx) = mpsc::channel(64);

        let actor = Actor {
            broker_id: broker_id.to_string(),
            connection,
            channel,
            cmd_rx,
            consumers: Vec::new(),
        };
        tokio::spawn(actor.run());

        Arc::new(Self {
            broker_id: broker_id.to_string(),
            cmd_tx,
        })
    }

    async fn request<T>(&self, make: impl FnOnce(Resp<T>) -> Cmd) -> Result<T> {
        // ---
        let (tx, rx) = oneshot::channel();

        self.cmd_tx
            .send(make(tx))
            .await
            .map_err(|_| RpcError::ConnectionLost)?;

        rx.await.map_err(|_| RpcError::ConnectionLost)?
    }
}

/// Background actor task that owns the AMQP connection and channel.
struct Actor {
    // ---
    broker_id: String,
    connection: Connection,
    channel: Channel,
    cmd_rx: mpsc::Receiver<Cmd>,
    consumers: Vec<tokio::task::JoinHandle<()>>,
}

impl Actor {
    async fn run(mut self) {
        // ---
        log_debug!("[{}] AMQP actor started", self.broker_id);

        while let Some(cmd) = self.cmd_rx.recv().await {
            if self.handle_cmd(cmd).await {
                break;
            }
        }

        for handle in self.consumers.drain(..) {
            handle.abort();
        }
        let _ = self.channel.close(200, "Normal shutdown").await;
        let _ = self.connection.close(200, "Normal shutdown").await;

        log_info!("[{}] AMQP actor stopped", self.broker_id);
    }

    /// Returns `true` when the actor should stop.
    async fn handle_cmd(&mut self, cmd: Cmd) -> bool {
        // ---
        match cmd {
            Cmd::DeclareExchange { spec, resp } => {
                let _ = resp.send(self.do_declare_exchange(spec).await);
            }
            Cmd::DeclareQueue { spec, resp } => {
                let _ = resp.send(self.do_declare_queue(spec).await);
            }
            Cmd::Bind { queue, exchange, key, resp } => {
                let result = self
                    .channel
                    .queue_bind(&queue, &exchange, &key, QueueBindOptions::default(), FieldTable::default())
                    .await
                    .map_err(|e| amqp_err("queue bind", e));
                let _ = resp.send(result);
            }
            Cmd::Qos { count, resp } => {
                let result = self
                    .channel
                    .basic_qos(count, BasicQosOptions::default())
                    .await
                    .map_err(|e| amqp_err("basic qos", e));
                let _ = resp.send(result);
            }
            Cmd::Publish { msg, resp } => {
                let _ = resp.send(self.do_publish(msg).await);
            }
            Cmd::Consume { queue, opts, resp } => {
                let _ = resp.send(self.do_consume(queue, opts).await);
            }
            Cmd::Ack { tag, resp } => {
                let result = self
                    .channel
                    .basic_ack(tag, BasicAckOptions::default())
                    .await
                    .map_err(|e| amqp_err("ack", e));
                let _ = resp.send(result);
            }
            Cmd::Close { resp } => {
                let _ = resp.send(Ok(()));
                return true;
            }
        }
        false
    }

    async fn do_declare_exchange(&mut self, spec: ExchangeSpec) -> Result<()> {
        // ---
        let opts = ExchangeDeclareOptions {
            durable: spec.durable,
            auto_delete: spec.auto_delete,
            ..ExchangeDeclareOptions::default()
        };

        self.channel
            .exchange_declare(&spec.name, ExchangeKind::Direct, opts, FieldTable::default())
            .await
            .map_err(|e| amqp_err("exchange declare", e))?;

        log_debug!("[{}] Declared exchange: {}", self.broker_id, spec.name);
        Ok(())
    }

    async fn do_declare_queue(&mut self, spec: QueueSpec) -> Result<String> {
        // ---
        let opts = QueueDeclareOptions {
            passive: false,
            durable: spec.durable,
            exclusive: spec.exclusive,
            auto_delete: spec.auto_delete,
            nowait: false,
        };

        let queue = self
            .channel
            .queue_declare(&spec.name, opts, FieldTable::default())
            .await
            .map_err(|e| amqp_err("queue declare", e))?;

        let name = queue.name().as_str().to_string();
        log_debug!("[{}] Declared queue: {name}", self.broker_id);
        Ok(name)
    }

    async fn do_publish(&mut self, msg: OutboundMessage) -> Result<()> {
        // ---
        self.channel
            .basic_publish(
                &msg.exchange,
                &msg.routing_key,
                BasicPublishOptions::default(),
                &msg.body,
                to_amqp_properties(&msg.properties),
            )
            .await
            .map_err(|e| amqp_err("publish", e))?;

        log_debug!(
            "[{}] Published to {}/{}",
            self.broker_id,
            msg.exchange,
            msg.routing_key
        );
        Ok(())
    }

    async fn do_consume(&mut self, queue: String, opts: ConsumeOptions) -> Result<ConsumerHandle> {
        // ---
        let consumer_tag = format!("{}-{}", self.broker_id, uuid::Uuid::new_v4().simple());
        let consume_opts = BasicConsumeOptions {
            no_ack: opts.auto_ack,
            exclusive: opts.exclusive,
            ..BasicConsumeOptions::default()
        };

        let consumer = self
            .channel
            .basic_consume(&queue, &consumer_tag, consume_opts, FieldTable::default())
            .await
            .map_err(|e| amqp_err("consume", e))?;

        log_info!("[{}] Started consuming queue: {queue}", self.broker_id);

        let (tx, rx) = mpsc::unbounded_channel();
        let broker_id = self.broker_id.clone();

        let handle = tokio::spawn(async move {
            use futures_lite::stream::StreamExt;

            let mut consumer = consumer;
            while let Some(delivery_result) = consumer.next().await {
                match delivery_result {
                    Ok(delivery) => {
                        if tx.send(from_amqp_delivery(delivery)).is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        log_error!("[{broker_id}] Consumer error on {queue}: {e}");
                        break;
                    }
                }
            }

            log_info!("[{broker_id}] Consumer task ended for queue: {queue}");
        });
        self.consumers.push(handle);

        Ok(ConsumerHandle {
            consumer_tag,
            inbox: rx,
        })
    }
}

fn amqp_err(op: &str, e: lapin::Error) -> RpcError {
    // ---
    match e {
        lapin::Error::InvalidChannelState(_) | lapin::Error::InvalidConnectionState(_) => {
            RpcError::ConnectionLost
        }
        other => RpcError::Transport(format!("amqp: {op} failed: {other}")),
    }
}

fn to_amqp_properties(props: &MessageProperties) -> BasicProperties {
    // ---
    let mut out = BasicProperties::default();

    if let Some(id) = &props.correlation_id {
        out = out.with_correlation_id(ShortString::from(id.to_string()));
    }
    if let Some(reply_to) = &props.reply_to {
        out = out.with_reply_to(ShortString::from(reply_to.to_string()));
    }
    if let Some(content_type) = &props.content_type {
        out = out.with_content_type(ShortString::from(content_type.to_string()));
    }
    if !props.headers.is_empty() {
        let mut table = FieldTable::default();
        for (key, value) in &props.headers {
            table.insert(
                ShortString::from(key.clone()),
                AMQPValue::LongString(LongString::from(value.clone())),
            );
        }
        out = out.with_headers(table);
    }

    out
}

fn from_amqp_delivery(delivery: lapin::message::Delivery) -> Delivery {
    // ---
    let props = &delivery.properties;

    let mut headers = Headers::new();
    if let Some(table) = props.headers() {
        for (key, value) in table.inner() {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8_lossy(s.as_bytes()).into_owned(),
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                _ => continue,
            };
            headers.insert(key.as_str().to_string(), value);
        }
    }

    let properties = MessageProperties {
        correlation_id: props.correlation_id().as_ref().map(|s| Arc::from(s.as_str())),
        reply_to: props.reply_to().as_ref().map(|s| Arc::from(s.as_str())),
        headers,
        content_type: props.content_type().as_ref().map(|s| Arc::from(s.as_str())),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.as_str().to_string(),
        routing_key: delivery.routing_key.as_str().to_string(),
        redelivered: delivery.redelivered,
        properties,
        body: Bytes::from(delivery.data),
    }
}

#[async_trait::async_trait]
impl Broker for AmqpBroker {
    // ---
    fn broker_id(&self) -> &str {
        &self.broker_id
    }

    async fn declare_exchange(&self, spec: &ExchangeSpec) -> Result<()> {
        let spec = spec.clone();
        self.request(|resp| Cmd::DeclareExchange { spec, resp }).await
    }

    async fn declare_queue(&self, spec: &QueueSpec) -> Result<String> {
        let spec = spec.clone();
        self.request(|resp| Cmd::DeclareQueue { spec, resp }).await
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, binding_key: &str) -> Result<()> {
        // ---
        let (queue, exchange, key) = (queue.to_string(), exchange.to_string(), binding_key.to_string());
        self.request(|resp| Cmd::Bind { queue, exchange, key, resp }).await
    }

    async fn set_prefetch(&self, count: u16) -> Result<()> {
        self.request(|resp| Cmd::Qos { count, resp }).await
    }

    async fn publish(&self, msg: OutboundMessage) -> Result<()> {
        self.request(|resp| Cmd::Publish { msg, resp }).await
    }

    async fn consume(&self, queue: &str, opts: ConsumeOptions) -> Result<ConsumerHandle> {
        let queue = queue.to_string();
        self.request(|resp| Cmd::Consume { queue, opts, resp }).await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<()> {
        self.request(|resp| Cmd::Ack { tag: delivery_tag, resp }).await
    }

    async fn close(&self) -> Result<()> {
        // ---
        let (tx, rx) = oneshot::channel();
        if self.cmd_tx.send(Cmd::Close { resp: tx }).await.is_ok() {
            let _ = rx.await;
        }
        Ok(())
    }
}

/// Opens lapin connections for one [`RpcConfig`].
pub struct AmqpBrokerFactory {
    config: RpcConfig,
}

impl AmqpBrokerFactory {
    pub fn new(config: &RpcConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait::async_trait]
impl BrokerFactory for AmqpBrokerFactory {
    async fn connect(&self) -> Result<BrokerPtr> {
        // ---
        let (connection, channel) = create_amqp_connection(&self.config).await?;
        Ok(AmqpBroker::create(
            &self.config.connection_name,
            connection,
            channel,
        ))
    }
}

/// Creates an AMQP connection and channel from the given configuration.
async fn create_amqp_connection(config: &RpcConfig) -> Result<(Connection, Channel)> {
    // ---
    let mut uri: AMQPUri = config
        .broker_uri
        .parse()
        .map_err(|e| RpcError::config(format!("invalid broker URI: {e}")))?;

    if let Some(creds) = &config.credentials {
        uri.authority.userinfo = AMQPUserInfo {
            username: creds.username.clone(),
            password: creds.password.clone(),
        };
    }

    log_info!(
        "Connecting to AMQP broker: {}:{}{}",
        uri.authority.host,
        uri.authority.port,
        uri.vhost
    );

    let props = ConnectionProperties::default()
        .with_connection_name(config.connection_name.clone().into());

    let connection = Connection::connect_uri(uri, props).await.map_err(|e| {
        let msg = format!("amqp: connection failed: {e}");
        log_error!("{msg}");
        RpcError::Transport(msg)
    })?;

    let channel = connection.create_channel().await.map_err(|e| {
        let msg = format!("amqp: channel creation failed: {e}");
        log_error!("{msg}");
        RpcError::Transport(msg)
    })?;

    log_info!("Connected to AMQP broker");
    Ok((connection, channel))
}
