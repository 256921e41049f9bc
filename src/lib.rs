//! Request/response RPC over a topic/queue message broker with correlated
//! replies.
//!
//! Callers invoke named remote functions through an [`RpcClient`]; unless
//! told to ignore the result they wait until the reply carrying their
//! correlation id arrives or a timeout elapses. An [`RpcServer`] consumes
//! one or more queues bound to a direct exchange, dispatches each request
//! to a registered [`Handler`], and publishes the reply and the
//! acknowledgement back through its single broker channel.
//!
//! Brokers: an AMQP 0-9-1 broker (feature `transport_lapin`) or the
//! in-process [`MemoryHub`] behind `memory://` URIs.

// Import all sub modules once...
mod macros;
pub(crate) use macros::{log_debug, log_error, log_info, log_stage, log_warn};

mod client;
mod codec;
mod connection;
mod correlation;
mod credentials;
mod domain;
mod error;
mod protocol;
mod rpc_config;
mod server;
mod transport;

pub mod cli;

// Re-export main types
pub use client::{CallOptions, RemoteFunction, RpcClient, TimeoutSpec};
pub use server::{
    // ---
    plan_queues,
    BoxError,
    CallArgs,
    Dispatcher,
    Handler,
    HandlerFn,
    HandlerResult,
    HandlerSource,
    InFlight,
    Prepared,
    QueuePlan,
    Registry,
    RpcServer,
    RpcServerBuilder,
    WorkerPool,
    DEFAULT_HANDLER,
};

pub use rpc_config::{ConnectionMode, RpcConfig, DEFAULT_EXCHANGE, DEFAULT_QUEUE};

pub use codec::{
    // ---
    CodecPtr,
    CodecSet,
    JsonCodec,
    MsgPackCodec,
    PayloadCodec,
    CONTENT_TYPE_JSON,
    CONTENT_TYPE_MSGPACK,
};

pub use connection::{
    // ---
    CloseAction,
    ConnectionState,
    Connector,
    Job,
    ScheduleLock,
    Scheduler,
    ShutdownHandle,
};

pub use protocol::{
    // ---
    extract_arguments,
    reply_message,
    request_message,
    ErrorFlag,
    KwargsFallback,
    HEADER_CONSUMER_NAME,
    HEADER_ERROR_FLAG,
};

pub use correlation::CorrelationId;
pub use credentials::{Certificate, Credentials, CredentialsProvider};
pub use error::{Result, RpcError};

pub use transport::{create_broker_factory, HubStats, MemoryBroker, MemoryHub};

#[cfg(feature = "transport_lapin")]
pub use transport::{AmqpBroker, AmqpBrokerFactory};

// --- public re-exports
pub use domain::{
    //
    Broker,
    BrokerFactory,
    BrokerFactoryPtr,
    BrokerPtr,
    ConsumeOptions,
    ConsumerHandle,
    Delivery,
    ExchangeSpec,
    Headers,
    MessageProperties,
    OutboundMessage,
    QueueSpec,
};
