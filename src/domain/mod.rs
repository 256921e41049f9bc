//! Domain layer public interface.
//!
//! This module defines domain-level abstractions that are independent of
//! broker client libraries, protocols, or infrastructure concerns.
//!
//! All domain consumers must import symbols via this module, not by
//! referencing individual files directly.

mod broker;

// --- Broker domain re-exports ---

pub use broker::{
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
