//! Broker implementations.
//!
//! This module provides concrete implementations of the domain-level
//! `Broker` trait. Network brokers are hidden behind feature flags and
//! exposed only through [`create_broker_factory`].
//!
//! Domain code must not depend on broker-library types.

mod amqp;
mod memory;

use std::sync::{Arc, OnceLock};

use crate::{
    // ---
    BrokerFactoryPtr,
    Result,
    RpcConfig,
    RpcError,
};

pub use memory::{HubStats, MemoryBroker, MemoryHub};

#[cfg(feature = "transport_lapin")]
pub use amqp::{AmqpBroker, AmqpBrokerFactory};

/// Process-wide hub behind `memory://` URIs.
fn shared_hub() -> MemoryHub {
    static HUB: OnceLock<MemoryHub> = OnceLock::new();
    HUB.get_or_init(MemoryHub::new).clone()
}

/// Pick a broker factory from the scheme of `config.broker_uri`.
///
/// - `memory://` → the process-wide [`MemoryHub`]
/// - `amqp://`, `amqps://` → lapin (feature `transport_lapin`)
///
/// # Errors
///
/// Returns [`RpcError::Configuration`] for an unknown scheme, or for an
/// AMQP URI when the crate was built without `transport_lapin`.
pub fn create_broker_factory(config: &RpcConfig) -> Result<BrokerFactoryPtr> {
    // ---
    let uri = config.broker_uri.as_str();

    if uri.starts_with("memory://") {
        return Ok(Arc::new(shared_hub()));
    }

    if uri.starts_with("amqp://") || uri.starts_with("amqps://") {
        #[cfg(feature = "transport_lapin")]
        {
            return Ok(Arc::new(AmqpBrokerFactory::new(config)));
        }

        #[cfg(not(feature = "transport_lapin"))]
        {
            return Err(RpcError::config(
                "AMQP broker URIs require the `transport_lapin` feature",
            ));
        }
    }

    Err(RpcError::config(format!("unsupported broker URI: {uri}")))
}
