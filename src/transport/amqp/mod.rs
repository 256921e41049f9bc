//! AMQP protocol brokers.
//!
//! Currently supports:
//! - lapin - AMQP 0-9-1 (RabbitMQ)

#[cfg(feature = "transport_lapin")]
mod lapin;

#[cfg(feature = "transport_lapin")]
pub use self::lapin::{AmqpBroker, AmqpBrokerFactory};
