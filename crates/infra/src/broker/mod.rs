//! Message broker port.
//!
//! The outbox publisher only needs three things from a broker: a live
//! connection, a way to publish one message, and a clean shutdown. Topics map
//! to exchanges and event types to routing keys.

use async_trait::async_trait;
use thiserror::Error;

use orderflow_core::{Classified, ErrorClass};

#[cfg(feature = "amqp")]
pub mod amqp;
pub mod in_memory;

#[cfg(feature = "amqp")]
pub use amqp::AmqpBroker;
pub use in_memory::{InMemoryBroker, PublishedMessage};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("broker connection failed: {0}")]
    Connection(String),

    #[error("broker is not connected")]
    NotConnected,

    #[error("publish to {exchange}/{routing_key} failed: {reason}")]
    Publish {
        exchange: String,
        routing_key: String,
        reason: String,
    },

    #[error("publish timed out after {0:?}")]
    Timeout(std::time::Duration),
}

impl Classified for BrokerError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Dependency
    }

    fn code(&self) -> &'static str {
        "broker_unavailable"
    }
}

#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Open (or reopen) the connection. A no-op when already connected.
    async fn connect(&self) -> Result<(), BrokerError>;

    async fn is_connected(&self) -> bool;

    /// Publish `payload` to `exchange` with `routing_key`. Returns once the
    /// broker has accepted the message.
    async fn publish(&self, exchange: &str, routing_key: &str, payload: &[u8]) -> Result<(), BrokerError>;

    /// Release the connection. Safe to call when not connected.
    async fn close(&self) -> Result<(), BrokerError>;
}
