//! Inbound gateway webhooks.
//!
//! Deliveries are at-least-once. [`WebhookDeduplicator`] keeps a ledger keyed
//! by the gateway's event id and runs the business handler at most once to
//! completion per id; [`WebhookProcessor`] is the handler that routes gateway
//! events to the payment and refund paths.
//!
//! Signature verification happens before anything here is called.

use async_trait::async_trait;
use thiserror::Error;

use orderflow_core::{Classified, ErrorClass};

use crate::error::CheckoutError;
use crate::store::{StoreError, UnitOfWork};

pub mod dedup;
pub mod processor;

pub use dedup::WebhookDeduplicator;
pub use processor::WebhookProcessor;

/// A verified delivery from the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundWebhook {
    pub event_id: String,
    pub event_type: String,
    /// Raw JSON body as delivered.
    pub payload: Vec<u8>,
}

impl InboundWebhook {
    pub fn new(event_id: impl Into<String>, event_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            event_id: event_id.into(),
            event_type: event_type.into(),
            payload: payload.into(),
        }
    }
}

/// What happened to a delivery. Every variant is reported to the sender as
/// success.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    Duplicate,
    /// The handler failed; the ledger row stays open for the next delivery.
    HandlerFailed,
}

impl WebhookOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            WebhookOutcome::Processed => "processed",
            WebhookOutcome::Duplicate => "duplicate",
            WebhookOutcome::HandlerFailed => "handler_failed",
        }
    }
}

#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("invalid webhook: {0}")]
    InvalidEvent(String),

    #[error("invalid webhook payload: {0}")]
    InvalidPayload(#[from] serde_json::Error),

    #[error(transparent)]
    Checkout(#[from] CheckoutError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classified for WebhookError {
    fn class(&self) -> ErrorClass {
        match self {
            WebhookError::InvalidEvent(_) | WebhookError::InvalidPayload(_) => ErrorClass::Validation,
            WebhookError::Checkout(e) => e.class(),
            WebhookError::Store(e) => e.class(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            WebhookError::InvalidEvent(_) => "invalid_webhook",
            WebhookError::InvalidPayload(_) => "invalid_webhook_payload",
            WebhookError::Checkout(e) => e.code(),
            WebhookError::Store(e) => e.code(),
        }
    }
}

/// Business logic run for a new delivery.
///
/// Runs inside the unit of work that stamps the ledger row; anything it
/// writes commits together with the stamp.
#[async_trait]
pub trait WebhookHandler: Send + Sync {
    async fn handle(&self, uow: &mut dyn UnitOfWork, webhook: &InboundWebhook) -> Result<(), WebhookError>;
}
