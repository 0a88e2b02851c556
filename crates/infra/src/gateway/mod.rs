//! Payment gateway port.
//!
//! The gateway is called outside any unit of work and every call is bounded
//! by [`with_timeout`]. A timeout or transport failure surfaces as
//! [`GatewayError`] and nothing is persisted for that call.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use orderflow_core::{Classified, Currency, ErrorClass, OrderId, RefundId};
use orderflow_payments::PaymentStatus;

pub mod in_memory;

pub use in_memory::InMemoryGateway;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum GatewayError {
    #[error("gateway {operation} timed out after {after:?}")]
    Timeout { operation: &'static str, after: Duration },

    #[error("gateway unavailable: {0}")]
    Unavailable(String),

    /// The gateway answered but refused the request.
    #[error("gateway rejected the request ({code}): {message}")]
    Rejected { code: String, message: String },

    #[error("unknown payment intent {0}")]
    UnknownIntent(String),
}

impl Classified for GatewayError {
    fn class(&self) -> ErrorClass {
        ErrorClass::Dependency
    }

    fn code(&self) -> &'static str {
        match self {
            GatewayError::Timeout { .. } => "gateway_timeout",
            _ => "payment_gateway_error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateIntentRequest {
    pub order_id: OrderId,
    pub amount: i64,
    pub currency: Currency,
    pub customer_email: String,
    pub metadata: BTreeMap<String, String>,
}

/// The gateway's view of a payment intent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaymentIntent {
    pub id: String,
    /// Handed to the client to complete payment. Never persisted.
    pub client_secret: String,
    pub status: PaymentStatus,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub failure_message: Option<String>,
    pub failure_code: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundParams {
    pub payment_intent_id: String,
    pub amount: i64,
    pub currency: Currency,
    /// Echoed back in refund webhooks so they can be matched.
    pub refund_id: RefundId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRefund {
    pub id: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn create_payment_intent(&self, request: CreateIntentRequest) -> Result<PaymentIntent, GatewayError>;

    async fn retrieve_payment_intent(&self, id: &str) -> Result<PaymentIntent, GatewayError>;

    async fn refund(&self, params: RefundParams) -> Result<GatewayRefund, GatewayError>;
}

/// Bound a gateway call. An elapsed deadline becomes [`GatewayError::Timeout`].
pub async fn with_timeout<T, F>(after: Duration, operation: &'static str, call: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(after, call).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout { operation, after }),
    }
}
