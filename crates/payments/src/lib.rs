//! Payment attempts and refund requests.
//!
//! Payments mirror the gateway's status vocabulary and accept any status the
//! gateway reports. Refunds have their own small state machine driven by an
//! admin decision and the gateway's answer.

pub mod error;
pub mod payment;
pub mod refund;

pub use error::{PaymentError, RefundError};
pub use payment::{
    ApplyGatewayStatus, CreatePayment, Payment, PaymentCommand, PaymentCreated, PaymentEvent,
    PaymentParts, PaymentStatus, PaymentStatusUpdated,
};
pub use refund::{
    CompletionSource, DecideRefund, MarkRefundFailed, MarkRefundProcessed, RefundCommand,
    RefundDecided, RefundEvent, RefundFailed, RefundParts, RefundProcessed, RefundReason,
    RefundRequest, RefundRequested, RefundStatus, RequestRefund,
};
