use thiserror::Error;

use orderflow_core::{Classified, ErrorClass};

use crate::refund::RefundStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PaymentError {
    #[error("payment not found")]
    PaymentNotFound,

    #[error("payment already exists")]
    AlreadyExists,

    #[error("unknown payment status {0:?}")]
    UnknownStatus(String),

    #[error("payment amount {amount} exceeds order total {order_total}")]
    AmountExceedsOrder { amount: i64, order_total: i64 },

    #[error("payment belongs to another user")]
    Unauthorized,

    #[error("invalid payment: {0}")]
    Validation(String),
}

impl PaymentError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl Classified for PaymentError {
    fn class(&self) -> ErrorClass {
        match self {
            PaymentError::PaymentNotFound => ErrorClass::NotFound,
            PaymentError::AlreadyExists => ErrorClass::Conflict,
            PaymentError::Unauthorized => ErrorClass::Unauthorized,
            PaymentError::UnknownStatus(_)
            | PaymentError::AmountExceedsOrder { .. }
            | PaymentError::Validation(_) => ErrorClass::Validation,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            PaymentError::PaymentNotFound => "payment_not_found",
            PaymentError::AlreadyExists => "payment_already_exists",
            PaymentError::UnknownStatus(_) => "unknown_payment_status",
            PaymentError::AmountExceedsOrder { .. } => "payment_amount_exceeds_order",
            PaymentError::Unauthorized => "unauthorized",
            PaymentError::Validation(_) => "validation_error",
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RefundError {
    #[error("refund request not found")]
    RefundNotFound,

    #[error("order is not paid")]
    OrderNotPaid,

    #[error("refund window has expired")]
    RefundWindowExpired,

    #[error("a refund request already exists for this order")]
    RefundAlreadyRequested,

    #[error("refund amount {requested} exceeds payment amount {available}")]
    RefundAmountExceedsPayment { requested: i64, available: i64 },

    #[error("refund amount must be positive")]
    InvalidRefundAmount,

    #[error("refund request already {status}")]
    RefundAlreadyProcessed { status: RefundStatus },

    #[error("refund belongs to another user")]
    Unauthorized,

    #[error("invalid refund: {0}")]
    Validation(String),
}

impl RefundError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl Classified for RefundError {
    fn class(&self) -> ErrorClass {
        match self {
            RefundError::RefundNotFound => ErrorClass::NotFound,
            RefundError::RefundAmountExceedsPayment { .. }
            | RefundError::InvalidRefundAmount
            | RefundError::Validation(_) => ErrorClass::Validation,
            RefundError::OrderNotPaid
            | RefundError::RefundWindowExpired
            | RefundError::RefundAlreadyRequested
            | RefundError::RefundAlreadyProcessed { .. } => ErrorClass::Conflict,
            RefundError::Unauthorized => ErrorClass::Unauthorized,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            RefundError::RefundNotFound => "refund_not_found",
            RefundError::OrderNotPaid => "order_not_paid",
            RefundError::RefundWindowExpired => "refund_window_expired",
            RefundError::RefundAlreadyRequested => "refund_already_requested",
            RefundError::RefundAmountExceedsPayment { .. } => "refund_amount_exceeds_payment",
            RefundError::InvalidRefundAmount => "invalid_refund_amount",
            RefundError::RefundAlreadyProcessed { .. } => "refund_already_processed",
            RefundError::Unauthorized => "unauthorized",
            RefundError::Validation(_) => "validation_error",
        }
    }
}
