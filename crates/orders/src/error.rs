use thiserror::Error;

use orderflow_core::{Classified, ErrorClass};

use crate::status::OrderStatus;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OrderError {
    #[error("order must contain at least one item")]
    EmptyOrder,

    #[error("invalid course: {0}")]
    InvalidCourse(String),

    #[error("invalid order item: {0}")]
    InvalidItem(String),

    #[error("order not found")]
    OrderNotFound,

    #[error("invalid order status transition from {from} to {to}")]
    InvalidOrderStatus { from: OrderStatus, to: OrderStatus },

    #[error("order has expired")]
    OrderExpired,

    #[error("order belongs to another user")]
    Unauthorized,

    #[error("order already exists")]
    AlreadyExists,

    #[error("invalid order: {0}")]
    Validation(String),
}

impl OrderError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}

impl Classified for OrderError {
    fn class(&self) -> ErrorClass {
        match self {
            OrderError::EmptyOrder
            | OrderError::InvalidCourse(_)
            | OrderError::InvalidItem(_)
            | OrderError::Validation(_) => ErrorClass::Validation,
            OrderError::OrderNotFound => ErrorClass::NotFound,
            OrderError::InvalidOrderStatus { .. }
            | OrderError::OrderExpired
            | OrderError::AlreadyExists => ErrorClass::Conflict,
            OrderError::Unauthorized => ErrorClass::Unauthorized,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            OrderError::EmptyOrder => "empty_order",
            OrderError::InvalidCourse(_) => "invalid_course",
            OrderError::InvalidItem(_) => "invalid_order_item",
            OrderError::OrderNotFound => "order_not_found",
            OrderError::InvalidOrderStatus { .. } => "invalid_order_status",
            OrderError::OrderExpired => "order_expired",
            OrderError::Unauthorized => "unauthorized",
            OrderError::AlreadyExists => "order_already_exists",
            OrderError::Validation(_) => "validation_error",
        }
    }
}
