use thiserror::Error;

use orderflow_core::{Classified, ErrorClass};
use orderflow_coupons::CouponError;
use orderflow_orders::OrderError;
use orderflow_payments::{PaymentError, RefundError};

use crate::catalog::CatalogError;
use crate::gateway::GatewayError;
use crate::outbox::OutboxWriteError;
use crate::store::StoreError;

/// Error returned by the order, coupon, payment and refund services.
#[derive(Debug, Error)]
pub enum CheckoutError {
    #[error(transparent)]
    Order(#[from] OrderError),

    #[error(transparent)]
    Coupon(#[from] CouponError),

    #[error(transparent)]
    Payment(#[from] PaymentError),

    #[error(transparent)]
    Refund(#[from] RefundError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Gateway(#[from] GatewayError),

    #[error(transparent)]
    Catalog(#[from] CatalogError),

    #[error(transparent)]
    Outbox(#[from] OutboxWriteError),
}

impl CheckoutError {
    fn inner(&self) -> &dyn Classified {
        match self {
            CheckoutError::Order(e) => e,
            CheckoutError::Coupon(e) => e,
            CheckoutError::Payment(e) => e,
            CheckoutError::Refund(e) => e,
            CheckoutError::Store(e) => e,
            CheckoutError::Gateway(e) => e,
            CheckoutError::Catalog(e) => e,
            CheckoutError::Outbox(e) => e,
        }
    }
}

impl Classified for CheckoutError {
    fn class(&self) -> ErrorClass {
        self.inner().class()
    }

    fn code(&self) -> &'static str {
        self.inner().code()
    }
}
