//! Application services.
//!
//! Each mutating call follows the same shape:
//!
//! ```text
//! begin unit of work
//!   ↓
//! load (and lock) the aggregate
//!   ↓
//! execute the command (pure decision + apply)
//!   ↓
//! persist the new state (version-checked) + append its events to the outbox
//!   ↓
//! commit
//! ```
//!
//! Any error before commit drops the unit of work, which rolls back the state
//! change and its outbox rows together. Gateway calls never happen while a
//! unit of work is open.

use orderflow_core::{Aggregate, AggregateRoot, ExpectedVersion};
use orderflow_orders::{Order, OrderCommand, OrderEvent};
use orderflow_payments::{Payment, PaymentCommand, PaymentEvent, RefundCommand, RefundEvent, RefundRequest};

use crate::error::CheckoutError;
use crate::outbox;
use crate::store::UnitOfWork;

pub mod coupons;
pub mod orders;
pub mod payments;
pub mod refunds;

pub use coupons::{CouponQuote, CouponService};
pub use orders::{CreateOrderRequest, OrderService};
pub use payments::{GatewayUpdate, InitiatedPayment, PaymentService};
pub use refunds::{RefundService, RequestRefundInput};

fn expected(version: u64) -> ExpectedVersion {
    ExpectedVersion::Exact(version)
}

/// Run `command` against a stored order and persist the outcome.
///
/// A command that decides nothing (no events) writes nothing.
pub(crate) async fn execute_order(
    uow: &mut dyn UnitOfWork,
    order: &mut Order,
    command: OrderCommand,
) -> Result<Vec<OrderEvent>, CheckoutError> {
    let before = expected(order.version());
    let events = order.execute(&command)?;
    if events.is_empty() {
        return Ok(events);
    }
    uow.update_order(order, before).await?;
    outbox::append_events(uow, &events).await?;
    Ok(events)
}

pub(crate) async fn execute_payment(
    uow: &mut dyn UnitOfWork,
    payment: &mut Payment,
    command: PaymentCommand,
) -> Result<Vec<PaymentEvent>, CheckoutError> {
    let before = expected(payment.version());
    let events = payment.execute(&command)?;
    if events.is_empty() {
        return Ok(events);
    }
    uow.update_payment(payment, before).await?;
    outbox::append_events(uow, &events).await?;
    Ok(events)
}

pub(crate) async fn execute_refund(
    uow: &mut dyn UnitOfWork,
    refund: &mut RefundRequest,
    command: RefundCommand,
) -> Result<Vec<RefundEvent>, CheckoutError> {
    let before = expected(refund.version());
    let events = refund.execute(&command)?;
    if events.is_empty() {
        return Ok(events);
    }
    uow.update_refund(refund, before).await?;
    outbox::append_events(uow, &events).await?;
    Ok(events)
}
