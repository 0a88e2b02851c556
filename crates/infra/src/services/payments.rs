use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Utc};
use tracing::{info, instrument, warn};

use orderflow_core::{Aggregate, Clock, OrderId, PaymentId, UserId};
use orderflow_orders::{Order, OrderCommand, OrderError, OrderStatus, StartPayment};
use orderflow_payments::{ApplyGatewayStatus, CreatePayment, Payment, PaymentCommand, PaymentError, PaymentStatus};

use super::orders::transition_if_allowed;
use super::{execute_order, execute_payment};
use crate::error::CheckoutError;
use crate::gateway::{CreateIntentRequest, PaymentGateway, PaymentIntent, with_timeout};
use crate::outbox;
use crate::store::{Store, UnitOfWork};

/// Reason recorded on orders whose payment the gateway canceled.
pub const PAYMENT_CANCELED_REASON: &str = "payment canceled";

/// A status report from the gateway (webhook or retrieve).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayUpdate {
    pub status: PaymentStatus,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub failure_message: Option<String>,
    pub failure_code: Option<String>,
}

impl GatewayUpdate {
    pub fn status(status: PaymentStatus) -> Self {
        Self {
            status,
            charge_id: None,
            receipt_url: None,
            failure_message: None,
            failure_code: None,
        }
    }
}

impl From<&PaymentIntent> for GatewayUpdate {
    fn from(intent: &PaymentIntent) -> Self {
        Self {
            status: intent.status,
            charge_id: intent.charge_id.clone(),
            receipt_url: intent.receipt_url.clone(),
            failure_message: intent.failure_message.clone(),
            failure_code: intent.failure_code.clone(),
        }
    }
}

/// Result of [`PaymentService::initiate_payment`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitiatedPayment {
    pub payment: Payment,
    pub client_secret: String,
    /// An active attempt already existed and was returned as is.
    pub reused: bool,
}

fn latest_active(payments: Vec<Payment>) -> Option<Payment> {
    payments.into_iter().rev().find(Payment::is_active)
}

/// Overwrite a payment's status with what the gateway reported and apply the
/// consequences for its order, all inside the caller's unit of work.
///
/// A report that changes nothing writes nothing.
pub(crate) async fn apply_gateway_update(
    uow: &mut dyn UnitOfWork,
    gateway_transaction_id: &str,
    update: GatewayUpdate,
    at: DateTime<Utc>,
) -> Result<Payment, CheckoutError> {
    let mut payment = uow
        .payment_by_gateway_id_for_update(gateway_transaction_id)
        .await?
        .ok_or(PaymentError::PaymentNotFound)?;

    let failure_message = update.failure_message.clone();
    let events = execute_payment(
        uow,
        &mut payment,
        PaymentCommand::ApplyGatewayStatus(ApplyGatewayStatus {
            status: update.status,
            charge_id: update.charge_id,
            receipt_url: update.receipt_url,
            failure_message: update.failure_message,
            failure_code: update.failure_code,
            occurred_at: at,
        }),
    )
    .await?;
    if events.is_empty() {
        return Ok(payment);
    }

    let (target, reason) = match payment.status() {
        PaymentStatus::Succeeded => (OrderStatus::Paid, None),
        PaymentStatus::Failed => (
            OrderStatus::Failed,
            Some(failure_message.unwrap_or_else(|| "payment failed".to_string())),
        ),
        PaymentStatus::Canceled => (OrderStatus::Cancelled, Some(PAYMENT_CANCELED_REASON.to_string())),
        _ => return Ok(payment),
    };

    let mut order = uow
        .order_for_update(payment.order_id())
        .await?
        .ok_or(OrderError::OrderNotFound)?;
    if transition_if_allowed(uow, &mut order, target, reason, at).await? {
        info!(
            order_id = %order.id_typed(),
            payment_id = %payment.id_typed(),
            status = %order.status(),
            "order updated from payment"
        );
    }
    Ok(payment)
}

#[derive(Clone)]
pub struct PaymentService {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    gateway_timeout: StdDuration,
}

impl PaymentService {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        gateway_timeout: StdDuration,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            gateway_timeout,
        }
    }

    fn ensure_payable(order: &Order, now: DateTime<Utc>) -> Result<(), OrderError> {
        let from = order.status();
        if !matches!(from, OrderStatus::Created | OrderStatus::PendingPayment) {
            return Err(OrderError::InvalidOrderStatus {
                from,
                to: OrderStatus::PendingPayment,
            });
        }
        if order.is_expired(now) {
            return Err(OrderError::OrderExpired);
        }
        Ok(())
    }

    async fn reuse(&self, payment: Payment) -> Result<InitiatedPayment, CheckoutError> {
        let intent = with_timeout(
            self.gateway_timeout,
            "retrieve_payment_intent",
            self.gateway.retrieve_payment_intent(payment.gateway_transaction_id()),
        )
        .await?;
        Ok(InitiatedPayment {
            payment,
            client_secret: intent.client_secret,
            reused: true,
        })
    }

    /// Start (or resume) paying an order.
    ///
    /// The gateway intent is created before any unit of work opens; if the
    /// gateway fails or times out nothing is written.
    #[instrument(skip(self), fields(order_id = %order_id, user_id = %user_id), err)]
    pub async fn initiate_payment(&self, order_id: OrderId, user_id: UserId) -> Result<InitiatedPayment, CheckoutError> {
        let order = {
            let mut uow = self.store.begin().await?;
            let order = uow.order(order_id).await?.ok_or(OrderError::OrderNotFound)?;
            order.ensure_owner(user_id)?;
            Self::ensure_payable(&order, self.clock.now())?;
            if let Some(active) = latest_active(uow.payments_for_order(order_id).await?) {
                drop(uow);
                return self.reuse(active).await;
            }
            order
        };

        let mut metadata = BTreeMap::new();
        metadata.insert("order_id".to_string(), order_id.to_string());
        metadata.insert("user_id".to_string(), user_id.to_string());

        let intent = with_timeout(
            self.gateway_timeout,
            "create_payment_intent",
            self.gateway.create_payment_intent(CreateIntentRequest {
                order_id,
                amount: order.total_amount(),
                currency: order.currency().clone(),
                customer_email: order.customer_email().to_string(),
                metadata: metadata.clone(),
            }),
        )
        .await?;

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut order = uow.order_for_update(order_id).await?.ok_or(OrderError::OrderNotFound)?;
        if let Some(active) = latest_active(uow.payments_for_order(order_id).await?) {
            drop(uow);
            warn!(intent_id = %intent.id, "concurrent payment attempt won, abandoning new intent");
            return self.reuse(active).await;
        }

        let mut payment = Payment::empty(PaymentId::new());
        let payment_events = payment.execute(&PaymentCommand::CreatePayment(CreatePayment {
            order_id,
            user_id,
            gateway_transaction_id: intent.id.clone(),
            amount: order.total_amount(),
            currency: order.currency().clone(),
            order_total: order.total_amount(),
            status: intent.status,
            metadata,
            occurred_at: now,
        }))?;
        uow.insert_payment(&payment).await?;
        outbox::append_events(uow.as_mut(), &payment_events).await?;

        execute_order(
            uow.as_mut(),
            &mut order,
            OrderCommand::StartPayment(StartPayment {
                payment_intent_id: intent.id.clone(),
                occurred_at: now,
            }),
        )
        .await?;
        uow.commit().await?;

        info!(payment_id = %payment.id_typed(), intent_id = %intent.id, amount = payment.amount(), "payment initiated");
        Ok(InitiatedPayment {
            payment,
            client_secret: intent.client_secret,
            reused: false,
        })
    }

    /// Ask the gateway for the authoritative status and record it.
    #[instrument(skip(self), fields(payment_id = %payment_id), err)]
    pub async fn confirm_payment(&self, payment_id: PaymentId, user_id: UserId) -> Result<Payment, CheckoutError> {
        let payment = self.get_payment(payment_id, user_id).await?;

        let intent = with_timeout(
            self.gateway_timeout,
            "retrieve_payment_intent",
            self.gateway.retrieve_payment_intent(payment.gateway_transaction_id()),
        )
        .await?;

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let updated = apply_gateway_update(uow.as_mut(), payment.gateway_transaction_id(), GatewayUpdate::from(&intent), now).await?;
        uow.commit().await?;
        Ok(updated)
    }

    /// Owner-scoped read.
    pub async fn get_payment(&self, payment_id: PaymentId, user_id: UserId) -> Result<Payment, CheckoutError> {
        let mut uow = self.store.begin().await?;
        let payment = uow.payment(payment_id).await?.ok_or(PaymentError::PaymentNotFound)?;
        if payment.user_id() != user_id {
            return Err(PaymentError::Unauthorized.into());
        }
        Ok(payment)
    }

    /// Every attempt for an order, oldest first.
    pub async fn payments_for_order(&self, order_id: OrderId, user_id: UserId) -> Result<Vec<Payment>, CheckoutError> {
        let mut uow = self.store.begin().await?;
        let order = uow.order(order_id).await?.ok_or(OrderError::OrderNotFound)?;
        order.ensure_owner(user_id)?;
        Ok(uow.payments_for_order(order_id).await?)
    }
}
