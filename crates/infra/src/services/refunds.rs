//! Refund workflow.
//!
//! ```text
//! request ──► pending ──► approved ──► gateway refund ──► processed (+ order refunded)
//!                │            │                 └──────► failed
//!                └──► rejected
//! ```
//!
//! The admin decision commits before the gateway is called. The gateway
//! outcome is recorded in a second unit of work; a later `refund.succeeded`
//! webhook completes the request idempotently. A timed-out call records
//! nothing: the request stays `approved` until the webhook settles it.

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

use orderflow_core::{Aggregate, Clock, OrderId, RefundId, UserId};
use orderflow_orders::{OrderError, OrderStatus};
use orderflow_payments::{
    CompletionSource, DecideRefund, MarkRefundFailed, MarkRefundProcessed, PaymentError, PaymentStatus,
    RefundCommand, RefundError, RefundReason, RefundRequest, RefundStatus, RequestRefund,
};

use super::execute_refund;
use super::orders::transition_if_allowed;
use crate::error::CheckoutError;
use crate::gateway::{GatewayError, PaymentGateway, RefundParams, with_timeout};
use crate::outbox;
use crate::store::{RefundPage, RefundStats, Store, TimeRange, UnitOfWork};

const REFUNDED_REASON: &str = "refund processed";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestRefundInput {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub reason: RefundReason,
    pub reason_text: String,
    /// `None` refunds the full payment.
    pub amount: Option<i64>,
}

/// Move the refund's order to `refunded` once the money has gone back.
async fn mark_order_refunded(uow: &mut dyn UnitOfWork, order_id: OrderId, at: DateTime<Utc>) -> Result<(), CheckoutError> {
    let mut order = uow.order_for_update(order_id).await?.ok_or(OrderError::OrderNotFound)?;
    transition_if_allowed(uow, &mut order, OrderStatus::Refunded, Some(REFUNDED_REASON.to_string()), at).await?;
    Ok(())
}

/// Complete a refund from a gateway confirmation.
///
/// The request is found by its gateway refund id, falling back to the
/// request id the gateway echoes back. Returns `false` when neither matches.
/// Completing an already processed request writes nothing.
pub(crate) async fn complete_from_gateway(
    uow: &mut dyn UnitOfWork,
    gateway_refund_id: &str,
    refund_id: Option<RefundId>,
    at: DateTime<Utc>,
) -> Result<bool, CheckoutError> {
    let mut refund = match uow.refund_by_gateway_id_for_update(gateway_refund_id).await? {
        Some(refund) => refund,
        None => match refund_id {
            Some(id) => match uow.refund_for_update(id).await? {
                Some(refund) => refund,
                None => return Ok(false),
            },
            None => return Ok(false),
        },
    };

    let events = execute_refund(
        uow,
        &mut refund,
        RefundCommand::MarkRefundProcessed(MarkRefundProcessed {
            gateway_refund_id: gateway_refund_id.to_string(),
            source: CompletionSource::GatewayConfirmation,
            occurred_at: at,
        }),
    )
    .await?;
    if !events.is_empty() {
        mark_order_refunded(uow, refund.order_id(), at).await?;
        info!(refund_id = %refund.id_typed(), gateway_refund_id, "refund completed by gateway");
    }
    Ok(true)
}

#[derive(Clone)]
pub struct RefundService {
    store: Arc<dyn Store>,
    gateway: Arc<dyn PaymentGateway>,
    clock: Arc<dyn Clock>,
    gateway_timeout: StdDuration,
    refund_window: Duration,
}

impl RefundService {
    pub fn new(
        store: Arc<dyn Store>,
        gateway: Arc<dyn PaymentGateway>,
        clock: Arc<dyn Clock>,
        gateway_timeout: StdDuration,
        refund_window: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            clock,
            gateway_timeout,
            refund_window,
        }
    }

    /// Customer asks for their money back on a paid order.
    #[instrument(skip(self, input), fields(order_id = %input.order_id, user_id = %input.user_id), err)]
    pub async fn request_refund(&self, input: RequestRefundInput) -> Result<RefundRequest, CheckoutError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;

        // Locking the order serialises concurrent requests for it.
        let order = uow
            .order_for_update(input.order_id)
            .await?
            .ok_or(OrderError::OrderNotFound)?;
        order.ensure_owner(input.user_id)?;
        let paid_at = order.state().paid_at().ok_or(RefundError::OrderNotPaid)?;

        let existing = uow.refunds_for_order(input.order_id).await?;
        if existing.iter().any(|r| r.status().blocks_new_request()) {
            return Err(RefundError::RefundAlreadyRequested.into());
        }

        let payment = uow
            .payments_for_order(input.order_id)
            .await?
            .into_iter()
            .rev()
            .find(|p| p.status() == PaymentStatus::Succeeded)
            .ok_or(PaymentError::PaymentNotFound)?;

        let mut refund = RefundRequest::empty(RefundId::new());
        let events = refund.execute(&RefundCommand::RequestRefund(RequestRefund {
            order_id: input.order_id,
            user_id: input.user_id,
            payment_id: payment.id_typed(),
            payment_amount: payment.amount(),
            currency: payment.currency().clone(),
            amount: input.amount,
            reason: input.reason,
            reason_text: input.reason_text,
            paid_at,
            refund_window: self.refund_window,
            occurred_at: now,
        }))?;
        uow.insert_refund(&refund).await?;
        outbox::append_events(uow.as_mut(), &events).await?;
        uow.commit().await?;

        info!(refund_id = %refund.id_typed(), amount = refund.amount(), reason = refund.reason().as_str(), "refund requested");
        Ok(refund)
    }

    /// Admin decision. Approval refunds through the gateway and needs the
    /// order to still be `paid`.
    ///
    /// A gateway error marks the request `failed` and is returned after that
    /// state is committed. A timeout is returned with the request left
    /// `approved`.
    #[instrument(skip(self, admin_reason), fields(refund_id = %refund_id, approve = approve), err)]
    pub async fn decide_refund(
        &self,
        refund_id: RefundId,
        approve: bool,
        admin_reason: Option<String>,
    ) -> Result<RefundRequest, CheckoutError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut refund = uow.refund_for_update(refund_id).await?.ok_or(RefundError::RefundNotFound)?;
        if approve {
            let order = uow
                .order_for_update(refund.order_id())
                .await?
                .ok_or(OrderError::OrderNotFound)?;
            if order.status() != OrderStatus::Paid {
                return Err(OrderError::InvalidOrderStatus {
                    from: order.status(),
                    to: OrderStatus::Refunded,
                }
                .into());
            }
        }
        execute_refund(
            uow.as_mut(),
            &mut refund,
            RefundCommand::DecideRefund(DecideRefund {
                approve,
                admin_reason,
                occurred_at: now,
            }),
        )
        .await?;
        let payment = if approve {
            Some(uow.payment(refund.payment_id()).await?.ok_or(PaymentError::PaymentNotFound)?)
        } else {
            None
        };
        uow.commit().await?;

        let Some(payment) = payment else {
            info!(refund_id = %refund_id, "refund rejected");
            return Ok(refund);
        };

        let outcome = with_timeout(
            self.gateway_timeout,
            "refund",
            self.gateway.refund(RefundParams {
                payment_intent_id: payment.gateway_transaction_id().to_string(),
                amount: refund.amount(),
                currency: refund.currency().clone(),
                refund_id,
            }),
        )
        .await;

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut refund = uow.refund_for_update(refund_id).await?.ok_or(RefundError::RefundNotFound)?;

        match outcome {
            Ok(gateway_refund) => {
                execute_refund(
                    uow.as_mut(),
                    &mut refund,
                    RefundCommand::MarkRefundProcessed(MarkRefundProcessed {
                        gateway_refund_id: gateway_refund.id.clone(),
                        source: CompletionSource::Approval,
                        occurred_at: now,
                    }),
                )
                .await?;
                mark_order_refunded(uow.as_mut(), refund.order_id(), now).await?;
                uow.commit().await?;
                info!(refund_id = %refund_id, gateway_refund_id = %gateway_refund.id, "refund processed");
                Ok(refund)
            }
            // The confirmation webhook beat us to it.
            Err(_) if refund.status() == RefundStatus::Processed => Ok(refund),
            Err(err @ GatewayError::Timeout { .. }) => {
                warn!(refund_id = %refund_id, error = %err, "gateway refund unconfirmed, left approved");
                Err(err.into())
            }
            Err(err) => {
                execute_refund(
                    uow.as_mut(),
                    &mut refund,
                    RefundCommand::MarkRefundFailed(MarkRefundFailed {
                        error: err.to_string(),
                        occurred_at: now,
                    }),
                )
                .await?;
                uow.commit().await?;
                warn!(refund_id = %refund_id, error = %err, "gateway refund failed");
                Err(err.into())
            }
        }
    }

    pub async fn get_refund(&self, refund_id: RefundId) -> Result<RefundRequest, CheckoutError> {
        let mut uow = self.store.begin().await?;
        Ok(uow.refund(refund_id).await?.ok_or(RefundError::RefundNotFound)?)
    }

    /// Every request for an order, oldest first.
    pub async fn list_for_order(&self, order_id: OrderId) -> Result<Vec<RefundRequest>, CheckoutError> {
        let mut uow = self.store.begin().await?;
        Ok(uow.refunds_for_order(order_id).await?)
    }

    /// A user's own requests, newest first.
    pub async fn list_for_user(&self, user_id: UserId, limit: u32, offset: u32) -> Result<RefundPage, CheckoutError> {
        let mut uow = self.store.begin().await?;
        Ok(uow.refunds_for_user(user_id, limit, offset).await?)
    }

    /// Every request, newest first.
    pub async fn list_all(&self, limit: u32, offset: u32) -> Result<RefundPage, CheckoutError> {
        let mut uow = self.store.begin().await?;
        Ok(uow.refunds_page(limit, offset).await?)
    }

    /// Counts and amounts over requests made within `range`, or all of them.
    pub async fn stats(&self, range: Option<TimeRange>) -> Result<RefundStats, CheckoutError> {
        let mut uow = self.store.begin().await?;
        Ok(uow.refund_stats(range).await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    use chrono::TimeZone;

    use orderflow_core::{Classified, ErrorClass, ManualClock};
    use orderflow_orders::Order;

    use crate::catalog::InMemoryCatalog;
    use crate::config::OrderSettings;
    use crate::gateway::{GatewayError, InMemoryGateway};
    use crate::services::payments::{GatewayUpdate, apply_gateway_update};
    use crate::services::{CreateOrderRequest, OrderService, PaymentService};
    use crate::store::InMemoryStore;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 3, 12, 0, 0).unwrap()
    }

    struct Fixture {
        store: InMemoryStore,
        gateway: Arc<InMemoryGateway>,
        clock: Arc<ManualClock>,
        catalog: Arc<InMemoryCatalog>,
        orders: OrderService,
        payments: PaymentService,
        refunds: RefundService,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let gateway = Arc::new(InMemoryGateway::new());
        let clock = Arc::new(ManualClock::new(start()));
        let catalog = Arc::new(InMemoryCatalog::new());
        let timeout = StdDuration::from_millis(50);
        Fixture {
            orders: OrderService::new(Arc::new(store.clone()), catalog.clone(), clock.clone(), OrderSettings::default()),
            payments: PaymentService::new(Arc::new(store.clone()), gateway.clone(), clock.clone(), timeout),
            refunds: RefundService::new(
                Arc::new(store.clone()),
                gateway.clone(),
                clock.clone(),
                timeout,
                Duration::days(30),
            ),
            store,
            gateway,
            clock,
            catalog,
        }
    }

    /// An order of `price` paid through the gateway.
    async fn paid_order(f: &Fixture, user_id: UserId, price: i64) -> Order {
        let course = f.catalog.add_course("Macros", price);
        let order = f
            .orders
            .create_order(CreateOrderRequest {
                user_id,
                course_ids: vec![course],
                coupon_code: None,
                customer_email: "buyer@example.com".to_string(),
                customer_name: None,
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();
        let started = f.payments.initiate_payment(order.id_typed(), user_id).await.unwrap();

        let mut uow = f.store.begin().await.unwrap();
        apply_gateway_update(
            uow.as_mut(),
            started.payment.gateway_transaction_id(),
            GatewayUpdate::status(PaymentStatus::Succeeded),
            f.clock.now(),
        )
        .await
        .unwrap();
        uow.commit().await.unwrap();

        f.orders.get_order(order.id_typed(), user_id).await.unwrap()
    }

    fn input(order: &Order, amount: Option<i64>) -> RequestRefundInput {
        RequestRefundInput {
            order_id: order.id_typed(),
            user_id: order.user_id(),
            reason: RefundReason::Content,
            reason_text: " not what I expected ".to_string(),
            amount,
        }
    }

    #[tokio::test]
    async fn request_defaults_to_the_full_payment() {
        let f = fixture();
        let order = paid_order(&f, UserId::new(), 8_000).await;

        let refund = f.refunds.request_refund(input(&order, None)).await.unwrap();
        assert_eq!(refund.amount(), 8_000);
        assert_eq!(refund.status(), RefundStatus::Pending);
        assert_eq!(refund.reason_text(), "not what I expected");

        let last = f.store.outbox_rows().await.pop().unwrap();
        assert_eq!(last.event_type, "order.refund_requested");
        assert_eq!(last.aggregate_id, *order.id_typed().as_uuid());
    }

    #[tokio::test]
    async fn unpaid_orders_cannot_be_refunded() {
        let f = fixture();
        let course = f.catalog.add_course("Macros", 1_000);
        let user = UserId::new();
        let order = f
            .orders
            .create_order(CreateOrderRequest {
                user_id: user,
                course_ids: vec![course],
                coupon_code: None,
                customer_email: "buyer@example.com".to_string(),
                customer_name: None,
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();

        let err = f.refunds.request_refund(input(&order, None)).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Refund(RefundError::OrderNotPaid)));
    }

    #[tokio::test]
    async fn second_open_request_is_rejected() {
        let f = fixture();
        let order = paid_order(&f, UserId::new(), 8_000).await;
        f.refunds.request_refund(input(&order, Some(1_000))).await.unwrap();

        let err = f.refunds.request_refund(input(&order, Some(1_000))).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Refund(RefundError::RefundAlreadyRequested)));
    }

    #[tokio::test]
    async fn window_is_measured_from_payment() {
        let f = fixture();
        let order = paid_order(&f, UserId::new(), 8_000).await;
        f.clock.advance(Duration::days(31));

        let err = f.refunds.request_refund(input(&order, None)).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Refund(RefundError::RefundWindowExpired)));
    }

    #[tokio::test]
    async fn approval_refunds_through_the_gateway_and_refunds_the_order() {
        let f = fixture();
        let order = paid_order(&f, UserId::new(), 8_000).await;
        let refund = f.refunds.request_refund(input(&order, Some(3_000))).await.unwrap();

        let refund = f
            .refunds
            .decide_refund(refund.id_typed(), true, Some("ok".to_string()))
            .await
            .unwrap();
        assert_eq!(refund.status(), RefundStatus::Processed);
        assert_eq!(refund.gateway_refund_id(), Some("re_1"));

        let sent = f.gateway.refunds();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].amount, 3_000);
        assert_eq!(sent[0].refund_id, refund.id_typed());

        let order = f.orders.get_order(order.id_typed(), order.user_id()).await.unwrap();
        assert_eq!(order.status(), OrderStatus::Refunded);

        let types: Vec<String> = f.store.outbox_rows().await.into_iter().map(|r| r.event_type).collect();
        assert!(types.ends_with(&[
            "order.refund_approved".to_string(),
            "order.refund_processed".to_string(),
            "order.refunded".to_string(),
        ]));
    }

    #[tokio::test]
    async fn rejection_never_calls_the_gateway() {
        let f = fixture();
        let order = paid_order(&f, UserId::new(), 8_000).await;
        let refund = f.refunds.request_refund(input(&order, None)).await.unwrap();

        let refund = f
            .refunds
            .decide_refund(refund.id_typed(), false, Some("outside policy".to_string()))
            .await
            .unwrap();
        assert_eq!(refund.status(), RefundStatus::Rejected);
        assert!(f.gateway.refunds().is_empty());

        let err = f.refunds.decide_refund(refund.id_typed(), true, None).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(err.code(), "refund_already_processed");
    }

    #[tokio::test]
    async fn gateway_failure_marks_failed_and_blocks_a_new_request() {
        let f = fixture();
        let order = paid_order(&f, UserId::new(), 8_000).await;
        let refund = f.refunds.request_refund(input(&order, None)).await.unwrap();
        f.gateway
            .fail_next_refund(GatewayError::Unavailable("connection reset".to_string()));

        let err = f.refunds.decide_refund(refund.id_typed(), true, None).await.unwrap_err();
        assert_eq!(err.class(), ErrorClass::Dependency);

        let stored = f.refunds.get_refund(refund.id_typed()).await.unwrap();
        assert_eq!(stored.status(), RefundStatus::Failed);
        assert!(stored.admin_reason().unwrap().contains("gateway error"));
        let order_now = f.orders.get_order(order.id_typed(), order.user_id()).await.unwrap();
        assert_eq!(order_now.status(), OrderStatus::Paid);

        let err = f.refunds.request_refund(input(&order, None)).await.unwrap_err();
        assert!(matches!(err, CheckoutError::Refund(RefundError::RefundAlreadyRequested)));
        assert_eq!(f.refunds.list_for_order(order.id_typed()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn gateway_timeout_leaves_the_request_approved() {
        let f = fixture();
        let order = paid_order(&f, UserId::new(), 8_000).await;
        let refund = f.refunds.request_refund(input(&order, None)).await.unwrap();
        f.gateway.hang_next();

        let err = f.refunds.decide_refund(refund.id_typed(), true, None).await.unwrap_err();
        assert_eq!(err.code(), "gateway_timeout");

        let stored = f.refunds.get_refund(refund.id_typed()).await.unwrap();
        assert_eq!(stored.status(), RefundStatus::Approved);
        assert_eq!(f.store.outbox_rows().await.pop().unwrap().event_type, "order.refund_approved");

        // The confirmation settles it later.
        let mut uow = f.store.begin().await.unwrap();
        let found = complete_from_gateway(uow.as_mut(), "re_late", Some(refund.id_typed()), f.clock.now())
            .await
            .unwrap();
        uow.commit().await.unwrap();
        assert!(found);
        assert_eq!(
            f.refunds.get_refund(refund.id_typed()).await.unwrap().status(),
            RefundStatus::Processed
        );
        let order = f.orders.get_order(order.id_typed(), order.user_id()).await.unwrap();
        assert_eq!(order.status(), OrderStatus::Refunded);
    }

    #[tokio::test]
    async fn approval_requires_the_order_to_still_be_paid() {
        let f = fixture();
        let order = paid_order(&f, UserId::new(), 8_000).await;
        let refund = f.refunds.request_refund(input(&order, None)).await.unwrap();
        f.orders
            .transition(order.id_typed(), OrderStatus::Refunded, Some("refunded by support".to_string()))
            .await
            .unwrap();

        let err = f.refunds.decide_refund(refund.id_typed(), true, None).await.unwrap_err();
        assert!(matches!(
            err,
            CheckoutError::Order(OrderError::InvalidOrderStatus {
                from: OrderStatus::Refunded,
                to: OrderStatus::Refunded
            })
        ));
        assert!(f.gateway.refunds().is_empty());
        assert_eq!(
            f.refunds.get_refund(refund.id_typed()).await.unwrap().status(),
            RefundStatus::Pending
        );
    }

    #[tokio::test]
    async fn user_and_admin_listings_are_newest_first() {
        let f = fixture();
        let alice = UserId::new();
        let bob = UserId::new();
        let first = paid_order(&f, alice, 1_000).await;
        let second = paid_order(&f, alice, 2_000).await;
        let other = paid_order(&f, bob, 3_000).await;

        for order in [&first, &second, &other] {
            f.refunds.request_refund(input(order, None)).await.unwrap();
            f.clock.advance(Duration::minutes(1));
        }

        let page = f.refunds.list_for_user(alice, 1, 0).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.refunds.len(), 1);
        assert_eq!(page.refunds[0].order_id(), second.id_typed());

        let rest = f.refunds.list_for_user(alice, 10, 1).await.unwrap();
        assert_eq!(rest.refunds[0].order_id(), first.id_typed());

        let all = f.refunds.list_all(10, 0).await.unwrap();
        assert_eq!(all.total, 3);
        let orders: Vec<OrderId> = all.refunds.iter().map(|r| r.order_id()).collect();
        assert_eq!(orders, vec![other.id_typed(), second.id_typed(), first.id_typed()]);
    }

    #[tokio::test]
    async fn stats_count_by_status_and_average_the_amount() {
        let f = fixture();
        let user = UserId::new();
        let processed = paid_order(&f, user, 3_000).await;
        let rejected = paid_order(&f, user, 2_000).await;
        let pending = paid_order(&f, user, 1_000).await;

        let r = f.refunds.request_refund(input(&processed, None)).await.unwrap();
        f.refunds.decide_refund(r.id_typed(), true, None).await.unwrap();
        let r = f.refunds.request_refund(input(&rejected, None)).await.unwrap();
        f.refunds.decide_refund(r.id_typed(), false, None).await.unwrap();
        f.clock.advance(Duration::days(2));
        f.refunds.request_refund(input(&pending, Some(400))).await.unwrap();

        let stats = f.refunds.stats(None).await.unwrap();
        assert_eq!(stats.total_refunds, 3);
        assert_eq!(stats.total_amount, 5_400);
        assert_eq!(stats.average_amount, 1_800);
        assert_eq!(
            (stats.processed_refunds, stats.pending_refunds, stats.rejected_refunds, stats.failed_refunds),
            (1, 1, 1, 0)
        );

        let recent = f
            .refunds
            .stats(Some(TimeRange {
                from: f.clock.now() - Duration::days(1),
                to: f.clock.now(),
            }))
            .await
            .unwrap();
        assert_eq!(recent.total_refunds, 1);
        assert_eq!(recent.total_amount, 400);
        assert_eq!(recent.pending_refunds, 1);
    }

    #[tokio::test]
    async fn gateway_confirmation_is_idempotent() {
        let f = fixture();
        let order = paid_order(&f, UserId::new(), 8_000).await;
        let refund = f.refunds.request_refund(input(&order, None)).await.unwrap();
        f.refunds.decide_refund(refund.id_typed(), true, None).await.unwrap();
        let rows = f.store.outbox_rows().await.len();

        let mut uow = f.store.begin().await.unwrap();
        let found = complete_from_gateway(uow.as_mut(), "re_1", None, start()).await.unwrap();
        uow.commit().await.unwrap();

        assert!(found);
        assert_eq!(f.store.outbox_rows().await.len(), rows);
    }
}
