//! End-to-end tests for the checkout pipeline.
//!
//! Services → unit of work → outbox → publisher → broker, with the webhook
//! path and the expiry sweep driving the same aggregates.
//!
//! Verifies:
//! - the documented checkout scenarios
//! - one outbox row per aggregate mutation, none on rollback
//! - webhook replays have exactly one business effect
//! - gateway timeouts leave no local state behind

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, Duration, TimeZone, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    use orderflow_core::{Classified, Clock, CouponId, Currency, DEPENDENCY_MESSAGE, ErrorClass, ManualClock, UserId};
    use orderflow_coupons::{Applicability, CouponCode, CouponError, Discount, NewCoupon};
    use orderflow_orders::{Order, OrderStatus};
    use orderflow_payments::{PaymentStatus, RefundError, RefundReason, RefundStatus};

    use crate::broker::InMemoryBroker;
    use crate::catalog::InMemoryCatalog;
    use crate::config::{ExpirySettings, OrderSettings};
    use crate::error::CheckoutError;
    use crate::gateway::{GatewayError, InMemoryGateway};
    use crate::jobs::ExpirySweeper;
    use crate::outbox::{OutboxPublisher, PublisherConfig};
    use crate::services::{
        CouponService, CreateOrderRequest, OrderService, PaymentService, RefundService, RequestRefundInput,
    };
    use crate::store::{InMemoryStore, Store};
    use crate::webhooks::{InboundWebhook, WebhookDeduplicator, WebhookOutcome, WebhookProcessor};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 3, 4, 15, 0, 0).unwrap()
    }

    /// Every service wired to the same in-memory adapters.
    struct App {
        store: InMemoryStore,
        gateway: Arc<InMemoryGateway>,
        broker: Arc<InMemoryBroker>,
        clock: Arc<ManualClock>,
        catalog: Arc<InMemoryCatalog>,
        orders: OrderService,
        coupons: CouponService,
        payments: PaymentService,
        refunds: RefundService,
        webhooks: WebhookDeduplicator,
        processor: WebhookProcessor,
    }

    impl App {
        fn new() -> Self {
            let store = InMemoryStore::new();
            let shared: Arc<dyn Store> = Arc::new(store.clone());
            let gateway = Arc::new(InMemoryGateway::new());
            let clock = Arc::new(ManualClock::new(start()));
            let catalog = Arc::new(InMemoryCatalog::new());
            let settings = OrderSettings::default();
            let timeout = StdDuration::from_millis(50);

            Self {
                orders: OrderService::new(shared.clone(), catalog.clone(), clock.clone(), settings.clone()),
                coupons: CouponService::new(shared.clone(), clock.clone()),
                payments: PaymentService::new(shared.clone(), gateway.clone(), clock.clone(), timeout),
                refunds: RefundService::new(
                    shared.clone(),
                    gateway.clone(),
                    clock.clone(),
                    timeout,
                    settings.refund_window,
                ),
                webhooks: WebhookDeduplicator::new(shared, clock.clone()),
                processor: WebhookProcessor::new(clock.clone()),
                broker: Arc::new(InMemoryBroker::new()),
                store,
                gateway,
                clock,
                catalog,
            }
        }

        async fn coupon(&self, code: &str, discount: Discount) {
            self.coupons
                .create_coupon(NewCoupon {
                    id: CouponId::new(),
                    code: code.to_string(),
                    name: None,
                    description: None,
                    discount,
                    max_redemptions: Some(1),
                    max_redemptions_per_user: None,
                    minimum_amount: None,
                    applicability: Applicability::All,
                    first_time_only: false,
                    valid_from: start() - Duration::days(1),
                    expires_at: None,
                    is_active: true,
                })
                .await
                .unwrap();
        }

        async fn order(&self, user_id: UserId, price: i64, coupon: Option<&str>) -> Result<Order, CheckoutError> {
            let course = self.catalog.add_course("Async Rust", price);
            self.orders
                .create_order(CreateOrderRequest {
                    user_id,
                    course_ids: vec![course],
                    coupon_code: coupon.map(str::to_string),
                    customer_email: "student@example.com".to_string(),
                    customer_name: Some("Sam Student".to_string()),
                    metadata: BTreeMap::new(),
                })
                .await
        }

        /// An order with a payment attempt; returns the gateway intent id.
        async fn awaiting_payment(&self, price: i64) -> (Order, String) {
            let user = UserId::new();
            let order = self.order(user, price, None).await.unwrap();
            let started = self.payments.initiate_payment(order.id_typed(), user).await.unwrap();
            (order, started.payment.gateway_transaction_id().to_string())
        }

        async fn deliver(&self, event_id: &str, event_type: &str, object: serde_json::Value) -> WebhookOutcome {
            let body = json!({ "id": event_id, "type": event_type, "data": { "object": object } });
            let webhook = InboundWebhook::new(event_id, event_type, body.to_string().into_bytes());
            self.webhooks.accept(&webhook, &self.processor).await.unwrap()
        }

        async fn status(&self, order: &Order) -> OrderStatus {
            self.orders
                .get_order(order.id_typed(), order.user_id())
                .await
                .unwrap()
                .status()
        }

        async fn event_types(&self) -> Vec<String> {
            self.store
                .outbox_rows()
                .await
                .into_iter()
                .map(|row| row.event_type)
                .collect()
        }

        fn publisher(&self) -> OutboxPublisher {
            OutboxPublisher::new(
                Arc::new(self.store.clone()),
                self.broker.clone(),
                self.clock.clone(),
                PublisherConfig::default().with_reconnect(StdDuration::from_millis(1), StdDuration::from_millis(2), 3),
            )
        }
    }

    #[tokio::test]
    async fn percentage_coupon_discounts_and_redeems() {
        let app = App::new();
        app.coupon("SAVE10", Discount::Percentage { percent_off: 10 }).await;

        let order = app.order(UserId::new(), 10_000, Some("save10")).await.unwrap();

        assert_eq!(order.subtotal_amount(), 10_000);
        assert_eq!(order.discount_amount(), 1_000);
        assert_eq!(order.total_amount(), 9_000);

        let redemptions = app.store.redemptions().await;
        assert_eq!(redemptions.len(), 1);
        assert_eq!(redemptions[0].order_id, order.id_typed());
        assert_eq!(redemptions[0].discount_amount, 1_000);

        let mut uow = app.store.begin().await.unwrap();
        let code = CouponCode::parse("SAVE10").unwrap();
        let coupon = uow.coupon_by_code(&code).await.unwrap().unwrap();
        assert_eq!(coupon.redemption_count(), 1);
    }

    #[tokio::test]
    async fn fixed_coupon_is_clamped_to_the_order_amount() {
        let app = App::new();
        app.coupon(
            "FLAT6000",
            Discount::FixedAmount {
                amount_off: 6_000,
                currency: Currency::usd(),
            },
        )
        .await;

        let order = app.order(UserId::new(), 5_000, Some("FLAT6000")).await.unwrap();

        assert_eq!(order.discount_amount(), 5_000);
        assert_eq!(order.total_amount(), 0);
        assert_eq!(app.store.redemptions().await[0].discount_amount, 5_000);
    }

    #[tokio::test]
    async fn replayed_success_webhook_pays_the_order_once() {
        let app = App::new();
        let (order, intent) = app.awaiting_payment(4_200).await;

        let first = app.deliver("evt_1", "payment_intent.succeeded", json!({ "id": intent })).await;
        let rows_after_first = app.store.outbox_rows().await.len();
        let second = app.deliver("evt_1", "payment_intent.succeeded", json!({ "id": intent })).await;

        assert_eq!(first, WebhookOutcome::Processed);
        assert_eq!(second, WebhookOutcome::Duplicate);
        assert_eq!(app.status(&order).await, OrderStatus::Paid);
        assert_eq!(app.store.outbox_rows().await.len(), rows_after_first);

        let paid = app.event_types().await.iter().filter(|t| *t == "order.paid").count();
        assert_eq!(paid, 1);
    }

    #[tokio::test]
    async fn same_status_under_a_new_event_id_has_no_effect() {
        let app = App::new();
        let (order, intent) = app.awaiting_payment(4_200).await;

        app.deliver("evt_a", "payment_intent.succeeded", json!({ "id": intent })).await;
        let rows = app.store.outbox_rows().await.len();
        let outcome = app.deliver("evt_b", "payment_intent.succeeded", json!({ "id": intent })).await;

        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(app.store.outbox_rows().await.len(), rows);
        assert_eq!(app.status(&order).await, OrderStatus::Paid);
    }

    #[tokio::test]
    async fn refund_above_the_payment_is_rejected_without_a_row() {
        let app = App::new();
        let (order, intent) = app.awaiting_payment(3_000).await;
        app.deliver("evt_pay", "payment_intent.succeeded", json!({ "id": intent })).await;
        let rows = app.store.outbox_rows().await.len();

        let err = app
            .refunds
            .request_refund(RequestRefundInput {
                order_id: order.id_typed(),
                user_id: order.user_id(),
                reason: RefundReason::Accidental,
                reason_text: "bought twice".to_string(),
                amount: Some(3_001),
            })
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            CheckoutError::Refund(RefundError::RefundAmountExceedsPayment { .. })
        ));
        assert!(app.store.refunds().await.is_empty());
        assert_eq!(app.store.outbox_rows().await.len(), rows);
    }

    #[tokio::test]
    async fn unpaid_order_is_swept_after_expiry() {
        let app = App::new();
        let (order, _) = app.awaiting_payment(2_000).await;
        app.clock.advance(Duration::hours(25));

        let sweeper = ExpirySweeper::new(
            Arc::new(app.store.clone()),
            app.orders.clone(),
            app.clock.clone(),
            ExpirySettings::default(),
        );
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.cancelled, 1);

        let stored = app.orders.get_order(order.id_typed(), order.user_id()).await.unwrap();
        assert_eq!(stored.status(), OrderStatus::Cancelled);
        assert_eq!(stored.state().reason(), Some("expired"));

        let last = app.store.outbox_rows().await.pop().unwrap();
        assert_eq!(last.event_type, "order.cancelled");
        assert_eq!(last.aggregate_id, *order.id_typed().as_uuid());
    }

    #[tokio::test]
    async fn each_mutation_writes_its_own_rows() {
        let app = App::new();
        let user = UserId::new();

        let order = app.order(user, 7_500, None).await.unwrap();
        assert_eq!(app.event_types().await, ["order.created"]);

        let started = app.payments.initiate_payment(order.id_typed(), user).await.unwrap();
        assert_eq!(
            app.event_types().await[1..],
            ["payment.created", "order.pending_payment"]
        );

        app.deliver(
            "evt_ok",
            "payment_intent.succeeded",
            json!({ "id": started.payment.gateway_transaction_id(), "latest_charge": "ch_1" }),
        )
        .await;
        assert_eq!(app.event_types().await[3..], ["payment.succeeded", "order.paid"]);

        let refund = app
            .refunds
            .request_refund(RequestRefundInput {
                order_id: order.id_typed(),
                user_id: user,
                reason: RefundReason::Quality,
                reason_text: "audio is broken".to_string(),
                amount: None,
            })
            .await
            .unwrap();
        assert_eq!(app.event_types().await[5..], ["order.refund_requested"]);

        app.refunds.decide_refund(refund.id_typed(), true, None).await.unwrap();
        assert_eq!(
            app.event_types().await[6..],
            ["order.refund_approved", "order.refund_processed", "order.refunded"]
        );
        assert_eq!(app.status(&order).await, OrderStatus::Refunded);
    }

    #[tokio::test]
    async fn exhausted_coupon_rolls_back_the_whole_order() {
        let app = App::new();
        app.coupon("ONCE", Discount::Percentage { percent_off: 50 }).await;
        app.order(UserId::new(), 1_000, Some("ONCE")).await.unwrap();
        let rows = app.store.outbox_rows().await.len();

        let err = app.order(UserId::new(), 1_000, Some("ONCE")).await.unwrap_err();

        assert!(matches!(err, CheckoutError::Coupon(CouponError::CouponUsageExceeded)));
        assert_eq!(err.class(), ErrorClass::Conflict);
        assert_eq!(app.store.outbox_rows().await.len(), rows);
        assert_eq!(app.store.redemptions().await.len(), 1);
    }

    #[tokio::test]
    async fn gateway_timeout_leaves_no_payment_behind() {
        let app = App::new();
        let user = UserId::new();
        let order = app.order(user, 1_200, None).await.unwrap();
        app.gateway.hang_next();

        let err = app.payments.initiate_payment(order.id_typed(), user).await.unwrap_err();

        assert_eq!(err.class(), ErrorClass::Dependency);
        assert_eq!(err.to_body().message, DEPENDENCY_MESSAGE);
        assert_eq!(app.status(&order).await, OrderStatus::Created);
        assert!(app.payments.payments_for_order(order.id_typed(), user).await.unwrap().is_empty());
        assert_eq!(app.event_types().await, ["order.created"]);

        // A retry once the gateway answers again goes through.
        let started = app.payments.initiate_payment(order.id_typed(), user).await.unwrap();
        assert!(!started.reused);
    }

    #[tokio::test]
    async fn gateway_confirms_a_refund_the_api_call_reported_failed() {
        let app = App::new();
        let (order, intent) = app.awaiting_payment(9_900).await;
        app.deliver("evt_pay", "payment_intent.succeeded", json!({ "id": intent })).await;

        let refund = app
            .refunds
            .request_refund(RequestRefundInput {
                order_id: order.id_typed(),
                user_id: order.user_id(),
                reason: RefundReason::Technical,
                reason_text: "video will not load".to_string(),
                amount: None,
            })
            .await
            .unwrap();
        app.gateway.fail_next_refund(GatewayError::Unavailable("read timeout".to_string()));
        app.refunds.decide_refund(refund.id_typed(), true, None).await.unwrap_err();
        assert_eq!(app.status(&order).await, OrderStatus::Paid);

        // The failed request may still be settled, so it blocks a second one.
        let err = app
            .refunds
            .request_refund(RequestRefundInput {
                order_id: order.id_typed(),
                user_id: order.user_id(),
                reason: RefundReason::Technical,
                reason_text: "still broken".to_string(),
                amount: None,
            })
            .await
            .unwrap_err();
        assert!(matches!(err, CheckoutError::Refund(RefundError::RefundAlreadyRequested)));

        let outcome = app
            .deliver(
                "evt_refund",
                "refund.succeeded",
                json!({ "id": "re_gw_7", "status": "succeeded", "metadata": { "refund_id": refund.id_typed().to_string() } }),
            )
            .await;

        assert_eq!(outcome, WebhookOutcome::Processed);
        let stored = app.refunds.get_refund(refund.id_typed()).await.unwrap();
        assert_eq!(stored.status(), RefundStatus::Processed);
        assert_eq!(stored.gateway_refund_id(), Some("re_gw_7"));
        assert_eq!(app.status(&order).await, OrderStatus::Refunded);
        assert!(app.event_types().await.ends_with(&[
            "order.refund_completed".to_string(),
            "order.refunded".to_string(),
        ]));
    }

    #[tokio::test]
    async fn publisher_forwards_the_lifecycle_in_order() {
        let app = App::new();
        let (_, intent) = app.awaiting_payment(1_000).await;
        app.deliver("evt_1", "payment_intent.succeeded", json!({ "id": intent })).await;
        app.broker.fail_routing_key("payment.created");

        let report = app.publisher().run_once().await.unwrap();

        assert_eq!(report.fetched, 5);
        assert_eq!(report.published, 4);
        assert_eq!(report.failed, 1);
        let sent: Vec<(String, String)> = app
            .broker
            .published()
            .into_iter()
            .map(|m| (m.exchange, m.routing_key))
            .collect();
        assert_eq!(
            sent,
            [
                ("order.events".to_string(), "order.created".to_string()),
                ("order.events".to_string(), "order.pending_payment".to_string()),
                ("payment.events".to_string(), "payment.succeeded".to_string()),
                ("order.events".to_string(), "order.paid".to_string()),
            ]
        );

        app.broker.heal_routing_key("payment.created");
        let report = app.publisher().run_once().await.unwrap();
        assert_eq!((report.fetched, report.published), (1, 1));
        assert!(app.store.outbox_rows().await.iter().all(|row| row.published_at.is_some()));
    }

    #[tokio::test]
    async fn reported_payment_status_is_authoritative() {
        let app = App::new();
        let (order, intent) = app.awaiting_payment(1_000).await;
        app.gateway.set_status(&intent, PaymentStatus::Succeeded, Some("ch_77"));

        let payment = app
            .payments
            .payments_for_order(order.id_typed(), order.user_id())
            .await
            .unwrap()
            .remove(0);
        let confirmed = app
            .payments
            .confirm_payment(payment.id_typed(), order.user_id())
            .await
            .unwrap();

        assert_eq!(confirmed.status(), PaymentStatus::Succeeded);
        assert_eq!(confirmed.charge_id(), Some("ch_77"));
        assert_eq!(confirmed.processed_at(), Some(app.clock.now()));
        assert_eq!(app.status(&order).await, OrderStatus::Paid);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(32))]

        #[test]
        fn any_replay_sequence_pays_exactly_once(deliveries in prop::collection::vec(0usize..3, 1..12)) {
            let runtime = tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
                .unwrap();

            let (status, paid_rows) = runtime.block_on(async {
                let app = App::new();
                let (order, intent) = app.awaiting_payment(500).await;
                for n in &deliveries {
                    app.deliver(&format!("evt_{n}"), "payment_intent.succeeded", json!({ "id": intent })).await;
                }
                let paid_rows = app.event_types().await.iter().filter(|t| *t == "order.paid").count();
                (app.status(&order).await, paid_rows)
            });

            prop_assert_eq!(status, OrderStatus::Paid);
            prop_assert_eq!(paid_rows, 1);
        }
    }
}
