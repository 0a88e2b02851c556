use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use orderflow_core::{Clock, RefundId};
use orderflow_payments::PaymentStatus;

use super::{InboundWebhook, WebhookError, WebhookHandler};
use crate::services::payments::{GatewayUpdate, apply_gateway_update};
use crate::services::refunds::complete_from_gateway;
use crate::store::UnitOfWork;

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: Data<T>,
}

#[derive(Debug, Deserialize)]
struct Data<T> {
    object: T,
}

#[derive(Debug, Default, Deserialize)]
struct LastPaymentError {
    message: Option<String>,
    code: Option<String>,
}

#[derive(Debug, Deserialize)]
struct IntentObject {
    id: String,
    #[serde(default)]
    latest_charge: Option<String>,
    #[serde(default)]
    last_payment_error: Option<LastPaymentError>,
}

#[derive(Debug, Deserialize)]
struct RefundObject {
    id: String,
    #[serde(default)]
    metadata: BTreeMap<String, String>,
}

fn object<T: DeserializeOwned>(webhook: &InboundWebhook) -> Result<T, WebhookError> {
    let envelope: Envelope<T> = serde_json::from_slice(&webhook.payload)?;
    Ok(envelope.data.object)
}

/// Routes verified gateway events to the payment and refund paths.
///
/// | event type                        | effect                          |
/// |-----------------------------------|---------------------------------|
/// | `payment_intent.succeeded`        | payment succeeded, order paid   |
/// | `payment_intent.payment_failed`   | payment failed, order failed    |
/// | `payment_intent.canceled`         | payment and order cancelled     |
/// | `payment_intent.requires_action`  | payment status only             |
/// | `payment_intent.processing`       | payment status only             |
/// | `refund.succeeded`                | refund completed, order refunded|
///
/// Other types are acknowledged and ignored.
#[derive(Clone)]
pub struct WebhookProcessor {
    clock: Arc<dyn Clock>,
}

impl WebhookProcessor {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }

    fn intent_status(event_type: &str) -> Option<PaymentStatus> {
        match event_type {
            "payment_intent.succeeded" => Some(PaymentStatus::Succeeded),
            "payment_intent.payment_failed" => Some(PaymentStatus::Failed),
            "payment_intent.canceled" => Some(PaymentStatus::Canceled),
            "payment_intent.requires_action" => Some(PaymentStatus::RequiresAction),
            "payment_intent.processing" => Some(PaymentStatus::Processing),
            _ => None,
        }
    }

    async fn payment_intent(
        &self,
        uow: &mut dyn UnitOfWork,
        webhook: &InboundWebhook,
        status: PaymentStatus,
    ) -> Result<(), WebhookError> {
        let intent: IntentObject = object(webhook)?;
        let error = intent.last_payment_error.unwrap_or_default();
        let update = GatewayUpdate {
            status,
            charge_id: intent.latest_charge,
            receipt_url: None,
            failure_message: error.message,
            failure_code: error.code,
        };
        apply_gateway_update(uow, &intent.id, update, self.clock.now()).await?;
        Ok(())
    }

    async fn refund_succeeded(&self, uow: &mut dyn UnitOfWork, webhook: &InboundWebhook) -> Result<(), WebhookError> {
        let refund: RefundObject = object(webhook)?;
        let hint = refund
            .metadata
            .get("refund_id")
            .and_then(|id| id.parse::<RefundId>().ok());
        if !complete_from_gateway(uow, &refund.id, hint, self.clock.now()).await? {
            warn!(gateway_refund_id = %refund.id, "refund webhook for unknown refund, ignoring");
        }
        Ok(())
    }
}

#[async_trait]
impl WebhookHandler for WebhookProcessor {
    async fn handle(&self, uow: &mut dyn UnitOfWork, webhook: &InboundWebhook) -> Result<(), WebhookError> {
        if webhook.event_id.trim().is_empty() {
            return Err(WebhookError::InvalidEvent("missing event id".to_string()));
        }
        if let Some(status) = Self::intent_status(&webhook.event_type) {
            return self.payment_intent(uow, webhook, status).await;
        }
        match webhook.event_type.as_str() {
            "refund.succeeded" => self.refund_succeeded(uow, webhook).await,
            other => {
                debug!(event_type = other, "ignoring webhook type");
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration as StdDuration;

    use chrono::{DateTime, TimeZone, Utc};
    use serde_json::json;

    use orderflow_core::{ManualClock, UserId};
    use orderflow_orders::{Order, OrderStatus};

    use crate::catalog::InMemoryCatalog;
    use crate::config::OrderSettings;
    use crate::gateway::InMemoryGateway;
    use crate::services::{CreateOrderRequest, OrderService, PaymentService};
    use crate::store::InMemoryStore;
    use crate::webhooks::{WebhookDeduplicator, WebhookOutcome};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 7, 1, 9, 0, 0).unwrap()
    }

    struct Fixture {
        store: InMemoryStore,
        orders: OrderService,
        payments: PaymentService,
        dedup: WebhookDeduplicator,
        processor: WebhookProcessor,
        catalog: Arc<InMemoryCatalog>,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(start()));
        let catalog = Arc::new(InMemoryCatalog::new());
        Fixture {
            orders: OrderService::new(Arc::new(store.clone()), catalog.clone(), clock.clone(), OrderSettings::default()),
            payments: PaymentService::new(
                Arc::new(store.clone()),
                Arc::new(InMemoryGateway::new()),
                clock.clone(),
                StdDuration::from_secs(1),
            ),
            dedup: WebhookDeduplicator::new(Arc::new(store.clone()), clock.clone()),
            processor: WebhookProcessor::new(clock),
            store,
            catalog,
        }
    }

    async fn pending_order(f: &Fixture) -> (Order, String) {
        let user = UserId::new();
        let course = f.catalog.add_course("Lifetimes", 2_500);
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
        let started = f.payments.initiate_payment(order.id_typed(), user).await.unwrap();
        (order, started.payment.gateway_transaction_id().to_string())
    }

    fn intent_event(id: &str, event_type: &str, object: serde_json::Value) -> InboundWebhook {
        let body = json!({ "id": id, "type": event_type, "data": { "object": object } });
        InboundWebhook::new(id, event_type, body.to_string().into_bytes())
    }

    async fn status_of(f: &Fixture, order: &Order) -> OrderStatus {
        f.orders.get_order(order.id_typed(), order.user_id()).await.unwrap().status()
    }

    #[tokio::test]
    async fn succeeded_pays_the_order_and_records_the_charge() {
        let f = fixture();
        let (order, intent) = pending_order(&f).await;

        let webhook = intent_event(
            "evt_1",
            "payment_intent.succeeded",
            json!({ "id": intent, "latest_charge": "ch_9" }),
        );
        let outcome = f.dedup.accept(&webhook, &f.processor).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(status_of(&f, &order).await, OrderStatus::Paid);
        let payment = f.payments.payments_for_order(order.id_typed(), order.user_id()).await.unwrap().remove(0);
        assert_eq!(payment.status(), PaymentStatus::Succeeded);
        assert_eq!(payment.charge_id(), Some("ch_9"));
    }

    #[tokio::test]
    async fn payment_failure_carries_the_gateway_message() {
        let f = fixture();
        let (order, intent) = pending_order(&f).await;

        let webhook = intent_event(
            "evt_2",
            "payment_intent.payment_failed",
            json!({ "id": intent, "last_payment_error": { "message": "card declined", "code": "card_declined" } }),
        );
        f.dedup.accept(&webhook, &f.processor).await.unwrap();

        let stored = f.orders.get_order(order.id_typed(), order.user_id()).await.unwrap();
        assert_eq!(stored.status(), OrderStatus::Failed);
        assert_eq!(stored.state().reason(), Some("card declined"));
    }

    #[tokio::test]
    async fn late_failure_after_success_keeps_the_order_paid() {
        let f = fixture();
        let (order, intent) = pending_order(&f).await;

        f.dedup
            .accept(&intent_event("evt_3", "payment_intent.succeeded", json!({ "id": intent })), &f.processor)
            .await
            .unwrap();
        f.dedup
            .accept(&intent_event("evt_4", "payment_intent.payment_failed", json!({ "id": intent })), &f.processor)
            .await
            .unwrap();

        assert_eq!(status_of(&f, &order).await, OrderStatus::Paid);
        let payment = f.payments.payments_for_order(order.id_typed(), order.user_id()).await.unwrap().remove(0);
        assert_eq!(payment.status(), PaymentStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_intent_leaves_the_row_open() {
        let f = fixture();
        let webhook = intent_event("evt_5", "payment_intent.succeeded", json!({ "id": "pi_missing" }));

        let outcome = f.dedup.accept(&webhook, &f.processor).await.unwrap();

        assert_eq!(outcome, WebhookOutcome::HandlerFailed);
        assert!(!f.store.webhook("evt_5").await.unwrap().processed);
    }

    #[tokio::test]
    async fn unknown_types_are_stamped_processed() {
        let f = fixture();
        let webhook = InboundWebhook::new("evt_6", "customer.created", b"{}".to_vec());

        assert_eq!(f.dedup.accept(&webhook, &f.processor).await.unwrap(), WebhookOutcome::Processed);
        assert!(f.store.webhook("evt_6").await.unwrap().processed);
    }

    #[tokio::test]
    async fn malformed_payload_is_a_handler_failure() {
        let f = fixture();
        let webhook = InboundWebhook::new("evt_7", "payment_intent.succeeded", b"not json".to_vec());

        assert_eq!(f.dedup.accept(&webhook, &f.processor).await.unwrap(), WebhookOutcome::HandlerFailed);
    }

    #[tokio::test]
    async fn processing_event_touches_only_the_payment() {
        let f = fixture();
        let (order, intent) = pending_order(&f).await;
        let before = f.store.outbox_rows().await.len();

        f.dedup
            .accept(&intent_event("evt_8", "payment_intent.processing", json!({ "id": intent })), &f.processor)
            .await
            .unwrap();

        assert_eq!(status_of(&f, &order).await, OrderStatus::PendingPayment);
        let rows = f.store.outbox_rows().await;
        assert_eq!(rows.len(), before + 1);
        assert_eq!(rows[before].event_type, "payment.processing");
    }
}
