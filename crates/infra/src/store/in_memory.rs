use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, OwnedMutexGuard};

use orderflow_core::{
    AggregateRoot, CouponId, ExpectedVersion, OrderId, PaymentId, RefundId, UserId,
};
use orderflow_coupons::{Coupon, CouponCode, CouponRedemption};
use orderflow_events::{NewOutboxEvent, OutboxEvent};
use orderflow_orders::{Order, OrderStatus};
use orderflow_payments::{Payment, RefundRequest, RefundStatus};

use super::{
    OrderPage, OutboxStats, OutboxStore, RefundPage, RefundStats, Store, StoreError, TimeRange, UnitOfWork,
    WebhookRecord,
};

#[derive(Debug, Default, Clone)]
struct Tables {
    orders: BTreeMap<OrderId, Order>,
    coupons: BTreeMap<CouponId, Coupon>,
    redemptions: Vec<CouponRedemption>,
    payments: Vec<Payment>,
    refunds: Vec<RefundRequest>,
    outbox: Vec<OutboxEvent>,
    last_outbox_id: i64,
    webhooks: BTreeMap<String, WebhookRecord>,
    stuck_orders: BTreeSet<OrderId>,
}

/// In-memory store.
///
/// Intended for tests/dev. A unit of work holds the store lock for its whole
/// lifetime and mutates a private copy of the tables; commit swaps the copy
/// in, drop throws it away.
#[derive(Debug, Default, Clone)]
pub struct InMemoryStore {
    tables: Arc<Mutex<Tables>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every outbox row ever written, in id order.
    pub async fn outbox_rows(&self) -> Vec<OutboxEvent> {
        self.tables.lock().await.outbox.clone()
    }

    pub async fn redemptions(&self) -> Vec<CouponRedemption> {
        self.tables.lock().await.redemptions.clone()
    }

    pub async fn refunds(&self) -> Vec<RefundRequest> {
        self.tables.lock().await.refunds.clone()
    }

    pub async fn webhook(&self, event_id: &str) -> Option<WebhookRecord> {
        self.tables.lock().await.webhooks.get(event_id).cloned()
    }

    /// Every later update of this order fails with a database error.
    pub async fn fail_order_updates(&self, id: OrderId) {
        self.tables.lock().await.stuck_orders.insert(id);
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let guard = self.tables.clone().lock_owned().await;
        let work = guard.clone();
        Ok(Box::new(InMemoryUnitOfWork { guard, work }))
    }
}

struct InMemoryUnitOfWork {
    guard: OwnedMutexGuard<Tables>,
    work: Tables,
}

fn refund_page<'a>(refunds: impl Iterator<Item = &'a RefundRequest>, limit: u32, offset: u32) -> RefundPage {
    let mut refunds: Vec<&RefundRequest> = refunds.collect();
    refunds.sort_by(|a, b| {
        b.requested_at()
            .cmp(&a.requested_at())
            .then_with(|| b.id_typed().cmp(&a.id_typed()))
    });
    let total = refunds.len() as u64;
    let refunds = refunds
        .into_iter()
        .skip(offset as usize)
        .take(limit as usize)
        .cloned()
        .collect();
    RefundPage { refunds, total }
}

fn version_check(kind: &str, stored: u64, expected: ExpectedVersion) -> Result<(), StoreError> {
    expected
        .check(stored)
        .map_err(|e| StoreError::Concurrency(format!("{kind}: {e}")))
}

#[async_trait]
impl UnitOfWork for InMemoryUnitOfWork {
    async fn order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        Ok(self.work.orders.get(&id).cloned())
    }

    async fn order_for_update(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.order(id).await
    }

    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let id = order.id_typed();
        if self.work.orders.contains_key(&id) {
            return Err(StoreError::Conflict(format!("order {id} already exists")));
        }
        self.work.orders.insert(id, order.clone());
        Ok(())
    }

    async fn update_order(&mut self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError> {
        let id = order.id_typed();
        if self.work.stuck_orders.contains(&id) {
            return Err(StoreError::Database(format!("order {id}: write rejected")));
        }
        let stored = self
            .work
            .orders
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("order {id}")))?;
        version_check("order", stored.version(), expected)?;
        *stored = order.clone();
        Ok(())
    }

    async fn orders_for_user(&mut self, user_id: UserId, limit: u32, offset: u32) -> Result<OrderPage, StoreError> {
        let mut orders: Vec<&Order> = self
            .work
            .orders
            .values()
            .filter(|o| o.user_id() == user_id)
            .collect();
        orders.sort_by(|a, b| {
            b.created_at()
                .cmp(&a.created_at())
                .then_with(|| b.id_typed().cmp(&a.id_typed()))
        });
        let total = orders.len() as u64;
        let orders = orders
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .cloned()
            .collect();
        Ok(OrderPage { orders, total })
    }

    async fn overdue_order_ids(&mut self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>, StoreError> {
        let mut overdue: Vec<&Order> = self
            .work
            .orders
            .values()
            .filter(|o| o.status() == OrderStatus::PendingPayment && o.expires_at() <= cutoff)
            .collect();
        overdue.sort_by_key(|o| o.expires_at());
        Ok(overdue.into_iter().take(limit).map(|o| o.id_typed()).collect())
    }

    async fn user_has_paid_order(&mut self, user_id: UserId) -> Result<bool, StoreError> {
        Ok(self.work.orders.values().any(|o| {
            o.user_id() == user_id && matches!(o.status(), OrderStatus::Paid | OrderStatus::Refunded)
        }))
    }

    async fn coupon_by_code(&mut self, code: &CouponCode) -> Result<Option<Coupon>, StoreError> {
        Ok(self.work.coupons.values().find(|c| c.code() == code).cloned())
    }

    async fn active_coupons(&mut self) -> Result<Vec<Coupon>, StoreError> {
        Ok(self
            .work
            .coupons
            .values()
            .filter(|c| c.is_active())
            .cloned()
            .collect())
    }

    async fn insert_coupon(&mut self, coupon: &Coupon) -> Result<(), StoreError> {
        if self.work.coupons.values().any(|c| c.code() == coupon.code()) {
            return Err(StoreError::Conflict(format!("coupon code {} already exists", coupon.code())));
        }
        if self.work.coupons.contains_key(&coupon.id()) {
            return Err(StoreError::Conflict(format!("coupon {} already exists", coupon.id())));
        }
        self.work.coupons.insert(coupon.id(), coupon.clone());
        Ok(())
    }

    async fn increment_coupon_redemptions(&mut self, id: CouponId) -> Result<bool, StoreError> {
        let coupon = self
            .work
            .coupons
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(format!("coupon {id}")))?;
        Ok(coupon.record_redemption().is_ok())
    }

    async fn insert_redemption(&mut self, redemption: &CouponRedemption) -> Result<(), StoreError> {
        if self
            .work
            .redemptions
            .iter()
            .any(|r| r.order_id == redemption.order_id)
        {
            return Err(StoreError::Conflict(format!(
                "order {} already has a coupon redemption",
                redemption.order_id
            )));
        }
        self.work.redemptions.push(redemption.clone());
        Ok(())
    }

    async fn user_redemption_count(&mut self, coupon_id: CouponId, user_id: UserId) -> Result<u32, StoreError> {
        let count = self
            .work
            .redemptions
            .iter()
            .filter(|r| r.coupon_id == coupon_id && r.user_id == user_id)
            .count();
        Ok(count as u32)
    }

    async fn redemption_for_order(&mut self, order_id: OrderId) -> Result<Option<CouponRedemption>, StoreError> {
        Ok(self
            .work
            .redemptions
            .iter()
            .find(|r| r.order_id == order_id)
            .cloned())
    }

    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError> {
        if self.work.payments.iter().any(|p| {
            p.id_typed() == payment.id_typed()
                || p.gateway_transaction_id() == payment.gateway_transaction_id()
        }) {
            return Err(StoreError::Conflict(format!(
                "payment {} already exists",
                payment.gateway_transaction_id()
            )));
        }
        self.work.payments.push(payment.clone());
        Ok(())
    }

    async fn update_payment(&mut self, payment: &Payment, expected: ExpectedVersion) -> Result<(), StoreError> {
        let id = payment.id_typed();
        let stored = self
            .work
            .payments
            .iter_mut()
            .find(|p| p.id_typed() == id)
            .ok_or_else(|| StoreError::NotFound(format!("payment {id}")))?;
        version_check("payment", stored.version(), expected)?;
        *stored = payment.clone();
        Ok(())
    }

    async fn payment(&mut self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        Ok(self.work.payments.iter().find(|p| p.id_typed() == id).cloned())
    }

    async fn payment_by_gateway_id_for_update(&mut self, gateway_transaction_id: &str) -> Result<Option<Payment>, StoreError> {
        Ok(self
            .work
            .payments
            .iter()
            .find(|p| p.gateway_transaction_id() == gateway_transaction_id)
            .cloned())
    }

    async fn payments_for_order(&mut self, order_id: OrderId) -> Result<Vec<Payment>, StoreError> {
        Ok(self
            .work
            .payments
            .iter()
            .filter(|p| p.order_id() == order_id)
            .cloned()
            .collect())
    }

    async fn insert_refund(&mut self, refund: &RefundRequest) -> Result<(), StoreError> {
        if self.work.refunds.iter().any(|r| r.id_typed() == refund.id_typed()) {
            return Err(StoreError::Conflict(format!("refund {} already exists", refund.id_typed())));
        }
        self.work.refunds.push(refund.clone());
        Ok(())
    }

    async fn update_refund(&mut self, refund: &RefundRequest, expected: ExpectedVersion) -> Result<(), StoreError> {
        let id = refund.id_typed();
        let stored = self
            .work
            .refunds
            .iter_mut()
            .find(|r| r.id_typed() == id)
            .ok_or_else(|| StoreError::NotFound(format!("refund {id}")))?;
        version_check("refund", stored.version(), expected)?;
        *stored = refund.clone();
        Ok(())
    }

    async fn refund(&mut self, id: RefundId) -> Result<Option<RefundRequest>, StoreError> {
        Ok(self.work.refunds.iter().find(|r| r.id_typed() == id).cloned())
    }

    async fn refund_for_update(&mut self, id: RefundId) -> Result<Option<RefundRequest>, StoreError> {
        self.refund(id).await
    }

    async fn refund_by_gateway_id_for_update(&mut self, gateway_refund_id: &str) -> Result<Option<RefundRequest>, StoreError> {
        Ok(self
            .work
            .refunds
            .iter()
            .find(|r| r.gateway_refund_id() == Some(gateway_refund_id))
            .cloned())
    }

    async fn refunds_for_order(&mut self, order_id: OrderId) -> Result<Vec<RefundRequest>, StoreError> {
        Ok(self
            .work
            .refunds
            .iter()
            .filter(|r| r.order_id() == order_id)
            .cloned()
            .collect())
    }

    async fn refunds_for_user(&mut self, user_id: UserId, limit: u32, offset: u32) -> Result<RefundPage, StoreError> {
        Ok(refund_page(
            self.work.refunds.iter().filter(|r| r.user_id() == user_id),
            limit,
            offset,
        ))
    }

    async fn refunds_page(&mut self, limit: u32, offset: u32) -> Result<RefundPage, StoreError> {
        Ok(refund_page(self.work.refunds.iter(), limit, offset))
    }

    async fn refund_stats(&mut self, range: Option<TimeRange>) -> Result<RefundStats, StoreError> {
        let mut stats = RefundStats::default();
        let in_range = self
            .work
            .refunds
            .iter()
            .filter(|r| range.is_none_or(|range| range.contains(r.requested_at())));
        for refund in in_range {
            stats.total_refunds += 1;
            stats.total_amount += refund.amount();
            match refund.status() {
                RefundStatus::Processed => stats.processed_refunds += 1,
                RefundStatus::Pending => stats.pending_refunds += 1,
                RefundStatus::Rejected => stats.rejected_refunds += 1,
                RefundStatus::Failed => stats.failed_refunds += 1,
                RefundStatus::Approved => {}
            }
        }
        if stats.total_refunds > 0 {
            stats.average_amount = stats.total_amount / stats.total_refunds as i64;
        }
        Ok(stats)
    }

    async fn append_outbox(&mut self, event: NewOutboxEvent) -> Result<i64, StoreError> {
        self.work.last_outbox_id += 1;
        let id = self.work.last_outbox_id;
        self.work.outbox.push(OutboxEvent::from_new(id, event));
        Ok(id)
    }

    async fn webhook_for_update(&mut self, event_id: &str) -> Result<Option<WebhookRecord>, StoreError> {
        Ok(self.work.webhooks.get(event_id).cloned())
    }

    async fn insert_webhook(&mut self, record: &WebhookRecord) -> Result<bool, StoreError> {
        if self.work.webhooks.contains_key(&record.event_id) {
            return Ok(false);
        }
        self.work
            .webhooks
            .insert(record.event_id.clone(), record.clone());
        Ok(true)
    }

    async fn mark_webhook_processed(&mut self, event_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        let record = self
            .work
            .webhooks
            .get_mut(event_id)
            .ok_or_else(|| StoreError::NotFound(format!("webhook {event_id}")))?;
        if !record.processed {
            record.processed = true;
            record.processed_at = Some(at);
        }
        Ok(())
    }

    async fn unprocessed_webhooks(&mut self, limit: usize) -> Result<Vec<WebhookRecord>, StoreError> {
        let mut rows: Vec<&WebhookRecord> = self.work.webhooks.values().filter(|w| !w.processed).collect();
        rows.sort_by_key(|w| w.received_at);
        Ok(rows.into_iter().take(limit).cloned().collect())
    }

    async fn purge_processed_webhooks(&mut self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let before = self.work.webhooks.len();
        self.work
            .webhooks
            .retain(|_, w| !(w.processed && w.received_at < cutoff));
        Ok((before - self.work.webhooks.len()) as u64)
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        let InMemoryUnitOfWork { mut guard, work } = *self;
        *guard = work;
        Ok(())
    }
}

#[async_trait]
impl OutboxStore for InMemoryStore {
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let tables = self.tables.lock().await;
        Ok(tables
            .outbox
            .iter()
            .filter(|e| e.is_pending())
            .take(limit)
            .cloned()
            .collect())
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        let mut tables = self.tables.lock().await;
        if let Some(row) = tables.outbox.iter_mut().find(|e| e.id == id) {
            if row.published_at.is_none() {
                row.published_at = Some(at);
            }
        }
        Ok(())
    }

    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let tables = self.tables.lock().await;
        let pending = tables.outbox.iter().filter(|e| e.is_pending()).count() as u64;
        Ok(OutboxStats {
            pending,
            published: tables.outbox.len() as u64 - pending,
        })
    }

    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut tables = self.tables.lock().await;
        let before = tables.outbox.len();
        tables
            .outbox
            .retain(|e| !matches!(e.published_at, Some(at) if at < cutoff));
        Ok((before - tables.outbox.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn outbox_event(n: u8) -> NewOutboxEvent {
        NewOutboxEvent {
            aggregate_id: Uuid::nil(),
            topic: "order.events".to_string(),
            event_type: format!("order.test_{n}"),
            payload: vec![n],
            created_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[tokio::test]
    async fn dropped_unit_of_work_leaves_no_trace() {
        let store = InMemoryStore::new();
        {
            let mut uow = store.begin().await.unwrap();
            uow.append_outbox(outbox_event(1)).await.unwrap();
        }
        assert!(store.outbox_rows().await.is_empty());

        let mut uow = store.begin().await.unwrap();
        let id = uow.append_outbox(outbox_event(2)).await.unwrap();
        uow.commit().await.unwrap();
        assert_eq!(id, 1);
        assert_eq!(store.outbox_rows().await.len(), 1);
    }

    #[tokio::test]
    async fn outbox_ids_keep_increasing_after_cleanup() {
        let store = InMemoryStore::new();
        let mut uow = store.begin().await.unwrap();
        let first = uow.append_outbox(outbox_event(1)).await.unwrap();
        uow.commit().await.unwrap();

        let at = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();
        store.mark_published(first, at).await.unwrap();
        store.mark_published(first, at + chrono::Duration::days(1)).await.unwrap();
        assert_eq!(store.outbox_rows().await[0].published_at, Some(at));

        let deleted = store
            .delete_published_before(at + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(deleted, 1);

        let mut uow = store.begin().await.unwrap();
        let second = uow.append_outbox(outbox_event(2)).await.unwrap();
        uow.commit().await.unwrap();
        assert!(second > first);
        assert_eq!(store.stats().await.unwrap(), OutboxStats { pending: 1, published: 0 });
    }

    #[tokio::test]
    async fn webhook_insert_is_idempotent() {
        let store = InMemoryStore::new();
        let record = WebhookRecord {
            event_id: "evt_1".to_string(),
            event_type: "payment_intent.succeeded".to_string(),
            payload: b"{}".to_vec(),
            processed: false,
            processed_at: None,
            received_at: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
        };
        let mut uow = store.begin().await.unwrap();
        assert!(uow.insert_webhook(&record).await.unwrap());
        assert!(!uow.insert_webhook(&record).await.unwrap());
        uow.commit().await.unwrap();
    }
}
