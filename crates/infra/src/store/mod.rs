//! Persistence ports.
//!
//! A [`UnitOfWork`] is one database transaction. Services receive it
//! explicitly and pass it down to every repository call that must share the
//! transaction, including the outbox writer. Dropping a unit of work without
//! calling [`UnitOfWork::commit`] rolls it back.
//!
//! Reads named `*_for_update` lock the row until the unit of work ends, which
//! serialises concurrent mutations of the same aggregate.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use orderflow_core::{Classified, CouponId, ErrorClass, ExpectedVersion, OrderId, PaymentId, RefundId, UserId};
use orderflow_coupons::{Coupon, CouponCode, CouponRedemption};
use orderflow_events::{NewOutboxEvent, OutboxEvent};
use orderflow_orders::Order;
use orderflow_payments::{Payment, RefundRequest};

pub mod in_memory;
pub mod postgres;

pub use in_memory::InMemoryStore;
pub use postgres::PostgresStore;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// A unique constraint rejected the write.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The row changed since it was read.
    #[error("concurrent modification: {0}")]
    Concurrency(String),

    #[error("not found: {0}")]
    NotFound(String),

    /// A stored row could not be decoded into a domain value.
    #[error("invalid stored data: {0}")]
    InvalidData(String),

    #[error("database error: {0}")]
    Database(String),
}

impl Classified for StoreError {
    fn class(&self) -> ErrorClass {
        match self {
            StoreError::Conflict(_) | StoreError::Concurrency(_) => ErrorClass::Conflict,
            StoreError::NotFound(_) => ErrorClass::NotFound,
            StoreError::InvalidData(_) | StoreError::Database(_) => ErrorClass::Dependency,
        }
    }

    fn code(&self) -> &'static str {
        match self {
            StoreError::Conflict(_) => "conflict",
            StoreError::Concurrency(_) => "concurrent_modification",
            StoreError::NotFound(_) => "not_found",
            StoreError::InvalidData(_) | StoreError::Database(_) => "storage_unavailable",
        }
    }
}

/// One row of the webhook ledger.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebhookRecord {
    pub event_id: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub processed: bool,
    pub processed_at: Option<DateTime<Utc>>,
    pub received_at: DateTime<Utc>,
}

/// A page of a user's orders, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrderPage {
    pub orders: Vec<Order>,
    pub total: u64,
}

/// A page of refund requests, newest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundPage {
    pub refunds: Vec<RefundRequest>,
    pub total: u64,
}

/// Inclusive bounds on when a refund was requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

impl TimeRange {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        self.from <= at && at <= self.to
    }
}

/// Refund request counts by status. Amounts are in minor units; the average
/// is integer division over every request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct RefundStats {
    pub total_refunds: u64,
    pub total_amount: i64,
    pub processed_refunds: u64,
    pub pending_refunds: u64,
    pub rejected_refunds: u64,
    pub failed_refunds: u64,
    pub average_amount: i64,
}

/// Outbox row counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub published: u64,
}

/// Opens units of work.
#[async_trait]
pub trait Store: Send + Sync {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;
}

/// Repository operations bound to one transaction.
#[async_trait]
pub trait UnitOfWork: Send {
    // Orders (items are stored and loaded with their order).
    async fn order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError>;
    async fn order_for_update(&mut self, id: OrderId) -> Result<Option<Order>, StoreError>;
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError>;
    /// Persist `order` if the stored version still matches `expected`.
    async fn update_order(&mut self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError>;
    async fn orders_for_user(&mut self, user_id: UserId, limit: u32, offset: u32) -> Result<OrderPage, StoreError>;
    /// Orders still awaiting payment whose expiry is at or before `cutoff`.
    async fn overdue_order_ids(&mut self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>, StoreError>;
    /// Whether the user ever had an order reach `paid` (including later refunds).
    async fn user_has_paid_order(&mut self, user_id: UserId) -> Result<bool, StoreError>;

    // Coupons.
    async fn coupon_by_code(&mut self, code: &CouponCode) -> Result<Option<Coupon>, StoreError>;
    async fn active_coupons(&mut self) -> Result<Vec<Coupon>, StoreError>;
    async fn insert_coupon(&mut self, coupon: &Coupon) -> Result<(), StoreError>;
    /// Atomically bump the redemption counter unless it already reached the
    /// global cap. Returns `false` when the cap blocked the increment.
    async fn increment_coupon_redemptions(&mut self, id: CouponId) -> Result<bool, StoreError>;
    /// At most one redemption per order; a second insert is a `Conflict`.
    async fn insert_redemption(&mut self, redemption: &CouponRedemption) -> Result<(), StoreError>;
    async fn user_redemption_count(&mut self, coupon_id: CouponId, user_id: UserId) -> Result<u32, StoreError>;
    async fn redemption_for_order(&mut self, order_id: OrderId) -> Result<Option<CouponRedemption>, StoreError>;

    // Payments.
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError>;
    async fn update_payment(&mut self, payment: &Payment, expected: ExpectedVersion) -> Result<(), StoreError>;
    async fn payment(&mut self, id: PaymentId) -> Result<Option<Payment>, StoreError>;
    async fn payment_by_gateway_id_for_update(&mut self, gateway_transaction_id: &str) -> Result<Option<Payment>, StoreError>;
    /// Oldest first.
    async fn payments_for_order(&mut self, order_id: OrderId) -> Result<Vec<Payment>, StoreError>;

    // Refunds.
    async fn insert_refund(&mut self, refund: &RefundRequest) -> Result<(), StoreError>;
    async fn update_refund(&mut self, refund: &RefundRequest, expected: ExpectedVersion) -> Result<(), StoreError>;
    async fn refund(&mut self, id: RefundId) -> Result<Option<RefundRequest>, StoreError>;
    async fn refund_for_update(&mut self, id: RefundId) -> Result<Option<RefundRequest>, StoreError>;
    async fn refund_by_gateway_id_for_update(&mut self, gateway_refund_id: &str) -> Result<Option<RefundRequest>, StoreError>;
    /// Oldest first.
    async fn refunds_for_order(&mut self, order_id: OrderId) -> Result<Vec<RefundRequest>, StoreError>;
    async fn refunds_for_user(&mut self, user_id: UserId, limit: u32, offset: u32) -> Result<RefundPage, StoreError>;
    /// Every request, for the review queue.
    async fn refunds_page(&mut self, limit: u32, offset: u32) -> Result<RefundPage, StoreError>;
    async fn refund_stats(&mut self, range: Option<TimeRange>) -> Result<RefundStats, StoreError>;

    // Outbox.
    /// Insert one outbox row; returns its id.
    async fn append_outbox(&mut self, event: NewOutboxEvent) -> Result<i64, StoreError>;

    // Webhook ledger.
    async fn webhook_for_update(&mut self, event_id: &str) -> Result<Option<WebhookRecord>, StoreError>;
    /// Insert an unprocessed row. Returns `false` when the id already exists.
    async fn insert_webhook(&mut self, record: &WebhookRecord) -> Result<bool, StoreError>;
    async fn mark_webhook_processed(&mut self, event_id: &str, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn unprocessed_webhooks(&mut self, limit: usize) -> Result<Vec<WebhookRecord>, StoreError>;
    /// Delete processed rows received before `cutoff`; returns how many.
    async fn purge_processed_webhooks(&mut self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn commit(self: Box<Self>) -> Result<(), StoreError>;
}

/// Outbox access for the publisher, outside any business transaction.
#[async_trait]
pub trait OutboxStore: Send + Sync {
    /// Up to `limit` unpublished rows in ascending id order.
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError>;
    /// Idempotent: stamping an already published row is a no-op.
    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError>;
    async fn stats(&self) -> Result<OutboxStats, StoreError>;
    /// Delete published rows older than `cutoff`; returns how many.
    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError>;
}
