//! Postgres-backed store.
//!
//! ## Error Mapping
//!
//! | SQLx Error | PostgreSQL Error Code | StoreError |
//! |------------|----------------------|------------|
//! | Database (unique violation) | `23505` | `Conflict` |
//! | Database (foreign key violation) | `23503` | `InvalidData` |
//! | Database (check constraint violation) | `23514` | `InvalidData` |
//! | Database (other) | Any other | `Database` |
//! | PoolClosed / other | N/A | `Database` |
//!
//! ## Locking
//!
//! `*_for_update` reads use `SELECT ... FOR UPDATE`; updates additionally
//! compare the `version` column so a writer that skipped the lock still
//! cannot overwrite a newer row.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;
use uuid::Uuid;

use orderflow_core::{
    AggregateRoot, CouponId, CourseId, Currency, ExpectedVersion, OrderId, OrderItemId, PaymentId,
    RedemptionId, RefundId, UserId,
};
use orderflow_coupons::{Applicability, Coupon, CouponCode, CouponRedemption, Discount, NewCoupon};
use orderflow_events::{NewOutboxEvent, OutboxEvent};
use orderflow_orders::{Order, OrderItem, OrderParts, OrderState, OrderStatus};
use orderflow_payments::{Payment, PaymentParts, RefundParts, RefundRequest};

use super::{
    OrderPage, OutboxStats, OutboxStore, RefundPage, RefundStats, Store, StoreError, TimeRange, UnitOfWork,
    WebhookRecord,
};

const SCHEMA: &str = include_str!("../../migrations/0001_init.sql");

/// Postgres store over a shared connection pool.
#[derive(Debug, Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema. Every statement is idempotent.
    #[instrument(skip(self), err)]
    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(SCHEMA)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("migrate", e))?;
        Ok(())
    }
}

#[async_trait]
impl Store for PostgresStore {
    async fn begin(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin", e))?;
        Ok(Box::new(PgUnitOfWork { tx }))
    }
}

struct PgUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

const ORDER_COLUMNS: &str = r#"
    id, user_id, customer_email, customer_name, currency, subtotal_amount,
    discount_amount, total_amount, coupon_id, status, status_reason, paid_at,
    failed_at, cancelled_at, refunded_at, payment_intent_id, expires_at,
    metadata, created_at, updated_at, version
"#;

const COUPON_COLUMNS: &str = r#"
    id, code, name, description, discount_type, percent_off, amount_off,
    discount_currency, max_redemptions, max_redemptions_per_user,
    redemption_count, minimum_amount, applicability, applicable_ids,
    first_time_only, valid_from, expires_at, is_active
"#;

const PAYMENT_COLUMNS: &str = r#"
    id, order_id, user_id, gateway_transaction_id, amount, currency, status,
    charge_id, receipt_url, failure_message, failure_code, processed_at,
    metadata, created_at, updated_at, version
"#;

const REFUND_COLUMNS: &str = r#"
    id, order_id, user_id, payment_id, amount, currency, reason_category,
    reason_text, status, admin_reason, gateway_refund_id, requested_at,
    decided_at, processed_at, version
"#;

const WEBHOOK_COLUMNS: &str = "event_id, event_type, payload, processed, processed_at, received_at";

fn expected_version(expected: ExpectedVersion) -> Option<i64> {
    match expected {
        ExpectedVersion::Any => None,
        ExpectedVersion::Exact(v) => Some(v as i64),
    }
}

fn get<'r, T>(row: &'r PgRow, column: &str) -> Result<T, StoreError>
where
    T: sqlx::Decode<'r, Postgres> + sqlx::Type<Postgres>,
{
    row.try_get(column)
        .map_err(|e| StoreError::InvalidData(format!("column {column}: {e}")))
}

fn parse<T>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T: core::str::FromStr,
    T::Err: core::fmt::Display,
{
    raw.parse::<T>()
        .map_err(|e| StoreError::InvalidData(format!("column {column}: {e}")))
}

fn milestone(row: &PgRow, column: &str) -> Result<DateTime<Utc>, StoreError> {
    get::<Option<DateTime<Utc>>>(row, column)?
        .ok_or_else(|| StoreError::InvalidData(format!("column {column} is null for its status")))
}

fn order_state(row: &PgRow) -> Result<OrderState, StoreError> {
    let status: String = get(row, "status")?;
    let reason: Option<String> = get(row, "status_reason")?;
    Ok(match parse::<OrderStatus>("status", &status)? {
        OrderStatus::Created => OrderState::Created,
        OrderStatus::PendingPayment => OrderState::PendingPayment,
        OrderStatus::Paid => OrderState::Paid {
            paid_at: milestone(row, "paid_at")?,
        },
        OrderStatus::Failed => OrderState::Failed {
            failed_at: milestone(row, "failed_at")?,
            reason,
        },
        OrderStatus::Cancelled => OrderState::Cancelled {
            cancelled_at: milestone(row, "cancelled_at")?,
            reason,
        },
        OrderStatus::Refunded => OrderState::Refunded {
            refunded_at: milestone(row, "refunded_at")?,
        },
    })
}

fn order_from_row(row: &PgRow, items: Vec<OrderItem>) -> Result<Order, StoreError> {
    let currency: String = get(row, "currency")?;
    let metadata: Json<BTreeMap<String, String>> = get(row, "metadata")?;
    let version: i64 = get(row, "version")?;
    Ok(Order::restore(OrderParts {
        id: OrderId::from_uuid(get(row, "id")?),
        user_id: UserId::from_uuid(get(row, "user_id")?),
        customer_email: get(row, "customer_email")?,
        customer_name: get(row, "customer_name")?,
        currency: parse::<Currency>("currency", currency.trim())?,
        subtotal_amount: get(row, "subtotal_amount")?,
        discount_amount: get(row, "discount_amount")?,
        total_amount: get(row, "total_amount")?,
        coupon_id: get::<Option<Uuid>>(row, "coupon_id")?.map(CouponId::from_uuid),
        state: order_state(row)?,
        payment_intent_id: get(row, "payment_intent_id")?,
        expires_at: get(row, "expires_at")?,
        metadata: metadata.0,
        items,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        version: version as u64,
    }))
}

fn item_from_row(row: &PgRow) -> Result<OrderItem, StoreError> {
    let item_type: String = get(row, "item_type")?;
    let quantity: i32 = get(row, "quantity")?;
    Ok(OrderItem {
        id: OrderItemId::from_uuid(get(row, "id")?),
        catalog_id: CourseId::from_uuid(get(row, "catalog_id")?),
        item_type: parse("item_type", &item_type)?,
        title: get(row, "title")?,
        description: get(row, "description")?,
        unit_price: get(row, "unit_price")?,
        original_price: get(row, "original_price")?,
        quantity: quantity as u32,
    })
}

fn coupon_from_row(row: &PgRow) -> Result<Coupon, StoreError> {
    let discount_type: String = get(row, "discount_type")?;
    let discount = match discount_type.as_str() {
        "percentage" => {
            let percent_off: Option<i16> = get(row, "percent_off")?;
            let percent_off = percent_off
                .and_then(|p| u8::try_from(p).ok())
                .ok_or_else(|| StoreError::InvalidData("percent_off out of range".to_string()))?;
            Discount::Percentage { percent_off }
        }
        "fixed_amount" => {
            let amount_off: Option<i64> = get(row, "amount_off")?;
            let currency: Option<String> = get(row, "discount_currency")?;
            Discount::FixedAmount {
                amount_off: amount_off
                    .ok_or_else(|| StoreError::InvalidData("amount_off is null".to_string()))?,
                currency: parse("discount_currency", currency.as_deref().unwrap_or_default().trim())?,
            }
        }
        other => {
            return Err(StoreError::InvalidData(format!("unknown discount type {other:?}")));
        }
    };

    let mode: String = get(row, "applicability")?;
    let ids: Vec<Uuid> = get(row, "applicable_ids")?;
    let applicability = match mode.as_str() {
        "all" => Applicability::All,
        "specific" => Applicability::Specific(ids.into_iter().map(CourseId::from_uuid).collect()),
        "category" => Applicability::Category(ids),
        other => {
            return Err(StoreError::InvalidData(format!("unknown applicability {other:?}")));
        }
    };

    let cap = |column: &str| -> Result<Option<u32>, StoreError> {
        Ok(get::<Option<i32>>(row, column)?.map(|v| v.max(0) as u32))
    };
    let redemption_count: i32 = get(row, "redemption_count")?;

    Coupon::restore(
        NewCoupon {
            id: CouponId::from_uuid(get(row, "id")?),
            code: get(row, "code")?,
            name: get(row, "name")?,
            description: get(row, "description")?,
            discount,
            max_redemptions: cap("max_redemptions")?,
            max_redemptions_per_user: cap("max_redemptions_per_user")?,
            minimum_amount: get(row, "minimum_amount")?,
            applicability,
            first_time_only: get(row, "first_time_only")?,
            valid_from: get(row, "valid_from")?,
            expires_at: get(row, "expires_at")?,
            is_active: get(row, "is_active")?,
        },
        redemption_count.max(0) as u32,
    )
    .map_err(|e| StoreError::InvalidData(format!("coupon row: {e}")))
}

fn redemption_from_row(row: &PgRow) -> Result<CouponRedemption, StoreError> {
    Ok(CouponRedemption {
        id: RedemptionId::from_uuid(get(row, "id")?),
        coupon_id: CouponId::from_uuid(get(row, "coupon_id")?),
        user_id: UserId::from_uuid(get(row, "user_id")?),
        order_id: OrderId::from_uuid(get(row, "order_id")?),
        discount_amount: get(row, "discount_amount")?,
        redeemed_at: get(row, "redeemed_at")?,
    })
}

fn payment_from_row(row: &PgRow) -> Result<Payment, StoreError> {
    let currency: String = get(row, "currency")?;
    let status: String = get(row, "status")?;
    let metadata: Json<BTreeMap<String, String>> = get(row, "metadata")?;
    let version: i64 = get(row, "version")?;
    Ok(Payment::restore(PaymentParts {
        id: PaymentId::from_uuid(get(row, "id")?),
        order_id: OrderId::from_uuid(get(row, "order_id")?),
        user_id: UserId::from_uuid(get(row, "user_id")?),
        gateway_transaction_id: get(row, "gateway_transaction_id")?,
        amount: get(row, "amount")?,
        currency: parse("currency", currency.trim())?,
        status: parse("status", &status)?,
        charge_id: get(row, "charge_id")?,
        receipt_url: get(row, "receipt_url")?,
        failure_message: get(row, "failure_message")?,
        failure_code: get(row, "failure_code")?,
        processed_at: get(row, "processed_at")?,
        metadata: metadata.0,
        created_at: get(row, "created_at")?,
        updated_at: get(row, "updated_at")?,
        version: version as u64,
    }))
}

fn refund_from_row(row: &PgRow) -> Result<RefundRequest, StoreError> {
    let currency: String = get(row, "currency")?;
    let reason: String = get(row, "reason_category")?;
    let status: String = get(row, "status")?;
    let version: i64 = get(row, "version")?;
    Ok(RefundRequest::restore(RefundParts {
        id: RefundId::from_uuid(get(row, "id")?),
        order_id: OrderId::from_uuid(get(row, "order_id")?),
        user_id: UserId::from_uuid(get(row, "user_id")?),
        payment_id: PaymentId::from_uuid(get(row, "payment_id")?),
        amount: get(row, "amount")?,
        currency: parse("currency", currency.trim())?,
        reason: parse("reason_category", &reason)?,
        reason_text: get(row, "reason_text")?,
        status: parse("status", &status)?,
        admin_reason: get(row, "admin_reason")?,
        gateway_refund_id: get(row, "gateway_refund_id")?,
        requested_at: get(row, "requested_at")?,
        decided_at: get(row, "decided_at")?,
        processed_at: get(row, "processed_at")?,
        version: version as u64,
    }))
}

fn webhook_from_row(row: &PgRow) -> Result<WebhookRecord, StoreError> {
    Ok(WebhookRecord {
        event_id: get(row, "event_id")?,
        event_type: get(row, "event_type")?,
        payload: get(row, "payload")?,
        processed: get(row, "processed")?,
        processed_at: get(row, "processed_at")?,
        received_at: get(row, "received_at")?,
    })
}

fn outbox_from_row(row: &PgRow) -> Result<OutboxEvent, StoreError> {
    Ok(OutboxEvent {
        id: get(row, "id")?,
        aggregate_id: get(row, "aggregate_id")?,
        topic: get(row, "topic")?,
        event_type: get(row, "event_type")?,
        payload: get(row, "payload")?,
        created_at: get(row, "created_at")?,
        published_at: get(row, "published_at")?,
    })
}

impl PgUnitOfWork {
    async fn load_items(&mut self, order_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<OrderItem>>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, order_id, catalog_id, item_type, title, description,
                   unit_price, original_price, quantity
            FROM order_items
            WHERE order_id = ANY($1)
            ORDER BY order_id, position ASC
            "#,
        )
        .bind(order_ids)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("load_items", e))?;

        let mut items: HashMap<Uuid, Vec<OrderItem>> = HashMap::new();
        for row in &rows {
            let order_id: Uuid = get(row, "order_id")?;
            items.entry(order_id).or_default().push(item_from_row(row)?);
        }
        Ok(items)
    }

    async fn load_order(&mut self, id: OrderId, lock: bool) -> Result<Option<Order>, StoreError> {
        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE id = $1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_order", e))?;

        let Some(row) = row else {
            return Ok(None);
        };
        let mut items = self.load_items(&[*id.as_uuid()]).await?;
        let order = order_from_row(&row, items.remove(id.as_uuid()).unwrap_or_default())?;
        Ok(Some(order))
    }

    async fn load_refund(&mut self, column: &str, value: Uuid, lock: bool) -> Result<Option<RefundRequest>, StoreError> {
        let sql = format!(
            "SELECT {REFUND_COLUMNS} FROM refund_requests WHERE {column} = $1{}",
            if lock { " FOR UPDATE" } else { "" }
        );
        let row = sqlx::query(&sql)
            .bind(value)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("load_refund", e))?;
        row.as_ref().map(refund_from_row).transpose()
    }
}

#[async_trait]
impl UnitOfWork for PgUnitOfWork {
    async fn order(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.load_order(id, false).await
    }

    #[instrument(skip(self), fields(order_id = %id), err)]
    async fn order_for_update(&mut self, id: OrderId) -> Result<Option<Order>, StoreError> {
        self.load_order(id, true).await
    }

    #[instrument(skip(self, order), fields(order_id = %order.id_typed()), err)]
    async fn insert_order(&mut self, order: &Order) -> Result<(), StoreError> {
        let state = order.state();
        sqlx::query(
            r#"
            INSERT INTO orders (
                id, user_id, customer_email, customer_name, currency, subtotal_amount,
                discount_amount, total_amount, coupon_id, status, status_reason, paid_at,
                failed_at, cancelled_at, refunded_at, payment_intent_id, expires_at,
                metadata, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18, $19, $20, $21)
            "#,
        )
        .bind(order.id_typed().as_uuid())
        .bind(order.user_id().as_uuid())
        .bind(order.customer_email())
        .bind(order.customer_name())
        .bind(order.currency().as_str())
        .bind(order.subtotal_amount())
        .bind(order.discount_amount())
        .bind(order.total_amount())
        .bind(order.coupon_id().map(|id| *id.as_uuid()))
        .bind(order.status().as_str())
        .bind(state.reason())
        .bind(state.paid_at())
        .bind(state.failed_at())
        .bind(state.cancelled_at())
        .bind(state.refunded_at())
        .bind(order.payment_intent_id())
        .bind(order.expires_at())
        .bind(Json(order.metadata()))
        .bind(order.created_at())
        .bind(order.updated_at())
        .bind(order.version() as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_order", e))?;

        for (position, item) in order.items().iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO order_items (
                    id, order_id, position, catalog_id, item_type, title, description,
                    unit_price, original_price, quantity
                )
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
                "#,
            )
            .bind(item.id.as_uuid())
            .bind(order.id_typed().as_uuid())
            .bind(position as i32)
            .bind(item.catalog_id.as_uuid())
            .bind(item.item_type.as_str())
            .bind(&item.title)
            .bind(&item.description)
            .bind(item.unit_price)
            .bind(item.original_price)
            .bind(item.quantity as i32)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("insert_order_item", e))?;
        }
        Ok(())
    }

    #[instrument(skip(self, order), fields(order_id = %order.id_typed(), expected = ?expected), err)]
    async fn update_order(&mut self, order: &Order, expected: ExpectedVersion) -> Result<(), StoreError> {
        let state = order.state();
        let result = sqlx::query(
            r#"
            UPDATE orders
            SET status = $2, status_reason = $3, paid_at = $4, failed_at = $5,
                cancelled_at = $6, refunded_at = $7, payment_intent_id = $8,
                metadata = $9, updated_at = $10, version = $11
            WHERE id = $1 AND ($12::BIGINT IS NULL OR version = $12)
            "#,
        )
        .bind(order.id_typed().as_uuid())
        .bind(order.status().as_str())
        .bind(state.reason())
        .bind(state.paid_at())
        .bind(state.failed_at())
        .bind(state.cancelled_at())
        .bind(state.refunded_at())
        .bind(order.payment_intent_id())
        .bind(Json(order.metadata()))
        .bind(order.updated_at())
        .bind(order.version() as i64)
        .bind(expected_version(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_order", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "order {} changed or vanished (expected {expected:?})",
                order.id_typed()
            )));
        }
        Ok(())
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn orders_for_user(&mut self, user_id: UserId, limit: u32, offset: u32) -> Result<OrderPage, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM orders WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count_orders_for_user", e))?;

        let sql = format!(
            "SELECT {ORDER_COLUMNS} FROM orders WHERE user_id = $1 \
             ORDER BY created_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_uuid())
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("orders_for_user", e))?;

        let ids = rows
            .iter()
            .map(|row| get::<Uuid>(row, "id"))
            .collect::<Result<Vec<_>, _>>()?;
        let mut items = self.load_items(&ids).await?;

        let mut orders = Vec::with_capacity(rows.len());
        for (row, id) in rows.iter().zip(ids) {
            orders.push(order_from_row(row, items.remove(&id).unwrap_or_default())?);
        }
        Ok(OrderPage {
            orders,
            total: total.max(0) as u64,
        })
    }

    #[instrument(skip(self), err)]
    async fn overdue_order_ids(&mut self, cutoff: DateTime<Utc>, limit: usize) -> Result<Vec<OrderId>, StoreError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            SELECT id FROM orders
            WHERE status = 'pending_payment' AND expires_at <= $1
            ORDER BY expires_at ASC
            LIMIT $2
            "#,
        )
        .bind(cutoff)
        .bind(limit as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("overdue_order_ids", e))?;
        Ok(ids.into_iter().map(OrderId::from_uuid).collect())
    }

    async fn user_has_paid_order(&mut self, user_id: UserId) -> Result<bool, StoreError> {
        sqlx::query_scalar(
            "SELECT EXISTS (SELECT 1 FROM orders WHERE user_id = $1 AND status IN ('paid', 'refunded'))",
        )
        .bind(user_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("user_has_paid_order", e))
    }

    #[instrument(skip(self), fields(code = %code), err)]
    async fn coupon_by_code(&mut self, code: &CouponCode) -> Result<Option<Coupon>, StoreError> {
        let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE code = $1");
        let row = sqlx::query(&sql)
            .bind(code.as_str())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("coupon_by_code", e))?;
        row.as_ref().map(coupon_from_row).transpose()
    }

    async fn active_coupons(&mut self) -> Result<Vec<Coupon>, StoreError> {
        let sql = format!("SELECT {COUPON_COLUMNS} FROM coupons WHERE is_active ORDER BY code ASC");
        let rows = sqlx::query(&sql)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("active_coupons", e))?;
        rows.iter().map(coupon_from_row).collect()
    }

    #[instrument(skip(self, coupon), fields(code = %coupon.code()), err)]
    async fn insert_coupon(&mut self, coupon: &Coupon) -> Result<(), StoreError> {
        let (percent_off, amount_off, discount_currency) = match coupon.discount() {
            Discount::Percentage { percent_off } => (Some(i16::from(*percent_off)), None, None),
            Discount::FixedAmount { amount_off, currency } => {
                (None, Some(*amount_off), Some(currency.as_str().to_string()))
            }
        };
        let applicable_ids: Vec<Uuid> = match coupon.applicability() {
            Applicability::All => Vec::new(),
            Applicability::Specific(ids) => ids.iter().map(|id| *id.as_uuid()).collect(),
            Applicability::Category(ids) => ids.clone(),
        };

        sqlx::query(
            r#"
            INSERT INTO coupons (
                id, code, name, description, discount_type, percent_off, amount_off,
                discount_currency, max_redemptions, max_redemptions_per_user,
                redemption_count, minimum_amount, applicability, applicable_ids,
                first_time_only, valid_from, expires_at, is_active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, $18)
            "#,
        )
        .bind(coupon.id().as_uuid())
        .bind(coupon.code().as_str())
        .bind(coupon.name())
        .bind(coupon.description())
        .bind(coupon.discount().kind())
        .bind(percent_off)
        .bind(amount_off)
        .bind(discount_currency)
        .bind(coupon.max_redemptions().map(|v| v as i32))
        .bind(coupon.max_redemptions_per_user().map(|v| v as i32))
        .bind(coupon.redemption_count() as i32)
        .bind(coupon.minimum_amount())
        .bind(coupon.applicability().mode())
        .bind(applicable_ids)
        .bind(coupon.first_time_only())
        .bind(coupon.valid_from())
        .bind(coupon.expires_at())
        .bind(coupon.is_active())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_coupon", e))?;
        Ok(())
    }

    #[instrument(skip(self), fields(coupon_id = %id), err)]
    async fn increment_coupon_redemptions(&mut self, id: CouponId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE coupons
            SET redemption_count = redemption_count + 1
            WHERE id = $1 AND (max_redemptions IS NULL OR redemption_count < max_redemptions)
            "#,
        )
        .bind(id.as_uuid())
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("increment_coupon_redemptions", e))?;
        Ok(result.rows_affected() == 1)
    }

    #[instrument(skip(self, redemption), fields(order_id = %redemption.order_id), err)]
    async fn insert_redemption(&mut self, redemption: &CouponRedemption) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO coupon_redemptions (id, coupon_id, user_id, order_id, discount_amount, redeemed_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(redemption.id.as_uuid())
        .bind(redemption.coupon_id.as_uuid())
        .bind(redemption.user_id.as_uuid())
        .bind(redemption.order_id.as_uuid())
        .bind(redemption.discount_amount)
        .bind(redemption.redeemed_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_redemption", e))?;
        Ok(())
    }

    async fn user_redemption_count(&mut self, coupon_id: CouponId, user_id: UserId) -> Result<u32, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM coupon_redemptions WHERE coupon_id = $1 AND user_id = $2",
        )
        .bind(coupon_id.as_uuid())
        .bind(user_id.as_uuid())
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("user_redemption_count", e))?;
        Ok(count.clamp(0, i64::from(u32::MAX)) as u32)
    }

    async fn redemption_for_order(&mut self, order_id: OrderId) -> Result<Option<CouponRedemption>, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT id, coupon_id, user_id, order_id, discount_amount, redeemed_at
            FROM coupon_redemptions
            WHERE order_id = $1
            "#,
        )
        .bind(order_id.as_uuid())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("redemption_for_order", e))?;
        row.as_ref().map(redemption_from_row).transpose()
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.id_typed()), err)]
    async fn insert_payment(&mut self, payment: &Payment) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO payments (
                id, order_id, user_id, gateway_transaction_id, amount, currency, status,
                charge_id, receipt_url, failure_message, failure_code, processed_at,
                metadata, created_at, updated_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)
            "#,
        )
        .bind(payment.id_typed().as_uuid())
        .bind(payment.order_id().as_uuid())
        .bind(payment.user_id().as_uuid())
        .bind(payment.gateway_transaction_id())
        .bind(payment.amount())
        .bind(payment.currency().as_str())
        .bind(payment.status().as_str())
        .bind(payment.charge_id())
        .bind(payment.receipt_url())
        .bind(payment.failure_message())
        .bind(payment.failure_code())
        .bind(payment.processed_at())
        .bind(Json(payment.metadata()))
        .bind(payment.created_at())
        .bind(payment.updated_at())
        .bind(payment.version() as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_payment", e))?;
        Ok(())
    }

    #[instrument(skip(self, payment), fields(payment_id = %payment.id_typed(), expected = ?expected), err)]
    async fn update_payment(&mut self, payment: &Payment, expected: ExpectedVersion) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE payments
            SET status = $2, charge_id = $3, receipt_url = $4, failure_message = $5,
                failure_code = $6, processed_at = $7, metadata = $8, updated_at = $9,
                version = $10
            WHERE id = $1 AND ($11::BIGINT IS NULL OR version = $11)
            "#,
        )
        .bind(payment.id_typed().as_uuid())
        .bind(payment.status().as_str())
        .bind(payment.charge_id())
        .bind(payment.receipt_url())
        .bind(payment.failure_message())
        .bind(payment.failure_code())
        .bind(payment.processed_at())
        .bind(Json(payment.metadata()))
        .bind(payment.updated_at())
        .bind(payment.version() as i64)
        .bind(expected_version(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_payment", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "payment {} changed or vanished (expected {expected:?})",
                payment.id_typed()
            )));
        }
        Ok(())
    }

    async fn payment(&mut self, id: PaymentId) -> Result<Option<Payment>, StoreError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE id = $1");
        let row = sqlx::query(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("payment", e))?;
        row.as_ref().map(payment_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn payment_by_gateway_id_for_update(&mut self, gateway_transaction_id: &str) -> Result<Option<Payment>, StoreError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE gateway_transaction_id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(gateway_transaction_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("payment_by_gateway_id_for_update", e))?;
        row.as_ref().map(payment_from_row).transpose()
    }

    async fn payments_for_order(&mut self, order_id: OrderId) -> Result<Vec<Payment>, StoreError> {
        let sql = format!("SELECT {PAYMENT_COLUMNS} FROM payments WHERE order_id = $1 ORDER BY created_at ASC, id ASC");
        let rows = sqlx::query(&sql)
            .bind(order_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("payments_for_order", e))?;
        rows.iter().map(payment_from_row).collect()
    }

    #[instrument(skip(self, refund), fields(refund_id = %refund.id_typed()), err)]
    async fn insert_refund(&mut self, refund: &RefundRequest) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO refund_requests (
                id, order_id, user_id, payment_id, amount, currency, reason_category,
                reason_text, status, admin_reason, gateway_refund_id, requested_at,
                decided_at, processed_at, version
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
            "#,
        )
        .bind(refund.id_typed().as_uuid())
        .bind(refund.order_id().as_uuid())
        .bind(refund.user_id().as_uuid())
        .bind(refund.payment_id().as_uuid())
        .bind(refund.amount())
        .bind(refund.currency().as_str())
        .bind(refund.reason().as_str())
        .bind(refund.reason_text())
        .bind(refund.status().as_str())
        .bind(refund.admin_reason())
        .bind(refund.gateway_refund_id())
        .bind(refund.requested_at())
        .bind(refund.decided_at())
        .bind(refund.processed_at())
        .bind(refund.version() as i64)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_refund", e))?;
        Ok(())
    }

    #[instrument(skip(self, refund), fields(refund_id = %refund.id_typed(), expected = ?expected), err)]
    async fn update_refund(&mut self, refund: &RefundRequest, expected: ExpectedVersion) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE refund_requests
            SET status = $2, admin_reason = $3, gateway_refund_id = $4, decided_at = $5,
                processed_at = $6, version = $7
            WHERE id = $1 AND ($8::BIGINT IS NULL OR version = $8)
            "#,
        )
        .bind(refund.id_typed().as_uuid())
        .bind(refund.status().as_str())
        .bind(refund.admin_reason())
        .bind(refund.gateway_refund_id())
        .bind(refund.decided_at())
        .bind(refund.processed_at())
        .bind(refund.version() as i64)
        .bind(expected_version(expected))
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("update_refund", e))?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Concurrency(format!(
                "refund {} changed or vanished (expected {expected:?})",
                refund.id_typed()
            )));
        }
        Ok(())
    }

    async fn refund(&mut self, id: RefundId) -> Result<Option<RefundRequest>, StoreError> {
        self.load_refund("id", *id.as_uuid(), false).await
    }

    async fn refund_for_update(&mut self, id: RefundId) -> Result<Option<RefundRequest>, StoreError> {
        self.load_refund("id", *id.as_uuid(), true).await
    }

    async fn refund_by_gateway_id_for_update(&mut self, gateway_refund_id: &str) -> Result<Option<RefundRequest>, StoreError> {
        let sql = format!("SELECT {REFUND_COLUMNS} FROM refund_requests WHERE gateway_refund_id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(gateway_refund_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("refund_by_gateway_id_for_update", e))?;
        row.as_ref().map(refund_from_row).transpose()
    }

    async fn refunds_for_order(&mut self, order_id: OrderId) -> Result<Vec<RefundRequest>, StoreError> {
        let sql = format!(
            "SELECT {REFUND_COLUMNS} FROM refund_requests WHERE order_id = $1 ORDER BY requested_at ASC, id ASC"
        );
        let rows = sqlx::query(&sql)
            .bind(order_id.as_uuid())
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("refunds_for_order", e))?;
        rows.iter().map(refund_from_row).collect()
    }

    #[instrument(skip(self), fields(user_id = %user_id), err)]
    async fn refunds_for_user(&mut self, user_id: UserId, limit: u32, offset: u32) -> Result<RefundPage, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM refund_requests WHERE user_id = $1")
            .bind(user_id.as_uuid())
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count_refunds_for_user", e))?;

        let sql = format!(
            "SELECT {REFUND_COLUMNS} FROM refund_requests WHERE user_id = $1 \
             ORDER BY requested_at DESC, id DESC LIMIT $2 OFFSET $3"
        );
        let rows = sqlx::query(&sql)
            .bind(user_id.as_uuid())
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("refunds_for_user", e))?;

        Ok(RefundPage {
            refunds: rows.iter().map(refund_from_row).collect::<Result<_, _>>()?,
            total: total.max(0) as u64,
        })
    }

    #[instrument(skip(self), err)]
    async fn refunds_page(&mut self, limit: u32, offset: u32) -> Result<RefundPage, StoreError> {
        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM refund_requests")
            .fetch_one(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("count_refunds", e))?;

        let sql = format!(
            "SELECT {REFUND_COLUMNS} FROM refund_requests ORDER BY requested_at DESC, id DESC LIMIT $1 OFFSET $2"
        );
        let rows = sqlx::query(&sql)
            .bind(i64::from(limit))
            .bind(i64::from(offset))
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("refunds_page", e))?;

        Ok(RefundPage {
            refunds: rows.iter().map(refund_from_row).collect::<Result<_, _>>()?,
            total: total.max(0) as u64,
        })
    }

    #[instrument(skip(self), err)]
    async fn refund_stats(&mut self, range: Option<TimeRange>) -> Result<RefundStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) AS total_refunds,
                COALESCE(SUM(amount), 0)::BIGINT AS total_amount,
                COUNT(*) FILTER (WHERE status = 'processed') AS processed_refunds,
                COUNT(*) FILTER (WHERE status = 'pending') AS pending_refunds,
                COUNT(*) FILTER (WHERE status = 'rejected') AS rejected_refunds,
                COUNT(*) FILTER (WHERE status = 'failed') AS failed_refunds
            FROM refund_requests
            WHERE ($1::TIMESTAMPTZ IS NULL OR requested_at >= $1)
              AND ($2::TIMESTAMPTZ IS NULL OR requested_at <= $2)
            "#,
        )
        .bind(range.map(|r| r.from))
        .bind(range.map(|r| r.to))
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("refund_stats", e))?;

        let count = |column: &str| get::<i64>(&row, column).map(|n| n.max(0) as u64);
        let total_refunds = count("total_refunds")?;
        let total_amount: i64 = get(&row, "total_amount")?;
        Ok(RefundStats {
            total_refunds,
            total_amount,
            processed_refunds: count("processed_refunds")?,
            pending_refunds: count("pending_refunds")?,
            rejected_refunds: count("rejected_refunds")?,
            failed_refunds: count("failed_refunds")?,
            average_amount: if total_refunds > 0 {
                total_amount / total_refunds as i64
            } else {
                0
            },
        })
    }

    #[instrument(skip(self, event), fields(event_type = %event.event_type, aggregate_id = %event.aggregate_id), err)]
    async fn append_outbox(&mut self, event: NewOutboxEvent) -> Result<i64, StoreError> {
        sqlx::query_scalar(
            r#"
            INSERT INTO outbox_events (aggregate_id, topic, event_type, payload, created_at)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id
            "#,
        )
        .bind(event.aggregate_id)
        .bind(&event.topic)
        .bind(&event.event_type)
        .bind(&event.payload)
        .bind(event.created_at)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("append_outbox", e))
    }

    #[instrument(skip(self), err)]
    async fn webhook_for_update(&mut self, event_id: &str) -> Result<Option<WebhookRecord>, StoreError> {
        let sql = format!("SELECT {WEBHOOK_COLUMNS} FROM processed_webhook_events WHERE event_id = $1 FOR UPDATE");
        let row = sqlx::query(&sql)
            .bind(event_id)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("webhook_for_update", e))?;
        row.as_ref().map(webhook_from_row).transpose()
    }

    #[instrument(skip(self, record), fields(event_id = %record.event_id), err)]
    async fn insert_webhook(&mut self, record: &WebhookRecord) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_webhook_events (event_id, event_type, payload, processed, processed_at, received_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (event_id) DO NOTHING
            "#,
        )
        .bind(&record.event_id)
        .bind(&record.event_type)
        .bind(&record.payload)
        .bind(record.processed)
        .bind(record.processed_at)
        .bind(record.received_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("insert_webhook", e))?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_webhook_processed(&mut self, event_id: &str, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            UPDATE processed_webhook_events
            SET processed = TRUE, processed_at = $2
            WHERE event_id = $1 AND NOT processed
            "#,
        )
        .bind(event_id)
        .bind(at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| map_sqlx_error("mark_webhook_processed", e))?;
        Ok(())
    }

    async fn unprocessed_webhooks(&mut self, limit: usize) -> Result<Vec<WebhookRecord>, StoreError> {
        let sql = format!(
            "SELECT {WEBHOOK_COLUMNS} FROM processed_webhook_events WHERE NOT processed \
             ORDER BY received_at ASC LIMIT $1"
        );
        let rows = sqlx::query(&sql)
            .bind(limit as i64)
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("unprocessed_webhooks", e))?;
        rows.iter().map(webhook_from_row).collect()
    }

    async fn purge_processed_webhooks(&mut self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM processed_webhook_events WHERE processed AND received_at < $1")
            .bind(cutoff)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| map_sqlx_error("purge_processed_webhooks", e))?;
        Ok(result.rows_affected())
    }

    async fn commit(self: Box<Self>) -> Result<(), StoreError> {
        self.tx
            .commit()
            .await
            .map_err(|e| map_sqlx_error("commit", e))
    }
}

#[async_trait]
impl OutboxStore for PostgresStore {
    #[instrument(skip(self), err)]
    async fn fetch_unpublished(&self, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, aggregate_id, topic, event_type, payload, created_at, published_at
            FROM outbox_events
            WHERE published_at IS NULL
            ORDER BY id ASC
            LIMIT $1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("fetch_unpublished", e))?;
        rows.iter().map(outbox_from_row).collect()
    }

    async fn mark_published(&self, id: i64, at: DateTime<Utc>) -> Result<(), StoreError> {
        sqlx::query("UPDATE outbox_events SET published_at = $2 WHERE id = $1 AND published_at IS NULL")
            .bind(id)
            .bind(at)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("mark_published", e))?;
        Ok(())
    }

    async fn stats(&self) -> Result<OutboxStats, StoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE published_at IS NULL) AS pending,
                COUNT(*) FILTER (WHERE published_at IS NOT NULL) AS published
            FROM outbox_events
            "#,
        )
        .fetch_one(&self.pool)
        .await
        .map_err(|e| map_sqlx_error("outbox_stats", e))?;
        let pending: i64 = get(&row, "pending")?;
        let published: i64 = get(&row, "published")?;
        Ok(OutboxStats {
            pending: pending.max(0) as u64,
            published: published.max(0) as u64,
        })
    }

    async fn delete_published_before(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM outbox_events WHERE published_at IS NOT NULL AND published_at < $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_published_before", e))?;
        Ok(result.rows_affected())
    }
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> StoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let msg = format!("database error in {}: {}", operation, db_err.message());
            match db_err.code().as_deref() {
                Some("23505") => StoreError::Conflict(msg),
                Some("23503") | Some("23514") => StoreError::InvalidData(msg),
                _ => StoreError::Database(msg),
            }
        }
        sqlx::Error::PoolClosed => StoreError::Database(format!("connection pool closed in {}", operation)),
        sqlx::Error::RowNotFound => StoreError::NotFound(format!("row not found in {}", operation)),
        _ => StoreError::Database(format!("sqlx error in {}: {}", operation, err)),
    }
}
