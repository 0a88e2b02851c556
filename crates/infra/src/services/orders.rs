use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, instrument, warn};

use orderflow_core::{Aggregate, Clock, CourseId, OrderId, OrderItemId, RedemptionId, UserId};
use orderflow_coupons::{
    CouponCode, CouponError, CouponRedemption, calculate_discount, check_availability, check_user_restrictions,
};
use orderflow_orders::{
    CancelOrder, CreateOrder, Order, OrderCommand, OrderError, OrderEvent, OrderItem, OrderStatus, TransitionOrder,
};

use super::coupons::user_history;
use super::execute_order;
use crate::catalog::Catalog;
use crate::config::OrderSettings;
use crate::error::CheckoutError;
use crate::outbox;
use crate::store::{OrderPage, Store, UnitOfWork};

const MAX_PAGE_SIZE: u32 = 100;

/// Reason recorded on orders cancelled by the expiry sweep.
pub const EXPIRED_REASON: &str = "expired";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOrderRequest {
    pub user_id: UserId,
    pub course_ids: Vec<CourseId>,
    pub coupon_code: Option<String>,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct OrderService {
    store: Arc<dyn Store>,
    catalog: Arc<dyn Catalog>,
    clock: Arc<dyn Clock>,
    settings: OrderSettings,
}

impl OrderService {
    pub fn new(store: Arc<dyn Store>, catalog: Arc<dyn Catalog>, clock: Arc<dyn Clock>, settings: OrderSettings) -> Self {
        Self {
            store,
            catalog,
            clock,
            settings,
        }
    }

    /// Snapshot each requested course from the catalog (quantity 1 each).
    async fn resolve_items(&self, course_ids: &[CourseId]) -> Result<Vec<OrderItem>, CheckoutError> {
        let mut seen = HashSet::new();
        let mut items = Vec::with_capacity(course_ids.len());
        for &course_id in course_ids {
            if !seen.insert(course_id) {
                return Err(OrderError::InvalidCourse(format!("{course_id} requested more than once")).into());
            }
            let item = match self.catalog.get_item(course_id).await? {
                Some(item) if item.is_active => item,
                Some(_) => return Err(OrderError::InvalidCourse(format!("{course_id} is not available")).into()),
                None => return Err(OrderError::InvalidCourse(format!("{course_id} does not exist")).into()),
            };
            items.push(OrderItem {
                id: OrderItemId::new(),
                catalog_id: item.id,
                item_type: item.item_type,
                title: item.title,
                description: item.description,
                unit_price: item.price,
                original_price: item.original_price,
                quantity: 1,
            });
        }
        Ok(items)
    }

    /// Create an order, redeeming its coupon in the same unit of work.
    #[instrument(skip(self, request), fields(user_id = %request.user_id, courses = request.course_ids.len()), err)]
    pub async fn create_order(&self, request: CreateOrderRequest) -> Result<Order, CheckoutError> {
        if request.course_ids.is_empty() {
            return Err(OrderError::EmptyOrder.into());
        }
        let coupon_code = request
            .coupon_code
            .as_deref()
            .filter(|code| !code.trim().is_empty())
            .map(CouponCode::parse)
            .transpose()?;

        let items = self.resolve_items(&request.course_ids).await?;
        let subtotal = items
            .iter()
            .try_fold(0i64, |acc, item| item.line_total().and_then(|t| acc.checked_add(t)))
            .ok_or_else(|| OrderError::validation("order total overflows"))?;

        let now = self.clock.now();
        let mut uow = self.store.begin().await?;

        let coupon = match &coupon_code {
            Some(code) => {
                let coupon = uow.coupon_by_code(code).await?.ok_or(CouponError::CouponNotFound)?;
                check_availability(&coupon, now)?;
                let history = user_history(uow.as_mut(), coupon.id(), request.user_id).await?;
                check_user_restrictions(&coupon, &history, subtotal, &request.course_ids)?;
                Some(coupon)
            }
            None => None,
        };
        let discount = coupon.as_ref().map_or(0, |c| calculate_discount(c, subtotal));

        let order_id = OrderId::new();
        let mut order = Order::empty(order_id);
        let events = order.execute(&OrderCommand::CreateOrder(CreateOrder {
            order_id,
            user_id: request.user_id,
            customer_email: request.customer_email,
            customer_name: request.customer_name,
            currency: self.settings.currency.clone(),
            items,
            coupon_id: coupon.as_ref().map(|c| c.id()),
            discount_amount: discount,
            expires_at: now + self.settings.ttl,
            metadata: request.metadata,
            occurred_at: now,
        }))?;
        uow.insert_order(&order).await?;

        if let Some(coupon) = &coupon {
            if !uow.increment_coupon_redemptions(coupon.id()).await? {
                return Err(CouponError::CouponUsageExceeded.into());
            }
            uow.insert_redemption(&CouponRedemption {
                id: RedemptionId::new(),
                coupon_id: coupon.id(),
                user_id: request.user_id,
                order_id,
                discount_amount: order.discount_amount(),
                redeemed_at: now,
            })
            .await?;
        }

        outbox::append_events(uow.as_mut(), &events).await?;
        uow.commit().await?;

        info!(
            order_id = %order_id,
            total = order.total_amount(),
            discount = order.discount_amount(),
            coupon = coupon_code.as_ref().map(|c| c.as_str()),
            "order created"
        );
        Ok(order)
    }

    /// Owner-scoped read.
    pub async fn get_order(&self, order_id: OrderId, user_id: UserId) -> Result<Order, CheckoutError> {
        let mut uow = self.store.begin().await?;
        let order = uow.order(order_id).await?.ok_or(OrderError::OrderNotFound)?;
        order.ensure_owner(user_id)?;
        Ok(order)
    }

    /// A user's orders, newest first.
    pub async fn list_orders(&self, user_id: UserId, limit: u32, offset: u32) -> Result<OrderPage, CheckoutError> {
        let mut uow = self.store.begin().await?;
        Ok(uow
            .orders_for_user(user_id, limit.clamp(1, MAX_PAGE_SIZE), offset)
            .await?)
    }

    /// System-driven status change, checked against the transition table.
    #[instrument(skip(self, reason), fields(order_id = %order_id, to = %to), err)]
    pub async fn transition(&self, order_id: OrderId, to: OrderStatus, reason: Option<String>) -> Result<Order, CheckoutError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut order = uow.order_for_update(order_id).await?.ok_or(OrderError::OrderNotFound)?;
        transition_order(uow.as_mut(), &mut order, to, reason, now).await?;
        uow.commit().await?;
        Ok(order)
    }

    /// Owner cancels an order that has not been paid.
    #[instrument(skip(self, reason), fields(order_id = %order_id, user_id = %user_id), err)]
    pub async fn cancel(&self, order_id: OrderId, user_id: UserId, reason: Option<String>) -> Result<Order, CheckoutError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let mut order = uow.order_for_update(order_id).await?.ok_or(OrderError::OrderNotFound)?;
        execute_order(
            uow.as_mut(),
            &mut order,
            OrderCommand::CancelOrder(CancelOrder {
                user_id,
                reason,
                occurred_at: now,
            }),
        )
        .await?;
        uow.commit().await?;
        info!(order_id = %order_id, "order cancelled by owner");
        Ok(order)
    }

    /// Cancel one overdue order with reason `"expired"`.
    ///
    /// Returns `false` when the order no longer qualifies (paid, cancelled or
    /// not yet overdue by the time it was locked).
    pub async fn expire_order(&self, order_id: OrderId, grace: Duration) -> Result<bool, CheckoutError> {
        let now = self.clock.now();
        let mut uow = self.store.begin().await?;
        let Some(mut order) = uow.order_for_update(order_id).await? else {
            return Ok(false);
        };
        if !order.is_overdue(now, grace) {
            return Ok(false);
        }
        transition_order(
            uow.as_mut(),
            &mut order,
            OrderStatus::Cancelled,
            Some(EXPIRED_REASON.to_string()),
            now,
        )
        .await?;
        uow.commit().await?;
        Ok(true)
    }
}

/// Move a locked order along the transition table inside the caller's unit
/// of work.
pub(crate) async fn transition_order(
    uow: &mut dyn UnitOfWork,
    order: &mut Order,
    to: OrderStatus,
    reason: Option<String>,
    at: DateTime<Utc>,
) -> Result<Vec<OrderEvent>, CheckoutError> {
    execute_order(
        uow,
        order,
        OrderCommand::TransitionOrder(TransitionOrder {
            to,
            reason,
            occurred_at: at,
        }),
    )
    .await
}

/// Like [`transition_order`], but a move the table does not allow is logged
/// and skipped instead of failing. Used for consequences of gateway reports,
/// where the report itself must still be recorded.
pub(crate) async fn transition_if_allowed(
    uow: &mut dyn UnitOfWork,
    order: &mut Order,
    to: OrderStatus,
    reason: Option<String>,
    at: DateTime<Utc>,
) -> Result<bool, CheckoutError> {
    let from = order.status();
    if from == to {
        return Ok(false);
    }
    if !from.can_transition_to(to) {
        warn!(order_id = %order.id_typed(), %from, %to, "order cannot follow gateway report, skipping");
        return Ok(false);
    }
    transition_order(uow, order, to, reason, at).await?;
    Ok(true)
}
