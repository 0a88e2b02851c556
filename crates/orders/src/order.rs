use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orderflow_core::{Aggregate, AggregateRoot, CouponId, Currency, OrderId, UserId};
use orderflow_events::{Event, Topic};

use crate::error::OrderError;
use crate::item::OrderItem;
use crate::status::{OrderState, OrderStatus};

/// Aggregate root: Order.
///
/// Owns its items. Payments, refunds and redemptions reference the order but
/// live in their own tables; they are written in the same unit of work as the
/// order mutation they accompany.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    id: OrderId,
    user_id: UserId,
    customer_email: String,
    customer_name: Option<String>,
    currency: Currency,
    subtotal_amount: i64,
    discount_amount: i64,
    total_amount: i64,
    coupon_id: Option<CouponId>,
    state: OrderState,
    payment_intent_id: Option<String>,
    expires_at: DateTime<Utc>,
    metadata: BTreeMap<String, String>,
    items: Vec<OrderItem>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
    created: bool,
}

/// Persisted shape of an order, used by stores to rebuild the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderParts {
    pub id: OrderId,
    pub user_id: UserId,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub currency: Currency,
    pub subtotal_amount: i64,
    pub discount_amount: i64,
    pub total_amount: i64,
    pub coupon_id: Option<CouponId>,
    pub state: OrderState,
    pub payment_intent_id: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub items: Vec<OrderItem>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Order {
    /// Create an empty, not-yet-created aggregate instance.
    pub fn empty(id: OrderId) -> Self {
        Self {
            id,
            user_id: UserId::from_uuid(Uuid::nil()),
            customer_email: String::new(),
            customer_name: None,
            currency: Currency::usd(),
            subtotal_amount: 0,
            discount_amount: 0,
            total_amount: 0,
            coupon_id: None,
            state: OrderState::Created,
            payment_intent_id: None,
            expires_at: DateTime::<Utc>::default(),
            metadata: BTreeMap::new(),
            items: Vec::new(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            version: 0,
            created: false,
        }
    }

    /// Rebuild a stored order.
    pub fn restore(parts: OrderParts) -> Self {
        Self {
            id: parts.id,
            user_id: parts.user_id,
            customer_email: parts.customer_email,
            customer_name: parts.customer_name,
            currency: parts.currency,
            subtotal_amount: parts.subtotal_amount,
            discount_amount: parts.discount_amount,
            total_amount: parts.total_amount,
            coupon_id: parts.coupon_id,
            state: parts.state,
            payment_intent_id: parts.payment_intent_id,
            expires_at: parts.expires_at,
            metadata: parts.metadata,
            items: parts.items,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
            version: parts.version,
            created: true,
        }
    }

    pub fn to_parts(&self) -> OrderParts {
        OrderParts {
            id: self.id,
            user_id: self.user_id,
            customer_email: self.customer_email.clone(),
            customer_name: self.customer_name.clone(),
            currency: self.currency.clone(),
            subtotal_amount: self.subtotal_amount,
            discount_amount: self.discount_amount,
            total_amount: self.total_amount,
            coupon_id: self.coupon_id,
            state: self.state.clone(),
            payment_intent_id: self.payment_intent_id.clone(),
            expires_at: self.expires_at,
            metadata: self.metadata.clone(),
            items: self.items.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        }
    }

    pub fn id_typed(&self) -> OrderId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn customer_email(&self) -> &str {
        &self.customer_email
    }

    pub fn customer_name(&self) -> Option<&str> {
        self.customer_name.as_deref()
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    /// Pre-discount sum of the items.
    pub fn subtotal_amount(&self) -> i64 {
        self.subtotal_amount
    }

    pub fn discount_amount(&self) -> i64 {
        self.discount_amount
    }

    /// Payable amount.
    pub fn total_amount(&self) -> i64 {
        self.total_amount
    }

    pub fn coupon_id(&self) -> Option<CouponId> {
        self.coupon_id
    }

    pub fn state(&self) -> &OrderState {
        &self.state
    }

    pub fn status(&self) -> OrderStatus {
        self.state.status()
    }

    pub fn payment_intent_id(&self) -> Option<&str> {
        self.payment_intent_id.as_deref()
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn items(&self) -> &[OrderItem] {
        &self.items
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    pub fn is_created(&self) -> bool {
        self.created
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// Still awaiting payment and past expiry by at least `grace`.
    pub fn is_overdue(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        self.status() == OrderStatus::PendingPayment && self.expires_at <= now - grace
    }

    pub fn ensure_owner(&self, user_id: UserId) -> Result<(), OrderError> {
        if self.user_id != user_id {
            return Err(OrderError::Unauthorized);
        }
        Ok(())
    }

    /// Catalog ids of all items, in order.
    pub fn course_ids(&self) -> Vec<orderflow_core::CourseId> {
        self.items.iter().map(|item| item.catalog_id).collect()
    }
}

impl AggregateRoot for Order {
    type Id = OrderId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreateOrder.
///
/// The discount has already been computed and validated against the coupon;
/// the aggregate checks it against its own subtotal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateOrder {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub currency: Currency,
    pub items: Vec<OrderItem>,
    pub coupon_id: Option<CouponId>,
    pub discount_amount: i64,
    pub expires_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: StartPayment (attach a gateway payment intent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartPayment {
    pub payment_intent_id: String,
    pub occurred_at: DateTime<Utc>,
}

/// Command: TransitionOrder (system-driven status change).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionOrder {
    pub to: OrderStatus,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: CancelOrder (customer-driven).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CancelOrder {
    pub user_id: UserId,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderCommand {
    CreateOrder(CreateOrder),
    StartPayment(StartPayment),
    TransitionOrder(TransitionOrder),
    CancelOrder(CancelOrder),
}

/// Event: OrderCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCreated {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub customer_email: String,
    pub customer_name: Option<String>,
    pub currency: Currency,
    pub items: Vec<OrderItem>,
    pub subtotal_amount: i64,
    pub discount_amount: i64,
    pub total_amount: i64,
    pub coupon_id: Option<CouponId>,
    pub expires_at: DateTime<Utc>,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderPaymentStarted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderPaymentStarted {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub payment_intent_id: String,
    pub from: OrderStatus,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderStatusChanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderStatusChanged {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub reason: Option<String>,
    pub total_amount: i64,
    pub currency: Currency,
    pub occurred_at: DateTime<Utc>,
}

/// Event: OrderCancelledByUser.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderCancelledByUser {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub from: OrderStatus,
    pub reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum OrderEvent {
    OrderCreated(OrderCreated),
    OrderPaymentStarted(OrderPaymentStarted),
    OrderStatusChanged(OrderStatusChanged),
    OrderCancelledByUser(OrderCancelledByUser),
}

impl Event for OrderEvent {
    fn event_type(&self) -> &'static str {
        match self {
            OrderEvent::OrderCreated(_) => "order.created",
            OrderEvent::OrderPaymentStarted(e) => match e.from {
                OrderStatus::Created => "order.pending_payment",
                _ => "order.payment_intent_attached",
            },
            OrderEvent::OrderStatusChanged(e) => match e.to {
                OrderStatus::Created => "order.created",
                OrderStatus::PendingPayment => "order.pending_payment",
                OrderStatus::Paid => "order.paid",
                OrderStatus::Failed => "order.failed",
                OrderStatus::Cancelled => "order.cancelled",
                OrderStatus::Refunded => "order.refunded",
            },
            OrderEvent::OrderCancelledByUser(_) => "order.cancelled",
        }
    }

    fn topic(&self) -> Topic {
        Topic::OrderEvents
    }

    fn aggregate_id(&self) -> Uuid {
        let id = match self {
            OrderEvent::OrderCreated(e) => e.order_id,
            OrderEvent::OrderPaymentStarted(e) => e.order_id,
            OrderEvent::OrderStatusChanged(e) => e.order_id,
            OrderEvent::OrderCancelledByUser(e) => e.order_id,
        };
        *id.as_uuid()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            OrderEvent::OrderCreated(e) => e.occurred_at,
            OrderEvent::OrderPaymentStarted(e) => e.occurred_at,
            OrderEvent::OrderStatusChanged(e) => e.occurred_at,
            OrderEvent::OrderCancelledByUser(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Order {
    type Command = OrderCommand;
    type Event = OrderEvent;
    type Error = OrderError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            OrderEvent::OrderCreated(e) => {
                self.id = e.order_id;
                self.user_id = e.user_id;
                self.customer_email = e.customer_email.clone();
                self.customer_name = e.customer_name.clone();
                self.currency = e.currency.clone();
                self.items = e.items.clone();
                self.subtotal_amount = e.subtotal_amount;
                self.discount_amount = e.discount_amount;
                self.total_amount = e.total_amount;
                self.coupon_id = e.coupon_id;
                self.state = OrderState::Created;
                self.payment_intent_id = None;
                self.expires_at = e.expires_at;
                self.metadata = e.metadata.clone();
                self.created_at = e.occurred_at;
                self.updated_at = e.occurred_at;
                self.created = true;
            }
            OrderEvent::OrderPaymentStarted(e) => {
                self.payment_intent_id = Some(e.payment_intent_id.clone());
                self.state = OrderState::PendingPayment;
                self.updated_at = e.occurred_at;
            }
            OrderEvent::OrderStatusChanged(e) => {
                self.state = OrderState::entered(e.to, e.occurred_at, e.reason.clone());
                self.updated_at = e.occurred_at;
            }
            OrderEvent::OrderCancelledByUser(e) => {
                self.state = OrderState::entered(OrderStatus::Cancelled, e.occurred_at, e.reason.clone());
                self.updated_at = e.occurred_at;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            OrderCommand::CreateOrder(cmd) => self.handle_create(cmd),
            OrderCommand::StartPayment(cmd) => self.handle_start_payment(cmd),
            OrderCommand::TransitionOrder(cmd) => self.handle_transition(cmd),
            OrderCommand::CancelOrder(cmd) => self.handle_cancel(cmd),
        }
    }
}

impl Order {
    fn ensure_created(&self) -> Result<(), OrderError> {
        if !self.created {
            return Err(OrderError::OrderNotFound);
        }
        Ok(())
    }

    fn handle_create(&self, cmd: &CreateOrder) -> Result<Vec<OrderEvent>, OrderError> {
        if self.created {
            return Err(OrderError::AlreadyExists);
        }
        if cmd.items.is_empty() {
            return Err(OrderError::EmptyOrder);
        }
        for item in &cmd.items {
            item.validate()?;
        }

        let email = cmd.customer_email.trim();
        if email.is_empty() || !email.contains('@') {
            return Err(OrderError::validation("customer_email must be a valid address"));
        }

        let subtotal = cmd
            .items
            .iter()
            .try_fold(0i64, |acc, item| item.line_total().and_then(|t| acc.checked_add(t)))
            .ok_or_else(|| OrderError::validation("order total overflows"))?;

        if cmd.discount_amount < 0 || cmd.discount_amount > subtotal {
            return Err(OrderError::validation("discount must be between zero and the subtotal"));
        }
        if cmd.coupon_id.is_none() && cmd.discount_amount != 0 {
            return Err(OrderError::validation("discount requires a coupon"));
        }
        if cmd.expires_at <= cmd.occurred_at {
            return Err(OrderError::validation("expires_at must be in the future"));
        }

        Ok(vec![OrderEvent::OrderCreated(OrderCreated {
            order_id: self.id,
            user_id: cmd.user_id,
            customer_email: email.to_string(),
            customer_name: cmd.customer_name.clone(),
            currency: cmd.currency.clone(),
            items: cmd.items.clone(),
            subtotal_amount: subtotal,
            discount_amount: cmd.discount_amount,
            total_amount: subtotal - cmd.discount_amount,
            coupon_id: cmd.coupon_id,
            expires_at: cmd.expires_at,
            metadata: cmd.metadata.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_start_payment(&self, cmd: &StartPayment) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_created()?;

        let from = self.status();
        if !matches!(from, OrderStatus::Created | OrderStatus::PendingPayment) {
            return Err(OrderError::InvalidOrderStatus {
                from,
                to: OrderStatus::PendingPayment,
            });
        }
        if self.is_expired(cmd.occurred_at) {
            return Err(OrderError::OrderExpired);
        }
        if cmd.payment_intent_id.trim().is_empty() {
            return Err(OrderError::validation("payment_intent_id must not be empty"));
        }

        Ok(vec![OrderEvent::OrderPaymentStarted(OrderPaymentStarted {
            order_id: self.id,
            user_id: self.user_id,
            payment_intent_id: cmd.payment_intent_id.clone(),
            from,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_transition(&self, cmd: &TransitionOrder) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_created()?;

        let from = self.status();
        if !from.can_transition_to(cmd.to) {
            return Err(OrderError::InvalidOrderStatus { from, to: cmd.to });
        }

        Ok(vec![OrderEvent::OrderStatusChanged(OrderStatusChanged {
            order_id: self.id,
            user_id: self.user_id,
            from,
            to: cmd.to,
            reason: cmd.reason.clone(),
            total_amount: self.total_amount,
            currency: self.currency.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_cancel(&self, cmd: &CancelOrder) -> Result<Vec<OrderEvent>, OrderError> {
        self.ensure_created()?;
        self.ensure_owner(cmd.user_id)?;

        let from = self.status();
        if !from.is_cancellable_by_user() {
            return Err(OrderError::InvalidOrderStatus {
                from,
                to: OrderStatus::Cancelled,
            });
        }

        Ok(vec![OrderEvent::OrderCancelledByUser(OrderCancelledByUser {
            order_id: self.id,
            user_id: self.user_id,
            from,
            reason: cmd.reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}
