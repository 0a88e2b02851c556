use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orderflow_core::{Aggregate, AggregateRoot, Currency, OrderId, PaymentId, UserId};
use orderflow_events::{Event, Topic};

use crate::error::PaymentError;

/// Payment status, in the gateway's vocabulary.
///
/// No transition table is enforced: the gateway is authoritative and every
/// report overwrites the stored status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    Succeeded,
    Canceled,
    Failed,
}

impl PaymentStatus {
    pub const ALL: [PaymentStatus; 7] = [
        PaymentStatus::RequiresPaymentMethod,
        PaymentStatus::RequiresConfirmation,
        PaymentStatus::RequiresAction,
        PaymentStatus::Processing,
        PaymentStatus::Succeeded,
        PaymentStatus::Canceled,
        PaymentStatus::Failed,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            PaymentStatus::Succeeded | PaymentStatus::Canceled | PaymentStatus::Failed
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PaymentStatus::RequiresPaymentMethod => "requires_payment_method",
            PaymentStatus::RequiresConfirmation => "requires_confirmation",
            PaymentStatus::RequiresAction => "requires_action",
            PaymentStatus::Processing => "processing",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Canceled => "canceled",
            PaymentStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for PaymentStatus {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        PaymentStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| PaymentError::UnknownStatus(s.to_string()))
    }
}

/// Aggregate root: Payment (one attempt to pay an order).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payment {
    id: PaymentId,
    order_id: OrderId,
    user_id: UserId,
    gateway_transaction_id: String,
    amount: i64,
    currency: Currency,
    status: PaymentStatus,
    charge_id: Option<String>,
    receipt_url: Option<String>,
    failure_message: Option<String>,
    failure_code: Option<String>,
    processed_at: Option<DateTime<Utc>>,
    metadata: BTreeMap<String, String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    version: u64,
    created: bool,
}

/// Persisted shape of a payment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentParts {
    pub id: PaymentId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub gateway_transaction_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub failure_message: Option<String>,
    pub failure_code: Option<String>,
    pub processed_at: Option<DateTime<Utc>>,
    pub metadata: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

impl Payment {
    pub fn empty(id: PaymentId) -> Self {
        Self {
            id,
            order_id: OrderId::from_uuid(Uuid::nil()),
            user_id: UserId::from_uuid(Uuid::nil()),
            gateway_transaction_id: String::new(),
            amount: 0,
            currency: Currency::usd(),
            status: PaymentStatus::RequiresPaymentMethod,
            charge_id: None,
            receipt_url: None,
            failure_message: None,
            failure_code: None,
            processed_at: None,
            metadata: BTreeMap::new(),
            created_at: DateTime::<Utc>::default(),
            updated_at: DateTime::<Utc>::default(),
            version: 0,
            created: false,
        }
    }

    pub fn restore(parts: PaymentParts) -> Self {
        Self {
            id: parts.id,
            order_id: parts.order_id,
            user_id: parts.user_id,
            gateway_transaction_id: parts.gateway_transaction_id,
            amount: parts.amount,
            currency: parts.currency,
            status: parts.status,
            charge_id: parts.charge_id,
            receipt_url: parts.receipt_url,
            failure_message: parts.failure_message,
            failure_code: parts.failure_code,
            processed_at: parts.processed_at,
            metadata: parts.metadata,
            created_at: parts.created_at,
            updated_at: parts.updated_at,
            version: parts.version,
            created: true,
        }
    }

    pub fn to_parts(&self) -> PaymentParts {
        PaymentParts {
            id: self.id,
            order_id: self.order_id,
            user_id: self.user_id,
            gateway_transaction_id: self.gateway_transaction_id.clone(),
            amount: self.amount,
            currency: self.currency.clone(),
            status: self.status,
            charge_id: self.charge_id.clone(),
            receipt_url: self.receipt_url.clone(),
            failure_message: self.failure_message.clone(),
            failure_code: self.failure_code.clone(),
            processed_at: self.processed_at,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            updated_at: self.updated_at,
            version: self.version,
        }
    }

    pub fn id_typed(&self) -> PaymentId {
        self.id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn gateway_transaction_id(&self) -> &str {
        &self.gateway_transaction_id
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn status(&self) -> PaymentStatus {
        self.status
    }

    pub fn is_active(&self) -> bool {
        self.created && !self.status.is_terminal()
    }

    pub fn charge_id(&self) -> Option<&str> {
        self.charge_id.as_deref()
    }

    pub fn receipt_url(&self) -> Option<&str> {
        self.receipt_url.as_deref()
    }

    pub fn failure_message(&self) -> Option<&str> {
        self.failure_message.as_deref()
    }

    pub fn failure_code(&self) -> Option<&str> {
        self.failure_code.as_deref()
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }

    pub fn metadata(&self) -> &BTreeMap<String, String> {
        &self.metadata
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }
}

impl AggregateRoot for Payment {
    type Id = PaymentId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: CreatePayment (record an attempt the gateway accepted).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreatePayment {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub gateway_transaction_id: String,
    pub amount: i64,
    pub currency: Currency,
    /// Order total at creation; the payment may not exceed it.
    pub order_total: i64,
    pub status: PaymentStatus,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

/// Command: ApplyGatewayStatus (webhook or confirmation response).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApplyGatewayStatus {
    pub status: PaymentStatus,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub failure_message: Option<String>,
    pub failure_code: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PaymentCommand {
    CreatePayment(CreatePayment),
    ApplyGatewayStatus(ApplyGatewayStatus),
}

/// Event: PaymentCreated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentCreated {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub gateway_transaction_id: String,
    pub amount: i64,
    pub currency: Currency,
    pub status: PaymentStatus,
    pub metadata: BTreeMap<String, String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: PaymentStatusUpdated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentStatusUpdated {
    pub payment_id: PaymentId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub gateway_transaction_id: String,
    pub from: PaymentStatus,
    pub to: PaymentStatus,
    pub amount: i64,
    pub currency: Currency,
    pub charge_id: Option<String>,
    pub receipt_url: Option<String>,
    pub failure_message: Option<String>,
    pub failure_code: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PaymentEvent {
    PaymentCreated(PaymentCreated),
    PaymentStatusUpdated(PaymentStatusUpdated),
}

impl Event for PaymentEvent {
    fn event_type(&self) -> &'static str {
        match self {
            PaymentEvent::PaymentCreated(_) => "payment.created",
            PaymentEvent::PaymentStatusUpdated(e) => match e.to {
                PaymentStatus::RequiresPaymentMethod => "payment.requires_payment_method",
                PaymentStatus::RequiresConfirmation => "payment.requires_confirmation",
                PaymentStatus::RequiresAction => "payment.requires_action",
                PaymentStatus::Processing => "payment.processing",
                PaymentStatus::Succeeded => "payment.succeeded",
                PaymentStatus::Canceled => "payment.canceled",
                PaymentStatus::Failed => "payment.failed",
            },
        }
    }

    fn topic(&self) -> Topic {
        Topic::PaymentEvents
    }

    fn aggregate_id(&self) -> Uuid {
        let id = match self {
            PaymentEvent::PaymentCreated(e) => e.payment_id,
            PaymentEvent::PaymentStatusUpdated(e) => e.payment_id,
        };
        *id.as_uuid()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            PaymentEvent::PaymentCreated(e) => e.occurred_at,
            PaymentEvent::PaymentStatusUpdated(e) => e.occurred_at,
        }
    }
}

impl Aggregate for Payment {
    type Command = PaymentCommand;
    type Event = PaymentEvent;
    type Error = PaymentError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            PaymentEvent::PaymentCreated(e) => {
                self.id = e.payment_id;
                self.order_id = e.order_id;
                self.user_id = e.user_id;
                self.gateway_transaction_id = e.gateway_transaction_id.clone();
                self.amount = e.amount;
                self.currency = e.currency.clone();
                self.status = e.status;
                self.metadata = e.metadata.clone();
                self.processed_at = e.status.is_terminal().then_some(e.occurred_at);
                self.created_at = e.occurred_at;
                self.updated_at = e.occurred_at;
                self.created = true;
            }
            PaymentEvent::PaymentStatusUpdated(e) => {
                self.status = e.to;
                if e.charge_id.is_some() {
                    self.charge_id = e.charge_id.clone();
                }
                if e.receipt_url.is_some() {
                    self.receipt_url = e.receipt_url.clone();
                }
                if e.to == PaymentStatus::Failed {
                    self.failure_message = e.failure_message.clone();
                    self.failure_code = e.failure_code.clone();
                }
                self.processed_at = if e.to.is_terminal() {
                    self.processed_at.or(Some(e.occurred_at))
                } else {
                    None
                };
                self.updated_at = e.occurred_at;
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            PaymentCommand::CreatePayment(cmd) => self.handle_create(cmd),
            PaymentCommand::ApplyGatewayStatus(cmd) => self.handle_apply_status(cmd),
        }
    }
}

impl Payment {
    fn handle_create(&self, cmd: &CreatePayment) -> Result<Vec<PaymentEvent>, PaymentError> {
        if self.created {
            return Err(PaymentError::AlreadyExists);
        }
        if cmd.gateway_transaction_id.trim().is_empty() {
            return Err(PaymentError::validation("gateway_transaction_id must not be empty"));
        }
        if cmd.amount < 0 {
            return Err(PaymentError::validation("amount must not be negative"));
        }
        if cmd.amount > cmd.order_total {
            return Err(PaymentError::AmountExceedsOrder {
                amount: cmd.amount,
                order_total: cmd.order_total,
            });
        }

        Ok(vec![PaymentEvent::PaymentCreated(PaymentCreated {
            payment_id: self.id,
            order_id: cmd.order_id,
            user_id: cmd.user_id,
            gateway_transaction_id: cmd.gateway_transaction_id.clone(),
            amount: cmd.amount,
            currency: cmd.currency.clone(),
            status: cmd.status,
            metadata: cmd.metadata.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Overwrite the status. Reporting the status the payment already has is
    /// a no-op (no event), which keeps webhook replays and confirm-after-
    /// webhook races quiet.
    fn handle_apply_status(&self, cmd: &ApplyGatewayStatus) -> Result<Vec<PaymentEvent>, PaymentError> {
        if !self.created {
            return Err(PaymentError::PaymentNotFound);
        }

        let adds_detail = (cmd.charge_id.is_some() && cmd.charge_id != self.charge_id)
            || (cmd.receipt_url.is_some() && cmd.receipt_url != self.receipt_url);
        if cmd.status == self.status && !adds_detail {
            return Ok(vec![]);
        }

        Ok(vec![PaymentEvent::PaymentStatusUpdated(PaymentStatusUpdated {
            payment_id: self.id,
            order_id: self.order_id,
            user_id: self.user_id,
            gateway_transaction_id: self.gateway_transaction_id.clone(),
            from: self.status,
            to: cmd.status,
            amount: self.amount,
            currency: self.currency.clone(),
            charge_id: cmd.charge_id.clone(),
            receipt_url: cmd.receipt_url.clone(),
            failure_message: cmd.failure_message.clone(),
            failure_code: cmd.failure_code.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn test_time() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 1, 9, 0, 0).unwrap()
    }

    fn create_cmd(amount: i64, order_total: i64) -> CreatePayment {
        CreatePayment {
            order_id: OrderId::new(),
            user_id: UserId::new(),
            gateway_transaction_id: "pi_test".to_string(),
            amount,
            currency: Currency::usd(),
            order_total,
            status: PaymentStatus::RequiresPaymentMethod,
            metadata: BTreeMap::new(),
            occurred_at: test_time(),
        }
    }

    fn created_payment() -> Payment {
        let mut payment = Payment::empty(PaymentId::new());
        payment
            .execute(&PaymentCommand::CreatePayment(create_cmd(9_000, 9_000)))
            .unwrap();
        payment
    }

    fn status(status: PaymentStatus) -> PaymentCommand {
        PaymentCommand::ApplyGatewayStatus(ApplyGatewayStatus {
            status,
            charge_id: None,
            receipt_url: None,
            failure_message: None,
            failure_code: None,
            occurred_at: test_time() + Duration::minutes(1),
        })
    }

    #[test]
    fn create_payment_emits_payment_created() {
        let payment = Payment::empty(PaymentId::new());
        let events = payment
            .handle(&PaymentCommand::CreatePayment(create_cmd(9_000, 9_000)))
            .unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].event_type(), "payment.created");
        assert_eq!(events[0].topic(), Topic::PaymentEvents);
    }

    #[test]
    fn payment_may_not_exceed_order_total() {
        let payment = Payment::empty(PaymentId::new());
        let err = payment
            .handle(&PaymentCommand::CreatePayment(create_cmd(9_001, 9_000)))
            .unwrap_err();
        assert_eq!(
            err,
            PaymentError::AmountExceedsOrder {
                amount: 9_001,
                order_total: 9_000
            }
        );
    }

    #[test]
    fn succeeded_stamps_processed_at() {
        let mut payment = created_payment();
        assert!(payment.is_active());
        let events = payment.execute(&status(PaymentStatus::Succeeded)).unwrap();

        assert_eq!(events[0].event_type(), "payment.succeeded");
        assert_eq!(payment.status(), PaymentStatus::Succeeded);
        assert_eq!(payment.processed_at(), Some(test_time() + Duration::minutes(1)));
        assert!(!payment.is_active());
    }

    #[test]
    fn failed_records_failure_detail() {
        let mut payment = created_payment();
        payment
            .execute(&PaymentCommand::ApplyGatewayStatus(ApplyGatewayStatus {
                status: PaymentStatus::Failed,
                charge_id: None,
                receipt_url: None,
                failure_message: Some("card declined".to_string()),
                failure_code: Some("card_declined".to_string()),
                occurred_at: test_time(),
            }))
            .unwrap();
        assert_eq!(payment.failure_message(), Some("card declined"));
        assert_eq!(payment.failure_code(), Some("card_declined"));
        assert!(payment.processed_at().is_some());
    }

    #[test]
    fn intermediate_statuses_do_not_stamp_processed_at() {
        let mut payment = created_payment();
        let events = payment.execute(&status(PaymentStatus::RequiresAction)).unwrap();
        assert_eq!(events[0].event_type(), "payment.requires_action");
        assert_eq!(payment.processed_at(), None);
    }

    #[test]
    fn repeating_the_current_status_is_a_no_op() {
        let mut payment = created_payment();
        payment.execute(&status(PaymentStatus::Succeeded)).unwrap();
        let version = payment.version();

        let events = payment.execute(&status(PaymentStatus::Succeeded)).unwrap();
        assert!(events.is_empty());
        assert_eq!(payment.version(), version);
    }

    #[test]
    fn gateway_may_overwrite_any_status() {
        let mut payment = created_payment();
        payment.execute(&status(PaymentStatus::Failed)).unwrap();
        payment.execute(&status(PaymentStatus::Processing)).unwrap();
        assert_eq!(payment.status(), PaymentStatus::Processing);
        assert_eq!(payment.processed_at(), None);
    }

    #[test]
    fn unknown_gateway_status_is_rejected() {
        assert_eq!(
            "refunded".parse::<PaymentStatus>(),
            Err(PaymentError::UnknownStatus("refunded".to_string()))
        );
        assert_eq!("requires_action".parse::<PaymentStatus>(), Ok(PaymentStatus::RequiresAction));
    }
}
