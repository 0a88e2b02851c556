//! Refund workflow.
//!
//! ```text
//! pending ──► approved ──► processed
//!    │            └──────► failed
//!    └──────► rejected
//! ```
//!
//! A gateway confirmation may also settle a `failed` request as `processed`:
//! the gateway is authoritative about money that actually moved.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use orderflow_core::{Aggregate, AggregateRoot, Currency, OrderId, PaymentId, RefundId, UserId};
use orderflow_events::{Event, Topic};

use crate::error::RefundError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundStatus {
    Pending,
    Approved,
    Rejected,
    Processed,
    Failed,
}

impl RefundStatus {
    pub const ALL: [RefundStatus; 5] = [
        RefundStatus::Pending,
        RefundStatus::Approved,
        RefundStatus::Rejected,
        RefundStatus::Processed,
        RefundStatus::Failed,
    ];

    pub fn allowed_next(self) -> &'static [RefundStatus] {
        match self {
            RefundStatus::Pending => &[RefundStatus::Approved, RefundStatus::Rejected],
            RefundStatus::Approved => &[RefundStatus::Processed, RefundStatus::Failed],
            RefundStatus::Rejected | RefundStatus::Processed | RefundStatus::Failed => &[],
        }
    }

    pub fn can_transition_to(self, next: RefundStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Whether a request in this status prevents a new one for the same order.
    /// Only a rejection leaves the customer free to ask again; a failed
    /// request may still be settled by the gateway.
    pub fn blocks_new_request(self) -> bool {
        self != RefundStatus::Rejected
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RefundStatus::Pending => "pending",
            RefundStatus::Approved => "approved",
            RefundStatus::Rejected => "rejected",
            RefundStatus::Processed => "processed",
            RefundStatus::Failed => "failed",
        }
    }
}

impl core::fmt::Display for RefundStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for RefundStatus {
    type Err = RefundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RefundStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| RefundError::validation(format!("unknown refund status {s:?}")))
    }
}

/// Why the customer wants their money back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefundReason {
    Technical,
    Content,
    Accidental,
    Duplicate,
    Quality,
    Other,
}

impl RefundReason {
    pub const ALL: [RefundReason; 6] = [
        RefundReason::Technical,
        RefundReason::Content,
        RefundReason::Accidental,
        RefundReason::Duplicate,
        RefundReason::Quality,
        RefundReason::Other,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            RefundReason::Technical => "technical",
            RefundReason::Content => "content",
            RefundReason::Accidental => "accidental",
            RefundReason::Duplicate => "duplicate",
            RefundReason::Quality => "quality",
            RefundReason::Other => "other",
        }
    }
}

impl core::str::FromStr for RefundReason {
    type Err = RefundError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RefundReason::ALL
            .into_iter()
            .find(|reason| reason.as_str() == s)
            .ok_or_else(|| RefundError::validation(format!("unknown refund reason {s:?}")))
    }
}

/// Aggregate root: RefundRequest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    id: RefundId,
    order_id: OrderId,
    user_id: UserId,
    payment_id: PaymentId,
    amount: i64,
    currency: Currency,
    reason: RefundReason,
    reason_text: String,
    status: RefundStatus,
    admin_reason: Option<String>,
    gateway_refund_id: Option<String>,
    requested_at: DateTime<Utc>,
    decided_at: Option<DateTime<Utc>>,
    processed_at: Option<DateTime<Utc>>,
    version: u64,
    created: bool,
}

/// Persisted shape of a refund request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundParts {
    pub id: RefundId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub payment_id: PaymentId,
    pub amount: i64,
    pub currency: Currency,
    pub reason: RefundReason,
    pub reason_text: String,
    pub status: RefundStatus,
    pub admin_reason: Option<String>,
    pub gateway_refund_id: Option<String>,
    pub requested_at: DateTime<Utc>,
    pub decided_at: Option<DateTime<Utc>>,
    pub processed_at: Option<DateTime<Utc>>,
    pub version: u64,
}

impl RefundRequest {
    pub fn empty(id: RefundId) -> Self {
        Self {
            id,
            order_id: OrderId::from_uuid(Uuid::nil()),
            user_id: UserId::from_uuid(Uuid::nil()),
            payment_id: PaymentId::from_uuid(Uuid::nil()),
            amount: 0,
            currency: Currency::usd(),
            reason: RefundReason::Other,
            reason_text: String::new(),
            status: RefundStatus::Pending,
            admin_reason: None,
            gateway_refund_id: None,
            requested_at: DateTime::<Utc>::default(),
            decided_at: None,
            processed_at: None,
            version: 0,
            created: false,
        }
    }

    pub fn restore(parts: RefundParts) -> Self {
        Self {
            id: parts.id,
            order_id: parts.order_id,
            user_id: parts.user_id,
            payment_id: parts.payment_id,
            amount: parts.amount,
            currency: parts.currency,
            reason: parts.reason,
            reason_text: parts.reason_text,
            status: parts.status,
            admin_reason: parts.admin_reason,
            gateway_refund_id: parts.gateway_refund_id,
            requested_at: parts.requested_at,
            decided_at: parts.decided_at,
            processed_at: parts.processed_at,
            version: parts.version,
            created: true,
        }
    }

    pub fn to_parts(&self) -> RefundParts {
        RefundParts {
            id: self.id,
            order_id: self.order_id,
            user_id: self.user_id,
            payment_id: self.payment_id,
            amount: self.amount,
            currency: self.currency.clone(),
            reason: self.reason,
            reason_text: self.reason_text.clone(),
            status: self.status,
            admin_reason: self.admin_reason.clone(),
            gateway_refund_id: self.gateway_refund_id.clone(),
            requested_at: self.requested_at,
            decided_at: self.decided_at,
            processed_at: self.processed_at,
            version: self.version,
        }
    }

    pub fn id_typed(&self) -> RefundId {
        self.id
    }

    pub fn order_id(&self) -> OrderId {
        self.order_id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn payment_id(&self) -> PaymentId {
        self.payment_id
    }

    pub fn amount(&self) -> i64 {
        self.amount
    }

    pub fn currency(&self) -> &Currency {
        &self.currency
    }

    pub fn reason(&self) -> RefundReason {
        self.reason
    }

    pub fn reason_text(&self) -> &str {
        &self.reason_text
    }

    pub fn status(&self) -> RefundStatus {
        self.status
    }

    pub fn admin_reason(&self) -> Option<&str> {
        self.admin_reason.as_deref()
    }

    pub fn gateway_refund_id(&self) -> Option<&str> {
        self.gateway_refund_id.as_deref()
    }

    pub fn requested_at(&self) -> DateTime<Utc> {
        self.requested_at
    }

    pub fn decided_at(&self) -> Option<DateTime<Utc>> {
        self.decided_at
    }

    pub fn processed_at(&self) -> Option<DateTime<Utc>> {
        self.processed_at
    }
}

impl AggregateRoot for RefundRequest {
    type Id = RefundId;

    fn id(&self) -> &Self::Id {
        &self.id
    }

    fn version(&self) -> u64 {
        self.version
    }
}

/// Command: RequestRefund.
///
/// Order-level preconditions (order paid, no other open request) are checked
/// by the caller, which has to query for them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestRefund {
    pub order_id: OrderId,
    pub user_id: UserId,
    pub payment_id: PaymentId,
    pub payment_amount: i64,
    pub currency: Currency,
    /// `None` refunds the full payment.
    pub amount: Option<i64>,
    pub reason: RefundReason,
    pub reason_text: String,
    pub paid_at: DateTime<Utc>,
    pub refund_window: Duration,
    pub occurred_at: DateTime<Utc>,
}

/// Command: DecideRefund (admin approve/reject).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecideRefund {
    pub approve: bool,
    pub admin_reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Where a processed confirmation came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionSource {
    /// Synchronous gateway response during approval.
    Approval,
    /// Later gateway webhook.
    GatewayConfirmation,
}

/// Command: MarkRefundProcessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRefundProcessed {
    pub gateway_refund_id: String,
    pub source: CompletionSource,
    pub occurred_at: DateTime<Utc>,
}

/// Command: MarkRefundFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarkRefundFailed {
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum RefundCommand {
    RequestRefund(RequestRefund),
    DecideRefund(DecideRefund),
    MarkRefundProcessed(MarkRefundProcessed),
    MarkRefundFailed(MarkRefundFailed),
}

/// Event: RefundRequested.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundRequested {
    pub refund_id: RefundId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub payment_id: PaymentId,
    pub amount: i64,
    pub currency: Currency,
    pub reason: RefundReason,
    pub reason_text: String,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundDecided.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundDecided {
    pub refund_id: RefundId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub approved: bool,
    pub amount: i64,
    pub admin_reason: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundProcessed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundProcessed {
    pub refund_id: RefundId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: i64,
    pub currency: Currency,
    pub gateway_refund_id: String,
    pub source: CompletionSource,
    pub occurred_at: DateTime<Utc>,
}

/// Event: RefundFailed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefundFailed {
    pub refund_id: RefundId,
    pub order_id: OrderId,
    pub user_id: UserId,
    pub amount: i64,
    pub error: String,
    pub occurred_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum RefundEvent {
    RefundRequested(RefundRequested),
    RefundDecided(RefundDecided),
    RefundProcessed(RefundProcessed),
    RefundFailed(RefundFailed),
}

impl Event for RefundEvent {
    fn event_type(&self) -> &'static str {
        match self {
            RefundEvent::RefundRequested(_) => "order.refund_requested",
            RefundEvent::RefundDecided(e) if e.approved => "order.refund_approved",
            RefundEvent::RefundDecided(_) => "order.refund_rejected",
            RefundEvent::RefundProcessed(e) => match e.source {
                CompletionSource::Approval => "order.refund_processed",
                CompletionSource::GatewayConfirmation => "order.refund_completed",
            },
            RefundEvent::RefundFailed(_) => "order.refund_failed",
        }
    }

    /// Refund events travel with the order's events so consumers see them in
    /// order relative to `order.paid` / `order.refunded`.
    fn topic(&self) -> Topic {
        Topic::OrderEvents
    }

    fn aggregate_id(&self) -> Uuid {
        let id = match self {
            RefundEvent::RefundRequested(e) => e.order_id,
            RefundEvent::RefundDecided(e) => e.order_id,
            RefundEvent::RefundProcessed(e) => e.order_id,
            RefundEvent::RefundFailed(e) => e.order_id,
        };
        *id.as_uuid()
    }

    fn occurred_at(&self) -> DateTime<Utc> {
        match self {
            RefundEvent::RefundRequested(e) => e.occurred_at,
            RefundEvent::RefundDecided(e) => e.occurred_at,
            RefundEvent::RefundProcessed(e) => e.occurred_at,
            RefundEvent::RefundFailed(e) => e.occurred_at,
        }
    }
}

impl Aggregate for RefundRequest {
    type Command = RefundCommand;
    type Event = RefundEvent;
    type Error = RefundError;

    fn apply(&mut self, event: &Self::Event) {
        match event {
            RefundEvent::RefundRequested(e) => {
                self.id = e.refund_id;
                self.order_id = e.order_id;
                self.user_id = e.user_id;
                self.payment_id = e.payment_id;
                self.amount = e.amount;
                self.currency = e.currency.clone();
                self.reason = e.reason;
                self.reason_text = e.reason_text.clone();
                self.status = RefundStatus::Pending;
                self.requested_at = e.occurred_at;
                self.created = true;
            }
            RefundEvent::RefundDecided(e) => {
                self.status = if e.approved {
                    RefundStatus::Approved
                } else {
                    RefundStatus::Rejected
                };
                self.admin_reason = e.admin_reason.clone();
                self.decided_at = Some(e.occurred_at);
            }
            RefundEvent::RefundProcessed(e) => {
                self.status = RefundStatus::Processed;
                self.gateway_refund_id = Some(e.gateway_refund_id.clone());
                self.processed_at = Some(e.occurred_at);
            }
            RefundEvent::RefundFailed(e) => {
                self.status = RefundStatus::Failed;
                self.admin_reason = Some(match &self.admin_reason {
                    Some(reason) => format!("{reason} (gateway error: {})", e.error),
                    None => format!("gateway error: {}", e.error),
                });
            }
        }

        self.version += 1;
    }

    fn handle(&self, command: &Self::Command) -> Result<Vec<Self::Event>, Self::Error> {
        match command {
            RefundCommand::RequestRefund(cmd) => self.handle_request(cmd),
            RefundCommand::DecideRefund(cmd) => self.handle_decide(cmd),
            RefundCommand::MarkRefundProcessed(cmd) => self.handle_processed(cmd),
            RefundCommand::MarkRefundFailed(cmd) => self.handle_failed(cmd),
        }
    }
}

impl RefundRequest {
    fn ensure_created(&self) -> Result<(), RefundError> {
        if !self.created {
            return Err(RefundError::RefundNotFound);
        }
        Ok(())
    }

    fn handle_request(&self, cmd: &RequestRefund) -> Result<Vec<RefundEvent>, RefundError> {
        if self.created {
            return Err(RefundError::RefundAlreadyRequested);
        }
        if cmd.occurred_at > cmd.paid_at + cmd.refund_window {
            return Err(RefundError::RefundWindowExpired);
        }

        let amount = match cmd.amount {
            None => cmd.payment_amount,
            Some(amount) if amount <= 0 => return Err(RefundError::InvalidRefundAmount),
            Some(amount) if amount > cmd.payment_amount => {
                return Err(RefundError::RefundAmountExceedsPayment {
                    requested: amount,
                    available: cmd.payment_amount,
                });
            }
            Some(amount) => amount,
        };
        if amount <= 0 {
            return Err(RefundError::InvalidRefundAmount);
        }

        Ok(vec![RefundEvent::RefundRequested(RefundRequested {
            refund_id: self.id,
            order_id: cmd.order_id,
            user_id: cmd.user_id,
            payment_id: cmd.payment_id,
            amount,
            currency: cmd.currency.clone(),
            reason: cmd.reason,
            reason_text: cmd.reason_text.trim().to_string(),
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_decide(&self, cmd: &DecideRefund) -> Result<Vec<RefundEvent>, RefundError> {
        self.ensure_created()?;
        if self.status != RefundStatus::Pending {
            return Err(RefundError::RefundAlreadyProcessed {
                status: self.status,
            });
        }

        Ok(vec![RefundEvent::RefundDecided(RefundDecided {
            refund_id: self.id,
            order_id: self.order_id,
            user_id: self.user_id,
            approved: cmd.approve,
            amount: self.amount,
            admin_reason: cmd.admin_reason.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }

    /// Processed is idempotent: confirming an already processed request
    /// yields no events.
    fn handle_processed(&self, cmd: &MarkRefundProcessed) -> Result<Vec<RefundEvent>, RefundError> {
        self.ensure_created()?;

        let allowed = match (self.status, cmd.source) {
            (RefundStatus::Processed, _) => return Ok(vec![]),
            (RefundStatus::Approved, _) => true,
            (RefundStatus::Failed, CompletionSource::GatewayConfirmation) => true,
            _ => false,
        };
        if !allowed {
            return Err(RefundError::RefundAlreadyProcessed {
                status: self.status,
            });
        }
        if cmd.gateway_refund_id.trim().is_empty() {
            return Err(RefundError::validation("gateway_refund_id must not be empty"));
        }

        Ok(vec![RefundEvent::RefundProcessed(RefundProcessed {
            refund_id: self.id,
            order_id: self.order_id,
            user_id: self.user_id,
            amount: self.amount,
            currency: self.currency.clone(),
            gateway_refund_id: cmd.gateway_refund_id.clone(),
            source: cmd.source,
            occurred_at: cmd.occurred_at,
        })])
    }

    fn handle_failed(&self, cmd: &MarkRefundFailed) -> Result<Vec<RefundEvent>, RefundError> {
        self.ensure_created()?;
        if !self.status.can_transition_to(RefundStatus::Failed) {
            return Err(RefundError::RefundAlreadyProcessed {
                status: self.status,
            });
        }

        Ok(vec![RefundEvent::RefundFailed(RefundFailed {
            refund_id: self.id,
            order_id: self.order_id,
            user_id: self.user_id,
            amount: self.amount,
            error: cmd.error.clone(),
            occurred_at: cmd.occurred_at,
        })])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn paid_at() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 6, 1, 10, 0, 0).unwrap()
    }

    fn request_cmd(amount: Option<i64>) -> RequestRefund {
        RequestRefund {
            order_id: OrderId::new(),
            user_id: UserId::new(),
            payment_id: PaymentId::new(),
            payment_amount: 9_000,
            currency: Currency::usd(),
            amount,
            reason: RefundReason::Quality,
            reason_text: " audio is broken ".to_string(),
            paid_at: paid_at(),
            refund_window: Duration::days(30),
            occurred_at: paid_at() + Duration::days(2),
        }
    }

    fn pending_refund() -> RefundRequest {
        let mut refund = RefundRequest::empty(RefundId::new());
        refund.execute(&RefundCommand::RequestRefund(request_cmd(None))).unwrap();
        refund
    }

    fn decide(approve: bool) -> RefundCommand {
        RefundCommand::DecideRefund(DecideRefund {
            approve,
            admin_reason: Some("reviewed".to_string()),
            occurred_at: paid_at() + Duration::days(3),
        })
    }

    fn processed(source: CompletionSource) -> RefundCommand {
        RefundCommand::MarkRefundProcessed(MarkRefundProcessed {
            gateway_refund_id: "re_1".to_string(),
            source,
            occurred_at: paid_at() + Duration::days(3),
        })
    }

    #[test]
    fn default_amount_is_full_payment() {
        let refund = pending_refund();
        assert_eq!(refund.amount(), 9_000);
        assert_eq!(refund.status(), RefundStatus::Pending);
        assert_eq!(refund.reason_text(), "audio is broken");
    }

    #[test]
    fn amount_above_payment_is_rejected() {
        let refund = RefundRequest::empty(RefundId::new());
        let err = refund
            .handle(&RefundCommand::RequestRefund(request_cmd(Some(9_001))))
            .unwrap_err();
        assert_eq!(
            err,
            RefundError::RefundAmountExceedsPayment {
                requested: 9_001,
                available: 9_000
            }
        );
    }

    #[test]
    fn non_positive_amount_is_rejected() {
        let refund = RefundRequest::empty(RefundId::new());
        let err = refund
            .handle(&RefundCommand::RequestRefund(request_cmd(Some(0))))
            .unwrap_err();
        assert_eq!(err, RefundError::InvalidRefundAmount);
    }

    #[test]
    fn request_outside_window_is_rejected() {
        let refund = RefundRequest::empty(RefundId::new());
        let mut cmd = request_cmd(None);
        cmd.occurred_at = paid_at() + Duration::days(31);
        let err = refund.handle(&RefundCommand::RequestRefund(cmd)).unwrap_err();
        assert_eq!(err, RefundError::RefundWindowExpired);
    }

    #[test]
    fn reject_emits_refund_rejected() {
        let mut refund = pending_refund();
        let events = refund.execute(&decide(false)).unwrap();
        assert_eq!(events[0].event_type(), "order.refund_rejected");
        assert_eq!(refund.status(), RefundStatus::Rejected);
        assert_eq!(refund.admin_reason(), Some("reviewed"));
    }

    #[test]
    fn decisions_are_final() {
        let mut refund = pending_refund();
        refund.execute(&decide(true)).unwrap();
        let err = refund.handle(&decide(false)).unwrap_err();
        assert_eq!(
            err,
            RefundError::RefundAlreadyProcessed {
                status: RefundStatus::Approved
            }
        );
    }

    #[test]
    fn approved_refund_can_be_processed_once() {
        let mut refund = pending_refund();
        refund.execute(&decide(true)).unwrap();
        let events = refund.execute(&processed(CompletionSource::Approval)).unwrap();
        assert_eq!(events[0].event_type(), "order.refund_processed");
        assert_eq!(refund.gateway_refund_id(), Some("re_1"));

        let again = refund
            .execute(&processed(CompletionSource::GatewayConfirmation))
            .unwrap();
        assert!(again.is_empty());
    }

    #[test]
    fn gateway_failure_keeps_the_approval_reason() {
        let mut refund = pending_refund();
        refund.execute(&decide(true)).unwrap();
        let events = refund
            .execute(&RefundCommand::MarkRefundFailed(MarkRefundFailed {
                error: "timeout".to_string(),
                occurred_at: paid_at() + Duration::days(3),
            }))
            .unwrap();
        assert_eq!(events[0].event_type(), "order.refund_failed");
        assert_eq!(refund.status(), RefundStatus::Failed);
        assert_eq!(refund.admin_reason(), Some("reviewed (gateway error: timeout)"));
        assert!(refund.status().blocks_new_request());
    }

    #[test]
    fn gateway_confirmation_settles_a_failed_refund() {
        let mut refund = pending_refund();
        refund.execute(&decide(true)).unwrap();
        refund
            .execute(&RefundCommand::MarkRefundFailed(MarkRefundFailed {
                error: "timeout".to_string(),
                occurred_at: paid_at(),
            }))
            .unwrap();

        assert!(refund.handle(&processed(CompletionSource::Approval)).is_err());
        let events = refund
            .execute(&processed(CompletionSource::GatewayConfirmation))
            .unwrap();
        assert_eq!(events[0].event_type(), "order.refund_completed");
        assert_eq!(refund.status(), RefundStatus::Processed);
    }

    #[test]
    fn pending_refund_cannot_be_processed() {
        let refund = pending_refund();
        assert!(refund.handle(&processed(CompletionSource::GatewayConfirmation)).is_err());
    }

    #[test]
    fn refund_status_table() {
        for from in RefundStatus::ALL {
            for to in RefundStatus::ALL {
                let expected = matches!(
                    (from, to),
                    (RefundStatus::Pending, RefundStatus::Approved)
                        | (RefundStatus::Pending, RefundStatus::Rejected)
                        | (RefundStatus::Approved, RefundStatus::Processed)
                        | (RefundStatus::Approved, RefundStatus::Failed)
                );
                assert_eq!(from.can_transition_to(to), expected, "{from} -> {to}");
            }
        }
    }

    #[test]
    fn refund_events_are_keyed_by_order() {
        let refund = pending_refund();
        let events = refund.handle(&decide(true)).unwrap();
        assert_eq!(events[0].aggregate_id(), *refund.order_id().as_uuid());
        assert_eq!(events[0].topic(), Topic::OrderEvents);
    }
}
