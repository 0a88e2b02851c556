//! Order status lifecycle.
//!
//! ```text
//! created ──► pending_payment ──► paid ──► refunded
//!    │              │  │
//!    │              │  └──► failed ──► cancelled
//!    └──────────────┴─────────────────► cancelled
//! ```

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::OrderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Created,
    PendingPayment,
    Paid,
    Failed,
    Cancelled,
    Refunded,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 6] = [
        OrderStatus::Created,
        OrderStatus::PendingPayment,
        OrderStatus::Paid,
        OrderStatus::Failed,
        OrderStatus::Cancelled,
        OrderStatus::Refunded,
    ];

    /// Transition table.
    pub fn allowed_next(self) -> &'static [OrderStatus] {
        match self {
            OrderStatus::Created => &[OrderStatus::PendingPayment, OrderStatus::Cancelled],
            OrderStatus::PendingPayment => {
                &[OrderStatus::Paid, OrderStatus::Failed, OrderStatus::Cancelled]
            }
            OrderStatus::Paid => &[OrderStatus::Refunded],
            OrderStatus::Failed => &[OrderStatus::Cancelled],
            OrderStatus::Cancelled | OrderStatus::Refunded => &[],
        }
    }

    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        self.allowed_next().contains(&next)
    }

    pub fn is_terminal(self) -> bool {
        self.allowed_next().is_empty()
    }

    /// Statuses from which the owner may still cancel.
    pub fn is_cancellable_by_user(self) -> bool {
        matches!(self, OrderStatus::Created | OrderStatus::PendingPayment)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            OrderStatus::Created => "created",
            OrderStatus::PendingPayment => "pending_payment",
            OrderStatus::Paid => "paid",
            OrderStatus::Failed => "failed",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::Refunded => "refunded",
        }
    }
}

impl core::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for OrderStatus {
    type Err = OrderError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OrderStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| OrderError::validation(format!("unknown order status {s:?}")))
    }
}

/// Status plus the data only that status carries.
///
/// A paid order has a paid timestamp and nothing else; a cancelled order has a
/// cancelled timestamp and a reason. At most one milestone timestamp exists and
/// it always matches the status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OrderState {
    Created,
    PendingPayment,
    Paid {
        paid_at: DateTime<Utc>,
    },
    Failed {
        failed_at: DateTime<Utc>,
        reason: Option<String>,
    },
    Cancelled {
        cancelled_at: DateTime<Utc>,
        reason: Option<String>,
    },
    Refunded {
        refunded_at: DateTime<Utc>,
    },
}

impl OrderState {
    pub fn status(&self) -> OrderStatus {
        match self {
            OrderState::Created => OrderStatus::Created,
            OrderState::PendingPayment => OrderStatus::PendingPayment,
            OrderState::Paid { .. } => OrderStatus::Paid,
            OrderState::Failed { .. } => OrderStatus::Failed,
            OrderState::Cancelled { .. } => OrderStatus::Cancelled,
            OrderState::Refunded { .. } => OrderStatus::Refunded,
        }
    }

    /// Build the state entered at `at` when moving to `status`.
    pub fn entered(status: OrderStatus, at: DateTime<Utc>, reason: Option<String>) -> Self {
        match status {
            OrderStatus::Created => OrderState::Created,
            OrderStatus::PendingPayment => OrderState::PendingPayment,
            OrderStatus::Paid => OrderState::Paid { paid_at: at },
            OrderStatus::Failed => OrderState::Failed {
                failed_at: at,
                reason,
            },
            OrderStatus::Cancelled => OrderState::Cancelled {
                cancelled_at: at,
                reason,
            },
            OrderStatus::Refunded => OrderState::Refunded { refunded_at: at },
        }
    }

    pub fn paid_at(&self) -> Option<DateTime<Utc>> {
        match self {
            OrderState::Paid { paid_at } => Some(*paid_at),
            _ => None,
        }
    }

    pub fn failed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            OrderState::Failed { failed_at, .. } => Some(*failed_at),
            _ => None,
        }
    }

    pub fn cancelled_at(&self) -> Option<DateTime<Utc>> {
        match self {
            OrderState::Cancelled { cancelled_at, .. } => Some(*cancelled_at),
            _ => None,
        }
    }

    pub fn refunded_at(&self) -> Option<DateTime<Utc>> {
        match self {
            OrderState::Refunded { refunded_at } => Some(*refunded_at),
            _ => None,
        }
    }

    /// Failure or cancellation reason, if the state carries one.
    pub fn reason(&self) -> Option<&str> {
        match self {
            OrderState::Failed { reason, .. } | OrderState::Cancelled { reason, .. } => {
                reason.as_deref()
            }
            _ => None,
        }
    }
}
