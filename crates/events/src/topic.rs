use serde::{Deserialize, Serialize};

/// Broker topics this service publishes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    /// Order lifecycle and refund events.
    #[serde(rename = "order.events")]
    OrderEvents,
    /// Payment attempt events.
    #[serde(rename = "payment.events")]
    PaymentEvents,
}

impl Topic {
    pub const ALL: [Topic; 2] = [Topic::OrderEvents, Topic::PaymentEvents];

    pub fn as_str(self) -> &'static str {
        match self {
            Topic::OrderEvents => "order.events",
            Topic::PaymentEvents => "payment.events",
        }
    }
}

impl core::fmt::Display for Topic {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
