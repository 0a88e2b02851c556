use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::topic::Topic;

/// A domain event.
///
/// Events are:
/// - **immutable** (treat them as facts)
/// - **versioned** (schema evolution)
/// - routed by `topic` (broker exchange) and `event_type` (routing key)
pub trait Event: Clone + core::fmt::Debug + Send + Sync + 'static {
    /// Stable event name (e.g. "order.paid"). Used as the routing key.
    fn event_type(&self) -> &'static str;

    /// Destination topic on the broker.
    fn topic(&self) -> Topic;

    /// Id of the aggregate the event belongs to. Ordering is only guaranteed
    /// between events sharing this id.
    fn aggregate_id(&self) -> Uuid;

    /// Schema version for this event type.
    fn version(&self) -> u32 {
        1
    }

    /// When the event occurred (business time).
    fn occurred_at(&self) -> DateTime<Utc>;
}
