use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::event::Event;

/// An outbox row that has not been inserted yet (no id assigned).
///
/// Built from a typed domain event with [`NewOutboxEvent::from_event`], which
/// serializes the event to JSON and captures its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewOutboxEvent {
    pub aggregate_id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Failed to serialize an event payload.
#[derive(Debug, Error)]
#[error("failed to encode {event_type} payload: {source}")]
pub struct OutboxEncodeError {
    pub event_type: &'static str,
    #[source]
    pub source: serde_json::Error,
}

impl NewOutboxEvent {
    pub fn from_event<E>(event: &E) -> Result<Self, OutboxEncodeError>
    where
        E: Event + Serialize,
    {
        let payload = serde_json::to_vec(event).map_err(|source| OutboxEncodeError {
            event_type: event.event_type(),
            source,
        })?;

        Ok(Self {
            aggregate_id: event.aggregate_id(),
            topic: event.topic().as_str().to_string(),
            event_type: event.event_type().to_string(),
            payload,
            created_at: event.occurred_at(),
        })
    }
}

/// A persisted outbox row.
///
/// Append-only: the only mutation after insert is stamping `published_at`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutboxEvent {
    /// Monotonically increasing insertion id. Publishing order follows it.
    pub id: i64,
    pub aggregate_id: Uuid,
    pub topic: String,
    pub event_type: String,
    pub payload: Vec<u8>,
    pub created_at: DateTime<Utc>,
    /// `None` while the row is pending.
    pub published_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub fn from_new(id: i64, event: NewOutboxEvent) -> Self {
        Self {
            id,
            aggregate_id: event.aggregate_id,
            topic: event.topic,
            event_type: event.event_type,
            payload: event.payload,
            created_at: event.created_at,
            published_at: None,
        }
    }

    pub fn is_pending(&self) -> bool {
        self.published_at.is_none()
    }

    /// Decode the payload as JSON (for consumers and tests).
    pub fn payload_json(&self) -> Result<serde_json::Value, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topic::Topic;

    #[derive(Debug, Clone, Serialize)]
    struct Sample {
        id: Uuid,
        at: DateTime<Utc>,
    }

    impl Event for Sample {
        fn event_type(&self) -> &'static str {
            "order.sampled"
        }

        fn topic(&self) -> Topic {
            Topic::OrderEvents
        }

        fn aggregate_id(&self) -> Uuid {
            self.id
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[test]
    fn from_event_captures_routing_metadata() {
        let sample = Sample {
            id: Uuid::now_v7(),
            at: Utc::now(),
        };
        let row = NewOutboxEvent::from_event(&sample).unwrap();
        assert_eq!(row.aggregate_id, sample.id);
        assert_eq!(row.topic, "order.events");
        assert_eq!(row.event_type, "order.sampled");
        assert_eq!(row.created_at, sample.at);

        let stored = OutboxEvent::from_new(7, row);
        assert!(stored.is_pending());
        let json = stored.payload_json().unwrap();
        assert_eq!(json["id"], sample.id.to_string());
    }
}
