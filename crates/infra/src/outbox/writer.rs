//! Outbox writer.
//!
//! Never opens its own transaction: the row only exists if the caller's unit
//! of work commits.

use serde::Serialize;
use thiserror::Error;

use orderflow_core::{Classified, ErrorClass};
use orderflow_events::{Event, NewOutboxEvent, OutboxEncodeError};

use crate::store::{StoreError, UnitOfWork};

#[derive(Debug, Error)]
pub enum OutboxWriteError {
    #[error(transparent)]
    Encode(#[from] OutboxEncodeError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Classified for OutboxWriteError {
    fn class(&self) -> ErrorClass {
        match self {
            OutboxWriteError::Encode(_) => ErrorClass::Dependency,
            OutboxWriteError::Store(e) => e.class(),
        }
    }

    fn code(&self) -> &'static str {
        match self {
            OutboxWriteError::Encode(_) => "outbox_encode_failed",
            OutboxWriteError::Store(e) => e.code(),
        }
    }
}

/// Append an already encoded row.
pub async fn append(uow: &mut dyn UnitOfWork, event: NewOutboxEvent) -> Result<i64, OutboxWriteError> {
    Ok(uow.append_outbox(event).await?)
}

/// Serialize `event` and append it.
pub async fn append_event<E>(uow: &mut dyn UnitOfWork, event: &E) -> Result<i64, OutboxWriteError>
where
    E: Event + Serialize,
{
    let row = NewOutboxEvent::from_event(event)?;
    append(uow, row).await
}

/// Append every event in order. Returns the assigned ids.
pub async fn append_events<E>(uow: &mut dyn UnitOfWork, events: &[E]) -> Result<Vec<i64>, OutboxWriteError>
where
    E: Event + Serialize,
{
    let mut ids = Vec::with_capacity(events.len());
    for event in events {
        ids.push(append_event(uow, event).await?);
    }
    Ok(ids)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, TimeZone, Utc};
    use uuid::Uuid;

    use orderflow_events::Topic;

    use crate::store::{InMemoryStore, Store};

    #[derive(Debug, Clone, Serialize)]
    struct Pinged {
        at: DateTime<Utc>,
    }

    impl Event for Pinged {
        fn event_type(&self) -> &'static str {
            "order.pinged"
        }

        fn topic(&self) -> Topic {
            Topic::OrderEvents
        }

        fn aggregate_id(&self) -> Uuid {
            Uuid::nil()
        }

        fn occurred_at(&self) -> DateTime<Utc> {
            self.at
        }
    }

    #[tokio::test]
    async fn rows_only_exist_after_commit() {
        let store = InMemoryStore::new();
        let event = Pinged {
            at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
        };

        let mut uow = store.begin().await.unwrap();
        let ids = append_events(uow.as_mut(), &[event]).await.unwrap();
        assert_eq!(ids, vec![1]);
        drop(uow);
        assert!(store.outbox_rows().await.is_empty());

        let mut uow = store.begin().await.unwrap();
        append_event(
            uow.as_mut(),
            &Pinged {
                at: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap(),
            },
        )
        .await
        .unwrap();
        uow.commit().await.unwrap();

        let rows = store.outbox_rows().await;
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].topic, "order.events");
        assert_eq!(rows[0].event_type, "order.pinged");
        assert!(rows[0].is_pending());
    }
}
