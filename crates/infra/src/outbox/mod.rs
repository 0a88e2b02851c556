//! Transactional outbox.
//!
//! - [`writer`]: appends events inside the caller's unit of work.
//! - [`publisher`]: background loop draining unpublished rows to the broker.
//!
//! Published rows are kept for inspection until [`cleanup`] removes them.

use chrono::{DateTime, Duration, Utc};
use tracing::info;

use crate::store::{OutboxStats, OutboxStore, StoreError};

pub mod publisher;
pub mod writer;

pub use publisher::{OutboxPublisher, PublisherConfig, PublisherHandle, PublisherStats, TickReport};
pub use writer::{append, append_event, append_events, OutboxWriteError};

/// Pending and published row counts.
pub async fn stats(store: &dyn OutboxStore) -> Result<OutboxStats, StoreError> {
    store.stats().await
}

/// Delete rows published more than `retention` before `now`. Pending rows
/// are never touched.
pub async fn cleanup(store: &dyn OutboxStore, now: DateTime<Utc>, retention: Duration) -> Result<u64, StoreError> {
    let cutoff = now - retention;
    let deleted = store.delete_published_before(cutoff).await?;
    if deleted > 0 {
        info!(deleted, %cutoff, "deleted published outbox rows");
    }
    Ok(deleted)
}
