use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, info, instrument, warn};

use orderflow_core::Clock;

use super::{InboundWebhook, WebhookHandler, WebhookOutcome};
use crate::store::{Store, StoreError, WebhookRecord};

/// Ledger-backed deduplication for gateway webhooks.
///
/// The ledger row is recorded in its own unit of work first, so a delivery
/// whose handler fails is still on file. The handler then runs in a second
/// unit of work that re-locks the row and stamps it processed on success.
/// Two concurrent deliveries of one id serialise on that lock; the loser sees
/// the stamp and reports a duplicate.
#[derive(Clone)]
pub struct WebhookDeduplicator {
    store: Arc<dyn Store>,
    clock: Arc<dyn Clock>,
}

impl WebhookDeduplicator {
    pub fn new(store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Run `handler` for `webhook` unless its event id was already processed.
    ///
    /// Handler errors are logged and reported as
    /// [`WebhookOutcome::HandlerFailed`], never returned. Only ledger storage
    /// failures surface as errors.
    #[instrument(skip(self, webhook, handler), fields(event_id = %webhook.event_id, event_type = %webhook.event_type), err)]
    pub async fn accept(&self, webhook: &InboundWebhook, handler: &dyn WebhookHandler) -> Result<WebhookOutcome, StoreError> {
        let mut uow = self.store.begin().await?;
        match uow.webhook_for_update(&webhook.event_id).await? {
            Some(row) if row.processed => {
                debug!("duplicate webhook");
                return Ok(WebhookOutcome::Duplicate);
            }
            Some(_) => {}
            None => {
                uow.insert_webhook(&WebhookRecord {
                    event_id: webhook.event_id.clone(),
                    event_type: webhook.event_type.clone(),
                    payload: webhook.payload.clone(),
                    processed: false,
                    processed_at: None,
                    received_at: self.clock.now(),
                })
                .await?;
            }
        }
        uow.commit().await?;

        let mut uow = self.store.begin().await?;
        let row = uow
            .webhook_for_update(&webhook.event_id)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("webhook {}", webhook.event_id)))?;
        if row.processed {
            debug!("webhook processed by a concurrent delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        if let Err(err) = handler.handle(uow.as_mut(), webhook).await {
            drop(uow);
            warn!(error = %err, "webhook handler failed, leaving it for the next delivery");
            return Ok(WebhookOutcome::HandlerFailed);
        }
        uow.mark_webhook_processed(&webhook.event_id, self.clock.now()).await?;
        uow.commit().await?;

        info!("webhook processed");
        Ok(WebhookOutcome::Processed)
    }

    /// Ledger rows still waiting for a successful handler run, oldest first.
    pub async fn unprocessed(&self, limit: usize) -> Result<Vec<WebhookRecord>, StoreError> {
        let mut uow = self.store.begin().await?;
        uow.unprocessed_webhooks(limit).await
    }

    /// Drop processed rows received before `cutoff`.
    pub async fn purge_processed(&self, cutoff: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut uow = self.store.begin().await?;
        let purged = uow.purge_processed_webhooks(cutoff).await?;
        uow.commit().await?;
        if purged > 0 {
            info!(purged, %cutoff, "purged processed webhooks");
        }
        Ok(purged)
    }
}
