//! Outbox publisher.
//!
//! Each tick:
//! 1. fetch up to `batch_size` unpublished rows in ascending id order
//! 2. make sure the broker is connected, reconnecting with exponential backoff
//! 3. publish every row (topic = exchange, event type = routing key) and stamp
//!    it published; a failed row stays pending for the next tick and does not
//!    stop the batch
//!
//! Delivery is at-least-once: a row whose stamp fails after a successful
//! publish is sent again later.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use orderflow_core::Clock;

use crate::broker::{BrokerError, MessageBroker};
use crate::config::OutboxSettings;
use crate::store::{OutboxStore, StoreError};

/// Publisher configuration.
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub poll_interval: Duration,
    pub batch_size: usize,
    pub publish_timeout: Duration,
    pub reconnect_min_delay: Duration,
    pub reconnect_max_delay: Duration,
    /// Reconnect attempts per tick before giving up until the next tick.
    pub reconnect_attempts: usize,
    /// Name for logging
    pub name: String,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(5),
            batch_size: 100,
            publish_timeout: Duration::from_secs(5),
            reconnect_min_delay: Duration::from_millis(100),
            reconnect_max_delay: Duration::from_secs(5),
            reconnect_attempts: 5,
            name: "outbox-publisher".to_string(),
        }
    }
}

impl PublisherConfig {
    pub fn from_settings(settings: &OutboxSettings) -> Self {
        Self {
            poll_interval: settings.poll_interval,
            batch_size: settings.batch_size,
            publish_timeout: settings.publish_timeout,
            ..Self::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_reconnect(mut self, min_delay: Duration, max_delay: Duration, attempts: usize) -> Self {
        self.reconnect_min_delay = min_delay;
        self.reconnect_max_delay = max_delay;
        self.reconnect_attempts = attempts;
        self
    }
}

/// Outcome of one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub fetched: usize,
    pub published: usize,
    pub failed: usize,
    /// The broker could not be reached; nothing was attempted.
    pub broker_unavailable: bool,
}

/// Publisher runtime statistics.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct PublisherStats {
    pub ticks: u64,
    pub published: u64,
    pub failed: u64,
    pub broker_unavailable_ticks: u64,
    pub store_errors: u64,
    pub last_tick_at: Option<DateTime<Utc>>,
}

pub struct OutboxPublisher {
    store: Arc<dyn OutboxStore>,
    broker: Arc<dyn MessageBroker>,
    clock: Arc<dyn Clock>,
    config: PublisherConfig,
}

impl OutboxPublisher {
    pub fn new(
        store: Arc<dyn OutboxStore>,
        broker: Arc<dyn MessageBroker>,
        clock: Arc<dyn Clock>,
        config: PublisherConfig,
    ) -> Self {
        Self {
            store,
            broker,
            clock,
            config,
        }
    }

    async fn ensure_connected(&self) -> Result<(), BrokerError> {
        if self.broker.is_connected().await {
            return Ok(());
        }

        let backoff = ExponentialBuilder::default()
            .with_min_delay(self.config.reconnect_min_delay)
            .with_max_delay(self.config.reconnect_max_delay)
            .with_max_times(self.config.reconnect_attempts)
            .with_jitter();

        (|| async { self.broker.connect().await })
            .retry(backoff)
            .sleep(tokio::time::sleep)
            .notify(|err: &BrokerError, delay: Duration| {
                warn!(
                    publisher = %self.config.name,
                    error = %err,
                    retry_in_ms = delay.as_millis() as u64,
                    "broker connection failed, retrying"
                );
            })
            .await
    }

    /// Run a single tick.
    pub async fn run_once(&self) -> Result<TickReport, StoreError> {
        let rows = self.store.fetch_unpublished(self.config.batch_size).await?;
        let mut report = TickReport {
            fetched: rows.len(),
            ..TickReport::default()
        };
        if rows.is_empty() {
            return Ok(report);
        }

        if let Err(e) = self.ensure_connected().await {
            error!(publisher = %self.config.name, error = %e, "broker unavailable, skipping tick");
            report.broker_unavailable = true;
            return Ok(report);
        }

        for row in rows {
            let publish = self.broker.publish(&row.topic, &row.event_type, &row.payload);
            let result = match tokio::time::timeout(self.config.publish_timeout, publish).await {
                Ok(result) => result,
                Err(_) => Err(BrokerError::Timeout(self.config.publish_timeout)),
            };

            match result {
                Ok(()) => {
                    report.published += 1;
                    if let Err(e) = self.store.mark_published(row.id, self.clock.now()).await {
                        warn!(
                            outbox_id = row.id,
                            error = %e,
                            "published but failed to stamp; event will be sent again"
                        );
                    } else {
                        debug!(outbox_id = row.id, event_type = %row.event_type, "published outbox event");
                    }
                }
                Err(e) => {
                    report.failed += 1;
                    warn!(
                        outbox_id = row.id,
                        topic = %row.topic,
                        event_type = %row.event_type,
                        error = %e,
                        "failed to publish outbox event, will retry next tick"
                    );
                }
            }
        }

        Ok(report)
    }

    /// Spawn the publisher loop on the current tokio runtime.
    pub fn spawn(self) -> PublisherHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(PublisherStats::default()));
        let join = tokio::spawn(self.run(shutdown_rx, stats.clone()));

        PublisherHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, stats: Arc<Mutex<PublisherStats>>) {
        info!(publisher = %self.config.name, "outbox publisher started");

        let mut ticker = tokio::time::interval(self.config.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                    continue;
                }
            }

            let outcome = self.run_once().await;

            let mut s = stats.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            s.ticks += 1;
            s.last_tick_at = Some(self.clock.now());
            match outcome {
                Ok(report) => {
                    s.published += report.published as u64;
                    s.failed += report.failed as u64;
                    if report.broker_unavailable {
                        s.broker_unavailable_ticks += 1;
                    }
                }
                Err(e) => {
                    s.store_errors += 1;
                    error!(publisher = %self.config.name, error = %e, "failed to read outbox");
                }
            }
        }

        if let Err(e) = self.broker.close().await {
            warn!(publisher = %self.config.name, error = %e, "failed to close broker connection");
        }
        info!(publisher = %self.config.name, "outbox publisher stopped");
    }
}

/// Handle to control a running publisher.
#[derive(Debug)]
pub struct PublisherHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<PublisherStats>>,
}

impl PublisherHandle {
    /// Signal shutdown and wait for the loop to release the broker.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "outbox publisher task failed");
            }
        }
    }

    pub fn stats(&self) -> PublisherStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}
