//! Order expiry sweep.
//!
//! Every `interval`, up to `batch_size` orders still in `pending_payment` and
//! at least `grace` past `expires_at` are cancelled with reason `"expired"`.
//! Each order is cancelled in its own unit of work; one failure is logged
//! and the sweep moves on.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use orderflow_core::Clock;

use crate::config::ExpirySettings;
use crate::services::OrderService;
use crate::store::{Store, StoreError};

/// Outcome of one pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub examined: usize,
    pub cancelled: usize,
    /// Paid, cancelled or otherwise moved on by the time it was locked.
    pub skipped: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SweeperStats {
    pub sweeps: u64,
    pub cancelled: u64,
    pub failed: u64,
    pub store_errors: u64,
    pub last_sweep_at: Option<DateTime<Utc>>,
}

pub struct ExpirySweeper {
    store: Arc<dyn Store>,
    orders: OrderService,
    clock: Arc<dyn Clock>,
    settings: ExpirySettings,
}

impl ExpirySweeper {
    pub fn new(store: Arc<dyn Store>, orders: OrderService, clock: Arc<dyn Clock>, settings: ExpirySettings) -> Self {
        Self {
            store,
            orders,
            clock,
            settings,
        }
    }

    /// One pass over the overdue orders.
    pub async fn run_once(&self) -> Result<SweepReport, StoreError> {
        let cutoff = self.clock.now() - self.settings.grace;
        let overdue = {
            let mut uow = self.store.begin().await?;
            uow.overdue_order_ids(cutoff, self.settings.batch_size).await?
        };

        let mut report = SweepReport {
            examined: overdue.len(),
            ..SweepReport::default()
        };
        for order_id in overdue {
            match self.orders.expire_order(order_id, self.settings.grace).await {
                Ok(true) => {
                    report.cancelled += 1;
                    info!(order_id = %order_id, "expired order cancelled");
                }
                Ok(false) => report.skipped += 1,
                Err(e) => {
                    report.failed += 1;
                    warn!(order_id = %order_id, error = %e, "failed to expire order, will retry next sweep");
                }
            }
        }

        if report.examined > 0 {
            debug!(?report, "expiry sweep finished");
        }
        Ok(report)
    }

    /// Spawn the sweep loop on the current tokio runtime.
    pub fn spawn(self) -> SweeperHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let stats = Arc::new(Mutex::new(SweeperStats::default()));
        let join = tokio::spawn(self.run(shutdown_rx, stats.clone()));

        SweeperHandle {
            shutdown: shutdown_tx,
            join: Some(join),
            stats,
        }
    }

    async fn run(self, mut shutdown: watch::Receiver<bool>, stats: Arc<Mutex<SweeperStats>>) {
        info!(interval = ?self.settings.interval, grace = %self.settings.grace, "expiry sweeper started");

        let mut ticker = tokio::time::interval(self.settings.interval);
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
            s.sweeps += 1;
            s.last_sweep_at = Some(self.clock.now());
            match outcome {
                Ok(report) => {
                    s.cancelled += report.cancelled as u64;
                    s.failed += report.failed as u64;
                }
                Err(e) => {
                    s.store_errors += 1;
                    error!(error = %e, "failed to list overdue orders");
                }
            }
        }

        info!("expiry sweeper stopped");
    }
}

#[derive(Debug)]
pub struct SweeperHandle {
    shutdown: watch::Sender<bool>,
    join: Option<JoinHandle<()>>,
    stats: Arc<Mutex<SweeperStats>>,
}

impl SweeperHandle {
    /// Signal shutdown and wait for the current sweep to finish.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(join) = self.join.take() {
            if let Err(e) = join.await {
                error!(error = %e, "expiry sweeper task failed");
            }
        }
    }

    pub fn stats(&self) -> SweeperStats {
        self.stats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::time::Duration as StdDuration;

    use chrono::{Duration, TimeZone};

    use orderflow_core::{ManualClock, OrderId, UserId};
    use orderflow_orders::{Order, OrderStatus};

    use crate::catalog::InMemoryCatalog;
    use crate::config::OrderSettings;
    use crate::gateway::InMemoryGateway;
    use crate::services::{CreateOrderRequest, PaymentService};
    use crate::store::InMemoryStore;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 20, 10, 0, 0).unwrap()
    }

    struct Fixture {
        store: InMemoryStore,
        clock: Arc<ManualClock>,
        catalog: Arc<InMemoryCatalog>,
        orders: OrderService,
        payments: PaymentService,
    }

    fn fixture() -> Fixture {
        let store = InMemoryStore::new();
        let clock = Arc::new(ManualClock::new(start()));
        let catalog = Arc::new(InMemoryCatalog::new());
        Fixture {
            orders: OrderService::new(Arc::new(store.clone()), catalog.clone(), clock.clone(), OrderSettings::default()),
            payments: PaymentService::new(
                Arc::new(store.clone()),
                Arc::new(InMemoryGateway::new()),
                clock.clone(),
                StdDuration::from_secs(1),
            ),
            store,
            clock,
            catalog,
        }
    }

    fn settings() -> ExpirySettings {
        ExpirySettings {
            interval: StdDuration::from_millis(10),
            grace: Duration::minutes(60),
            batch_size: 100,
        }
    }

    fn sweeper(f: &Fixture) -> ExpirySweeper {
        ExpirySweeper::new(Arc::new(f.store.clone()), f.orders.clone(), f.clock.clone(), settings())
    }

    async fn awaiting_payment(f: &Fixture) -> Order {
        let user = UserId::new();
        let course = f.catalog.add_course("Ownership", 1_500);
        let order = f
            .orders
            .create_order(CreateOrderRequest {
                user_id: user,
                course_ids: vec![course],
                coupon_code: None,
                customer_email: "buyer@example.com".to_string(),
                customer_name: None,
                metadata: BTreeMap::new(),
            })
            .await
            .unwrap();
        f.payments.initiate_payment(order.id_typed(), user).await.unwrap();
        order
    }

    async fn status(f: &Fixture, id: OrderId) -> OrderStatus {
        let mut uow = f.store.begin().await.unwrap();
        uow.order(id).await.unwrap().unwrap().status()
    }

    #[tokio::test]
    async fn cancels_only_past_the_grace_period() {
        let f = fixture();
        let order = awaiting_payment(&f).await;
        let sweeper = sweeper(&f);

        // Expired, but still inside the grace window.
        f.clock.advance(Duration::hours(24) + Duration::minutes(30));
        assert_eq!(sweeper.run_once().await.unwrap(), SweepReport::default());

        f.clock.advance(Duration::minutes(30));
        let report = sweeper.run_once().await.unwrap();
        assert_eq!(report.examined, 1);
        assert_eq!(report.cancelled, 1);

        let mut uow = f.store.begin().await.unwrap();
        let stored = uow.order(order.id_typed()).await.unwrap().unwrap();
        drop(uow);
        assert_eq!(stored.status(), OrderStatus::Cancelled);
        assert_eq!(stored.state().reason(), Some("expired"));
        assert_eq!(f.store.outbox_rows().await.pop().unwrap().event_type, "order.cancelled");
    }

    #[tokio::test]
    async fn fresh_orders_are_left_alone() {
        let f = fixture();
        let old = awaiting_payment(&f).await;
        f.clock.advance(Duration::hours(20));
        let fresh = awaiting_payment(&f).await;
        f.clock.advance(Duration::hours(6));

        let report = sweeper(&f).run_once().await.unwrap();
        assert_eq!(report.cancelled, 1);
        assert_eq!(status(&f, old.id_typed()).await, OrderStatus::Cancelled);
        assert_eq!(status(&f, fresh.id_typed()).await, OrderStatus::PendingPayment);

        // A second pass finds nothing left to do.
        assert_eq!(sweeper(&f).run_once().await.unwrap().examined, 0);
    }

    #[tokio::test]
    async fn batch_size_bounds_one_pass() {
        let f = fixture();
        for _ in 0..3 {
            awaiting_payment(&f).await;
        }
        f.clock.advance(Duration::hours(26));

        let mut small = settings();
        small.batch_size = 2;
        let sweeper = ExpirySweeper::new(Arc::new(f.store.clone()), f.orders.clone(), f.clock.clone(), small);

        assert_eq!(sweeper.run_once().await.unwrap().cancelled, 2);
        assert_eq!(sweeper.run_once().await.unwrap().cancelled, 1);
    }

    #[tokio::test]
    async fn one_failing_order_does_not_block_the_batch() {
        let f = fixture();
        let first = awaiting_payment(&f).await;
        f.clock.advance(Duration::seconds(1));
        let broken = awaiting_payment(&f).await;
        f.clock.advance(Duration::seconds(1));
        let last = awaiting_payment(&f).await;
        f.store.fail_order_updates(broken.id_typed()).await;
        f.clock.advance(Duration::hours(26));

        let report = sweeper(&f).run_once().await.unwrap();

        assert_eq!(report.examined, 3);
        assert_eq!(report.cancelled, 2);
        assert_eq!(report.failed, 1);
        assert_eq!(status(&f, first.id_typed()).await, OrderStatus::Cancelled);
        assert_eq!(status(&f, broken.id_typed()).await, OrderStatus::PendingPayment);
        assert_eq!(status(&f, last.id_typed()).await, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn spawned_loop_sweeps_and_stops() {
        let f = fixture();
        let order = awaiting_payment(&f).await;
        f.clock.advance(Duration::hours(26));

        let handle = sweeper(&f).spawn();
        for _ in 0..100 {
            if handle.stats().cancelled == 1 {
                break;
            }
            tokio::time::sleep(StdDuration::from_millis(5)).await;
        }
        let stats = handle.stats();
        handle.shutdown().await;

        assert_eq!(stats.cancelled, 1);
        assert!(stats.sweeps >= 1);
        assert_eq!(status(&f, order.id_typed()).await, OrderStatus::Cancelled);
    }
}
