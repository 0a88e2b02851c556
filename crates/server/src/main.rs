//! Background worker process: drains the outbox to the broker and cancels
//! orders left unpaid past their expiry.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use sqlx::postgres::PgPoolOptions;

use orderflow_core::{Clock, SystemClock};
use orderflow_infra::Config;
use orderflow_infra::broker::AmqpBroker;
use orderflow_infra::catalog::InMemoryCatalog;
use orderflow_infra::jobs::ExpirySweeper;
use orderflow_infra::outbox::{self, OutboxPublisher, PublisherConfig};
use orderflow_infra::services::OrderService;
use orderflow_infra::store::{PostgresStore, Store};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    orderflow_observability::init();

    let config = Config::from_env().context("invalid configuration")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(5))
        .connect(&config.database_url)
        .await
        .context("failed to connect to postgres")?;
    let store = PostgresStore::new(pool);
    store.migrate().await.context("failed to apply schema")?;

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let shared: Arc<dyn Store> = Arc::new(store.clone());

    let backlog = outbox::stats(&store).await.context("failed to read outbox")?;
    tracing::info!(pending = backlog.pending, published = backlog.published, "outbox state at start-up");

    let publisher = OutboxPublisher::new(
        Arc::new(store.clone()),
        Arc::new(AmqpBroker::new(config.amqp_url.clone())),
        clock.clone(),
        PublisherConfig::from_settings(&config.outbox),
    )
    .spawn();

    let orders = OrderService::new(shared.clone(), Arc::new(InMemoryCatalog::new()), clock.clone(), config.orders.clone());
    let sweeper = ExpirySweeper::new(shared, orders, clock, config.expiry.clone()).spawn();

    tracing::info!("orderflow worker running");
    tokio::signal::ctrl_c().await.context("failed to listen for shutdown signal")?;
    tracing::info!("shutdown requested");

    sweeper.shutdown().await;
    publisher.shutdown().await;

    tracing::info!("orderflow worker stopped");
    Ok(())
}
