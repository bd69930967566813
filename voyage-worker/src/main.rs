use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use voyage_core::{LogNotifier, Notifier, StockStore};
use voyage_order::{Maintenance, OrderService};
use voyage_store::app_config::NotificationBackend;
use voyage_store::{Config, DbClient, EventProducer, KafkaNotifier, PgStockStore};
use voyage_worker::worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "voyage_worker=debug,voyage_order=info,voyage_inventory=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::load().context("Failed to load config")?;
    tracing::info!(
        interval_secs = config.maintenance.sweep_interval_secs,
        dry_run = config.maintenance.dry_run,
        "Starting Voyage maintenance worker"
    );

    let db = DbClient::new(&config.database)
        .await
        .context("Failed to connect to Postgres")?;
    db.migrate().await.context("Failed to run migrations")?;

    let store: Arc<dyn StockStore> =
        Arc::new(PgStockStore::new(db.pool.clone(), config.ledger.lock_timeout()));

    let notifier: Arc<dyn Notifier> = match config.notifications.backend {
        NotificationBackend::Log => Arc::new(LogNotifier),
        NotificationBackend::Kafka => {
            let producer = EventProducer::new(&config.kafka.brokers)
                .context("Failed to create Kafka producer")?;
            Arc::new(KafkaNotifier::new(producer, config.kafka.topic.clone()))
        }
    };

    let orders = OrderService::new(store.clone(), notifier);
    let maintenance = Maintenance::new(
        store,
        orders.carts().clone(),
        chrono::Duration::hours(config.maintenance.cart_retention_hours),
        chrono::Duration::hours(config.maintenance.idempotency_retention_hours),
    );

    worker::run(maintenance, &config.maintenance).await;
    Ok(())
}
