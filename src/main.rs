use spo_ingestor::adapters::{InMemoryStore, MqttAdapter, MqttAlertPublisher, PostgresStore};
use spo_ingestor::config::AppConfig;
use spo_ingestor::ports::{MessageBroker, PersistenceStore};
use spo_ingestor::service::alerts::AlertLifecycle;
use spo_ingestor::service::bridge::{run_event_loop, TelemetryBridge, Topics};
use spo_ingestor::service::coordinator::IngestionCoordinator;
use spo_ingestor::service::notify::NotificationQueue;
use spo_ingestor::service::worker_pool::WorkerPool;
use spo_ingestor::telemetry;
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 0. Load Env Vars First
    dotenvy::dotenv().ok();

    // 1. Initialize Structured Logging
    telemetry::init_tracing()?;
    info!("Starting Smart Power Optimizer ingestor...");

    // 2. Load Configuration
    let config = match AppConfig::load() {
        Ok(c) => c,
        Err(e) => {
            error!("Failed to load configuration: {:?}", e);
            std::process::exit(1);
        }
    };
    info!(base = %config.mqtt_base, host = %config.mqtt_host, port = config.mqtt_port, "Configuration loaded.");

    // 3. Initialize Metrics
    telemetry::init_metrics(config.metrics_port)?;
    info!("Prometheus Metrics listening on 0.0.0.0:{}", config.metrics_port);

    // 4. Persistence
    let store: Arc<dyn PersistenceStore> = match &config.database_url {
        Some(url) => {
            info!("Connecting to Database...");
            let pool = PgPoolOptions::new()
                .max_connections(10)
                .connect(url)
                .await
                .map_err(|e| anyhow::anyhow!("Failed to connect to DB: {:?}", e))?;
            let store = PostgresStore::new(pool);
            store.ensure_schema().await?;
            info!("Database connection established.");
            Arc::new(store)
        }
        None => {
            warn!("DATABASE_URL not set, using in-memory store (nothing survives a restart)");
            Arc::new(InMemoryStore::new())
        }
    };

    // 5. MQTT
    let (mqtt_client, eventloop) = MqttAdapter::build(&config);
    let broker: Arc<dyn MessageBroker> = Arc::new(MqttAdapter::new(mqtt_client.clone()));
    let topics = Topics::new(&config.mqtt_base);
    let bridge = Arc::new(TelemetryBridge::new(topics.clone(), broker.clone()));

    // 6. Core services
    let notifier = Arc::new(MqttAlertPublisher::new(broker.clone(), topics.alerts()));
    let (notifications, notify_handle) =
        NotificationQueue::spawn(notifier, config.notify_queue, config.notify_concurrency);
    let alerts = Arc::new(AlertLifecycle::new(store.clone(), bridge.clone()));
    let coordinator = Arc::new(IngestionCoordinator::new(
        store,
        alerts,
        notifications,
        &config.detector,
        &config.window,
    ));

    if let Err(e) = coordinator.load_device_overrides().await {
        error!("Failed to load device overrides, using defaults: {:?}", e);
    }

    // 7. Workers & event loop
    let (workers, worker_handles) =
        WorkerPool::spawn(coordinator.clone(), config.ingest_workers, config.ingest_queue);

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut mqtt_handle = tokio::spawn(run_event_loop(eventloop, bridge, workers, shutdown_rx));

    info!("System Running. MQTT -> Workers -> Store. Press Ctrl+C to stop.");

    // 8. Shutdown Signal
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown Signal Received..."),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    // 9. Graceful Shutdown
    // Stop intake -> workers drain -> coordinator drops -> notifier drains -> disconnect.
    // The event loop keeps polling throughout so alert publishes still go out.
    let _ = shutdown_tx.send(true);

    let timeout = std::time::Duration::from_secs(20);
    let drain = async {
        for handle in worker_handles {
            let _ = handle.await;
        }
        drop(coordinator);
        let _ = notify_handle.await;
    };
    match tokio::time::timeout(timeout, drain).await {
        Ok(()) => info!("Workers and notifications drained."),
        Err(_) => warn!("Timeout waiting for workers to drain."),
    }

    if let Err(e) = mqtt_client.disconnect().await {
        warn!("MQTT disconnect failed: {:?}", e);
    }
    match tokio::time::timeout(std::time::Duration::from_secs(5), &mut mqtt_handle).await {
        Ok(_) => info!("MQTT event loop stopped."),
        Err(_) => {
            warn!("MQTT event loop did not stop in time, aborting it.");
            mqtt_handle.abort();
        }
    }
    info!("Shutdown Complete.");

    Ok(())
}
