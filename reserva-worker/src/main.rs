use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod consumer;
mod sweep;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "reserva_worker=debug,reserva_engine=debug,reserva_store=debug".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = reserva_store::Config::load().expect("Failed to load config");
    tracing::info!("Starting booking coordinator worker");

    let store =
        reserva_store::PgStore::connect(&config.database.url, config.database.max_connections)
            .await
            .expect("Failed to connect to Postgres");
    store.migrate().await.expect("Failed to run migrations");
    let store = Arc::new(store);

    let producer = reserva_store::EventProducer::new(&config.kafka.brokers)
        .expect("Failed to create Kafka producer");
    let producer = Arc::new(producer);

    let retry = reserva_engine::RetryPolicy::new(
        config.retry.max_attempts,
        Duration::from_millis(config.retry.base_delay_ms),
    );
    let saga = Arc::new(reserva_engine::BookingSagaCoordinator::new(
        store, producer, retry,
    ));

    let sweep_saga = saga.clone();
    let sweep_period = Duration::from_secs(config.worker.completion_sweep_seconds);
    let sweep_batch = config.worker.sweep_batch;
    tokio::spawn(async move {
        sweep::run_completion_sweep(sweep_saga, sweep_period, sweep_batch).await;
    });

    consumer::run(&config.kafka.brokers, &config.kafka.group_id, saga).await;
}
