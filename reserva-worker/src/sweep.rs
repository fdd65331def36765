use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::error;

use reserva_engine::BookingSagaCoordinator;
use reserva_store::{EventProducer, PgStore};

/// Periodic completion pass: confirmed bookings whose slot start time has
/// elapsed are moved to Completed.
pub async fn run_completion_sweep(
    saga: Arc<BookingSagaCoordinator<PgStore, EventProducer>>,
    period: Duration,
    batch: i64,
) {
    let mut ticker = tokio::time::interval(period);
    loop {
        ticker.tick().await;
        if let Err(e) = saga.complete_elapsed(Utc::now(), batch).await {
            error!("completion sweep failed: {}", e);
        }
    }
}
