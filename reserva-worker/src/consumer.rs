use std::sync::Arc;

use rdkafka::config::ClientConfig;
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Message};
use tracing::{error, info, warn};

use reserva_domain::events::DomainEvent;
use reserva_engine::{BookingSagaCoordinator, Disposition};
use reserva_store::{EventProducer, PgStore};

type Saga = BookingSagaCoordinator<PgStore, EventProducer>;

const TOPICS: &[&str] = &["booking.created", "payment.processed", "payment.failed"];

/// Consumer loop with manual offset commits: an offset is committed only
/// after the handler acknowledged the event, so a transient failure leaves
/// it in place for redelivery.
pub async fn run(brokers: &str, group_id: &str, saga: Arc<Saga>) {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", brokers)
        .set("group.id", group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()
        .expect("Consumer creation failed");

    consumer.subscribe(TOPICS).expect("Can't subscribe");

    info!("Booking coordinator listening on {:?}", TOPICS);

    loop {
        match consumer.recv().await {
            Err(e) => error!("Kafka error: {}", e),
            Ok(m) => {
                if handle_message(&saga, &m).await {
                    if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                        error!("Failed to commit offset: {}", e);
                    }
                }
            }
        }
    }
}

/// Returns true when the message should be acknowledged.
async fn handle_message(saga: &Saga, message: &BorrowedMessage<'_>) -> bool {
    let Some(payload) = message.payload() else {
        warn!("skipping empty message on {}", message.topic());
        return true;
    };
    let event: DomainEvent = match serde_json::from_slice(payload) {
        Ok(event) => event,
        Err(e) => {
            error!("undecodable message on {}: {}", message.topic(), e);
            return true;
        }
    };

    let result = match &event {
        DomainEvent::BookingCreated(e) => saga.handle_booking_created(e).await,
        DomainEvent::PaymentProcessed(e) => saga.handle_payment_processed(e).await,
        DomainEvent::PaymentFailed(e) => saga.handle_payment_failed(e).await,
        other => {
            warn!(
                "ignoring unexpected event type {} on {}",
                other.topic(),
                message.topic()
            );
            return true;
        }
    };

    match result {
        Ok(Disposition::Applied) => {
            info!("applied {} {}", event.topic(), event.event_id());
            true
        }
        Ok(Disposition::Duplicate) => {
            info!("skipped duplicate {} {}", event.topic(), event.event_id());
            true
        }
        Ok(Disposition::Rejected(reason)) => {
            warn!("dropped {} {}: {}", event.topic(), event.event_id(), reason);
            true
        }
        Err(e) if e.is_permanent() => {
            warn!("dropped {} {}: {}", event.topic(), event.event_id(), e);
            true
        }
        Err(e) => {
            error!(
                "transient failure on {} {}: {}",
                event.topic(),
                event.event_id(),
                e
            );
            false
        }
    }
}
