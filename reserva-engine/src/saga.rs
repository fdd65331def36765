use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{error, info, warn};
use uuid::Uuid;

use reserva_domain::booking::{Booking, BookingFilter, BookingHistory, BookingStatus};
use reserva_domain::error::{DomainError, StoreError};
use reserva_domain::events::{
    BookingCancelled, BookingConfirmed, BookingCreated, BookingRescheduled, DomainEvent,
    NotificationAudience, NotificationRequested, PaymentFailed, PaymentProcessed,
    PaymentRequested, EVENT_VERSION,
};
use reserva_domain::slot::Slot;
use reserva_domain::store::{
    BookingStore, EventPublisher, IdempotencyLedger, InsertOutcome, LedgerKey, MoveOutcome,
    SlotMove, SlotStore, StatusChange, TransitionOutcome,
};
use reserva_domain::{Actor, DomainResult};

use crate::retry::RetryPolicy;

/// Consumer name recorded in the idempotency ledger.
pub const CONSUMER: &str = "booking-coordinator";

/// Actor id stamped on transitions driven by events or the sweep rather
/// than a caller.
const SYSTEM_ACTOR: Uuid = Uuid::nil();

/// Outcome of handling a bus event. All three variants acknowledge the
/// event; the retry path is an `Err(DomainError::Transient)` from the
/// handler, which leaves the offset uncommitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// State changed and the follow-up events went out.
    Applied,
    /// The ledger already holds this (event, consumer) pair.
    Duplicate,
    /// Permanently unprocessable; logged and dropped.
    Rejected(String),
}

/// Drives a booking through Pending, Confirmed and the terminal states in
/// response to bus events and synchronous calls.
///
/// Every event handler probes the ledger first, then relies on the store's
/// composite operations to gate, mutate and record history in one
/// transaction. Events arriving out of order land in `Rejected` instead of
/// being reordered.
pub struct BookingSagaCoordinator<St, P> {
    store: Arc<St>,
    publisher: Arc<P>,
    retry: RetryPolicy,
}

impl<St, P> BookingSagaCoordinator<St, P>
where
    St: BookingStore + SlotStore + IdempotencyLedger,
    P: EventPublisher,
{
    pub fn new(store: Arc<St>, publisher: Arc<P>, retry: RetryPolicy) -> Self {
        Self {
            store,
            publisher,
            retry,
        }
    }

    /// Records a Pending booking and asks for payment. The slot seat, the
    /// ledger row and the booking are written atomically; a capacity guard
    /// failure persists nothing.
    pub async fn handle_booking_created(
        &self,
        event: &BookingCreated,
    ) -> DomainResult<Disposition> {
        let gate = LedgerKey::new(event.event_id, CONSUMER);
        if self.store.seen(&gate).await? {
            return Ok(Disposition::Duplicate);
        }
        if let Err(e) = event.validate() {
            warn!("rejecting booking.created {}: {}", event.event_id, e);
            return Ok(Disposition::Rejected(e.to_string()));
        }
        if self
            .store
            .customer_has_booking(event.tenant_id, event.customer_id, event.slot_id)
            .await?
        {
            warn!(
                "rejecting booking.created {}: customer {} already booked slot {}",
                event.event_id, event.customer_id, event.slot_id
            );
            return Ok(Disposition::Rejected(
                "customer already has a booking for this slot".into(),
            ));
        }
        let Some(slot) = self.store.get_slot(event.tenant_id, event.slot_id).await? else {
            warn!(
                "rejecting booking.created {}: slot {} not found",
                event.event_id, event.slot_id
            );
            return Ok(Disposition::Rejected("slot not found".into()));
        };
        if slot.service_id != event.service_id {
            return Ok(Disposition::Rejected(
                "slot does not belong to the requested service".into(),
            ));
        }

        let now = Utc::now();
        let booking = Booking::pending(event, now);
        let history = BookingHistory::creation(&booking);
        match self
            .store
            .insert_pending(&gate, &booking, &history, now)
            .await?
        {
            InsertOutcome::AlreadyProcessed => Ok(Disposition::Duplicate),
            InsertOutcome::CapacityExhausted => {
                warn!(
                    "rejecting booking.created {}: slot {} has no remaining availability",
                    event.event_id, event.slot_id
                );
                Ok(Disposition::Rejected(
                    DomainError::CapacityExhausted.to_string(),
                ))
            }
            InsertOutcome::Inserted => {
                info!("booking {} recorded as Pending", booking.id);
                let request =
                    DomainEvent::PaymentRequested(PaymentRequested::for_booking(&booking, now));
                self.publish_retrying(&request).await?;
                Ok(Disposition::Applied)
            }
        }
    }

    /// Confirms a Pending booking and fans out the confirmation event plus
    /// customer and provider notifications. Each publish is retried
    /// independently so one failing cannot block or duplicate the others.
    pub async fn handle_payment_processed(
        &self,
        event: &PaymentProcessed,
    ) -> DomainResult<Disposition> {
        let gate = LedgerKey::new(event.event_id, CONSUMER);
        if self.store.seen(&gate).await? {
            return Ok(Disposition::Duplicate);
        }
        if let Err(e) = event.validate() {
            warn!("rejecting payment.processed {}: {}", event.event_id, e);
            return Ok(Disposition::Rejected(e.to_string()));
        }
        let Some(existing) = self
            .store
            .get_booking(event.tenant_id, event.booking_id)
            .await?
        else {
            warn!(
                "rejecting payment.processed {}: booking {} not found",
                event.event_id, event.booking_id
            );
            return Ok(Disposition::Rejected("booking not found".into()));
        };
        let Some(slot) = self.store.get_slot(event.tenant_id, existing.slot_id).await? else {
            return Ok(Disposition::Rejected("slot not found".into()));
        };

        let now = Utc::now();
        let change = StatusChange {
            tenant_id: event.tenant_id,
            booking_id: event.booking_id,
            allowed_from: &[BookingStatus::Pending],
            to: BookingStatus::Confirmed,
            changed_by: SYSTEM_ACTOR,
            reason: None,
            changed_at: now,
            is_cancellation: false,
            release_slot: None,
        };
        match self.store.transition(Some(&gate), &change).await? {
            TransitionOutcome::AlreadyProcessed => Ok(Disposition::Duplicate),
            TransitionOutcome::NotFound => Ok(Disposition::Rejected("booking not found".into())),
            TransitionOutcome::WrongState(from) => {
                let err = DomainError::InvalidStateTransition {
                    from,
                    to: BookingStatus::Confirmed,
                };
                warn!("rejecting payment.processed {}: {}", event.event_id, err);
                Ok(Disposition::Rejected(err.to_string()))
            }
            TransitionOutcome::Applied(booking) => {
                info!("booking {} confirmed", booking.id);
                let mut events = vec![DomainEvent::BookingConfirmed(BookingConfirmed {
                    event_id: Uuid::new_v4(),
                    version: EVENT_VERSION,
                    booking_id: booking.id,
                    customer_id: booking.customer_id,
                    service_id: booking.service_id,
                    provider_id: booking.provider_id,
                    tenant_id: booking.tenant_id,
                    slot_start_at: slot.start_at,
                    slot_end_at: slot.end_at,
                    confirmed_at: now,
                })];
                events.extend(
                    confirmation_notifications(&booking, &slot, now)
                        .map(DomainEvent::NotificationRequested),
                );

                let mut incomplete = false;
                for event in &events {
                    if let Err(e) = self.publish_retrying(event).await {
                        error!(
                            "failed to publish {} for booking {}: {}",
                            event.topic(),
                            booking.id,
                            e
                        );
                        incomplete = true;
                    }
                }
                if incomplete {
                    return Err(StoreError::Bus("confirmation publish incomplete".into()).into());
                }
                Ok(Disposition::Applied)
            }
        }
    }

    /// Cancels a Pending booking and restores its seat in the same
    /// transaction as the status change.
    pub async fn handle_payment_failed(&self, event: &PaymentFailed) -> DomainResult<Disposition> {
        let gate = LedgerKey::new(event.event_id, CONSUMER);
        if self.store.seen(&gate).await? {
            return Ok(Disposition::Duplicate);
        }
        if let Err(e) = event.validate() {
            warn!("rejecting payment.failed {}: {}", event.event_id, e);
            return Ok(Disposition::Rejected(e.to_string()));
        }
        let Some(booking) = self
            .store
            .get_booking(event.tenant_id, event.booking_id)
            .await?
        else {
            warn!(
                "rejecting payment.failed {}: booking {} not found",
                event.event_id, event.booking_id
            );
            return Ok(Disposition::Rejected("booking not found".into()));
        };

        let now = Utc::now();
        let change = StatusChange {
            tenant_id: event.tenant_id,
            booking_id: event.booking_id,
            allowed_from: &[BookingStatus::Pending],
            to: BookingStatus::Cancelled,
            changed_by: SYSTEM_ACTOR,
            reason: Some(format!("payment failed: {}", event.failure_reason)),
            changed_at: now,
            is_cancellation: true,
            release_slot: Some(booking.slot_id),
        };
        match self.store.transition(Some(&gate), &change).await? {
            TransitionOutcome::AlreadyProcessed => Ok(Disposition::Duplicate),
            TransitionOutcome::NotFound => Ok(Disposition::Rejected("booking not found".into())),
            TransitionOutcome::WrongState(from) => {
                let err = DomainError::InvalidStateTransition {
                    from,
                    to: BookingStatus::Cancelled,
                };
                warn!("rejecting payment.failed {}: {}", event.event_id, err);
                Ok(Disposition::Rejected(err.to_string()))
            }
            TransitionOutcome::Applied(booking) => {
                info!("booking {} cancelled after failed payment", booking.id);
                let cancelled = DomainEvent::BookingCancelled(BookingCancelled {
                    event_id: Uuid::new_v4(),
                    version: EVENT_VERSION,
                    booking_id: booking.id,
                    customer_id: booking.customer_id,
                    service_id: booking.service_id,
                    provider_id: booking.provider_id,
                    tenant_id: booking.tenant_id,
                    cancelled_by: SYSTEM_ACTOR,
                    reason: booking.cancellation_reason.clone(),
                    cancelled_at: now,
                });
                self.publish_retrying(&cancelled).await?;
                Ok(Disposition::Applied)
            }
        }
    }

    /// Synchronous cancellation. Refused once the slot has started.
    pub async fn cancel(
        &self,
        actor: Actor,
        booking_id: Uuid,
        reason: Option<String>,
    ) -> DomainResult<Booking> {
        let booking = self
            .store
            .get_booking(actor.tenant_id, booking_id)
            .await?
            .ok_or(DomainError::NotFound("booking"))?;
        let slot = self
            .store
            .get_slot(actor.tenant_id, booking.slot_id)
            .await?
            .ok_or(DomainError::NotFound("slot"))?;
        let now = Utc::now();
        if now >= slot.start_at {
            return Err(DomainError::Validation(
                "booking slot has already started".into(),
            ));
        }

        let change = StatusChange {
            tenant_id: actor.tenant_id,
            booking_id,
            allowed_from: &[BookingStatus::Pending, BookingStatus::Confirmed],
            to: BookingStatus::Cancelled,
            changed_by: actor.user_id,
            reason: reason.clone(),
            changed_at: now,
            is_cancellation: true,
            release_slot: Some(booking.slot_id),
        };
        match self.store.transition(None, &change).await? {
            TransitionOutcome::Applied(booking) => {
                info!("booking {} cancelled by {}", booking.id, actor.user_id);
                self.publish_logged(DomainEvent::BookingCancelled(BookingCancelled {
                    event_id: Uuid::new_v4(),
                    version: EVENT_VERSION,
                    booking_id: booking.id,
                    customer_id: booking.customer_id,
                    service_id: booking.service_id,
                    provider_id: booking.provider_id,
                    tenant_id: booking.tenant_id,
                    cancelled_by: actor.user_id,
                    reason,
                    cancelled_at: now,
                }))
                .await;
                Ok(booking)
            }
            TransitionOutcome::NotFound => Err(DomainError::NotFound("booking")),
            TransitionOutcome::WrongState(from) => Err(DomainError::InvalidStateTransition {
                from,
                to: BookingStatus::Cancelled,
            }),
            // No gate was supplied, so the ledger cannot report a duplicate.
            TransitionOutcome::AlreadyProcessed => {
                Err(StoreError::Database("unexpected duplicate outcome".into()).into())
            }
        }
    }

    /// Synchronous reschedule: reserves the new slot, releases the old one
    /// and repoints the booking in one transaction. A full new slot leaves
    /// the booking and the old slot untouched.
    pub async fn reschedule(
        &self,
        actor: Actor,
        booking_id: Uuid,
        new_slot_id: Uuid,
    ) -> DomainResult<Booking> {
        let booking = self
            .store
            .get_booking(actor.tenant_id, booking_id)
            .await?
            .ok_or(DomainError::NotFound("booking"))?;
        if booking.slot_id == new_slot_id {
            return Err(DomainError::Validation(
                "booking already uses this slot".into(),
            ));
        }
        let old_slot = self
            .store
            .get_slot(actor.tenant_id, booking.slot_id)
            .await?
            .ok_or(DomainError::NotFound("slot"))?;
        let new_slot = self
            .store
            .get_slot(actor.tenant_id, new_slot_id)
            .await?
            .ok_or(DomainError::NotFound("slot"))?;
        if new_slot.service_id != booking.service_id {
            return Err(DomainError::Validation(
                "new slot is for a different service".into(),
            ));
        }

        let now = Utc::now();
        let change = SlotMove {
            tenant_id: actor.tenant_id,
            booking_id,
            allowed_from: &[BookingStatus::Pending, BookingStatus::Confirmed],
            old_slot_id: booking.slot_id,
            new_slot_id,
            changed_by: actor.user_id,
            reason: Some(format!("rescheduled to slot {new_slot_id}")),
            changed_at: now,
        };
        match self.store.move_slot(&change).await? {
            MoveOutcome::Applied(updated) => {
                info!(
                    "booking {} rescheduled from slot {} to slot {}",
                    updated.id, old_slot.id, new_slot.id
                );
                self.publish_logged(DomainEvent::BookingRescheduled(BookingRescheduled {
                    event_id: Uuid::new_v4(),
                    version: EVENT_VERSION,
                    booking_id: updated.id,
                    customer_id: updated.customer_id,
                    service_id: updated.service_id,
                    provider_id: updated.provider_id,
                    tenant_id: updated.tenant_id,
                    old_slot_id: old_slot.id,
                    new_slot_id: new_slot.id,
                    old_start_at: old_slot.start_at,
                    old_end_at: old_slot.end_at,
                    new_start_at: new_slot.start_at,
                    new_end_at: new_slot.end_at,
                    rescheduled_at: now,
                }))
                .await;
                Ok(updated)
            }
            MoveOutcome::NotFound => Err(DomainError::NotFound("booking")),
            MoveOutcome::WrongState(from) => {
                Err(DomainError::InvalidStateTransition { from, to: from })
            }
            MoveOutcome::CapacityExhausted => Err(DomainError::CapacityExhausted),
        }
    }

    /// Completes confirmed bookings whose slot start time has elapsed.
    /// Returns how many were completed in this pass.
    pub async fn complete_elapsed(&self, now: DateTime<Utc>, limit: i64) -> DomainResult<u64> {
        let due = self.store.confirmed_started_before(now, limit).await?;
        let mut completed = 0u64;
        for booking in due {
            let change = StatusChange {
                tenant_id: booking.tenant_id,
                booking_id: booking.id,
                allowed_from: &[BookingStatus::Confirmed],
                to: BookingStatus::Completed,
                changed_by: SYSTEM_ACTOR,
                reason: None,
                changed_at: now,
                is_cancellation: false,
                release_slot: None,
            };
            if let TransitionOutcome::Applied(_) = self.store.transition(None, &change).await? {
                completed += 1;
            }
        }
        if completed > 0 {
            info!("completed {} elapsed bookings", completed);
        }
        Ok(completed)
    }

    pub async fn list_bookings(
        &self,
        actor: Actor,
        filter: &BookingFilter,
    ) -> DomainResult<Vec<Booking>> {
        Ok(self.store.list_bookings(actor.tenant_id, filter).await?)
    }

    pub async fn booking_history(
        &self,
        actor: Actor,
        booking_id: Uuid,
    ) -> DomainResult<Vec<BookingHistory>> {
        Ok(self
            .store
            .booking_history(actor.tenant_id, booking_id)
            .await?)
    }

    async fn publish_retrying(&self, event: &DomainEvent) -> Result<(), StoreError> {
        self.retry
            .run(event.topic(), || self.publisher.publish(event))
            .await
    }

    async fn publish_logged(&self, event: DomainEvent) {
        if let Err(e) = self.publish_retrying(&event).await {
            error!("failed to publish {}: {}", event.topic(), e);
        }
    }
}

fn confirmation_notifications(
    booking: &Booking,
    slot: &Slot,
    now: DateTime<Utc>,
) -> [NotificationRequested; 2] {
    [
        NotificationRequested {
            event_id: Uuid::new_v4(),
            version: EVENT_VERSION,
            notification_id: Uuid::new_v4(),
            recipient_id: booking.customer_id,
            tenant_id: booking.tenant_id,
            audience: NotificationAudience::Customer,
            channel: "email".into(),
            title: "Booking confirmed".into(),
            body: format!("Your booking starting at {} is confirmed.", slot.start_at),
            requested_at: now,
        },
        NotificationRequested {
            event_id: Uuid::new_v4(),
            version: EVENT_VERSION,
            notification_id: Uuid::new_v4(),
            recipient_id: booking.provider_id,
            tenant_id: booking.tenant_id,
            audience: NotificationAudience::Provider,
            channel: "email".into(),
            title: "New confirmed booking".into(),
            body: format!(
                "Booking {} starting at {} has been confirmed.",
                booking.id, slot.start_at
            ),
            requested_at: now,
        },
    ]
}
