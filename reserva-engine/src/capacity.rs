use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};
use uuid::Uuid;

use reserva_domain::error::DomainError;
use reserva_domain::events::{DomainEvent, SlotCreated, SlotDeleted, SlotUpdated, EVENT_VERSION};
use reserva_domain::slot::{CreateSlotRequest, RecurringSlotSpec, Slot, UpdateSlotRequest};
use reserva_domain::store::{EventPublisher, ReserveOutcome, SlotPatch, SlotStore};
use reserva_domain::{Actor, DomainResult};

use crate::recurrence::occurrences;
use crate::retry::RetryPolicy;

/// Capacity accounting and slot administration over a [`SlotStore`].
///
/// The seat counter is never mutated here: `reserve` and `release` delegate
/// to the store's atomic conditional updates, so two concurrent reservations
/// of the last seat resolve at the storage layer. Storage failures are
/// retried with bounded backoff and then surfaced as transient.
pub struct CapacityEngine<S, P> {
    store: Arc<S>,
    publisher: Arc<P>,
    retry: RetryPolicy,
}

impl<S, P> CapacityEngine<S, P>
where
    S: SlotStore,
    P: EventPublisher,
{
    pub fn new(store: Arc<S>, publisher: Arc<P>, retry: RetryPolicy) -> Self {
        Self {
            store,
            publisher,
            retry,
        }
    }

    pub async fn create_slot(
        &self,
        actor: Actor,
        request: &CreateSlotRequest,
    ) -> DomainResult<Slot> {
        request.validate()?;
        let now = Utc::now();
        let slot = Slot::from_request(request, actor, now);
        self.retry
            .run("insert slot", || {
                self.store.insert_slots(std::slice::from_ref(&slot))
            })
            .await?;
        info!("created slot {} for service {}", slot.id, slot.service_id);
        self.publish_logged(DomainEvent::SlotCreated(SlotCreated::for_slot(&slot)))
            .await;
        Ok(slot)
    }

    pub async fn update_slot(
        &self,
        actor: Actor,
        slot_id: Uuid,
        request: &UpdateSlotRequest,
    ) -> DomainResult<Slot> {
        let slot = self
            .store
            .get_slot(actor.tenant_id, slot_id)
            .await?
            .ok_or(DomainError::NotFound("slot"))?;
        authorize(&slot, &actor)?;

        let start_at = request.start_at.unwrap_or(slot.start_at);
        let end_at = request.end_at.unwrap_or(slot.end_at);
        if end_at <= start_at {
            return Err(DomainError::Validation(
                "slot end must be after its start".into(),
            ));
        }
        if let Some(max_bookings) = request.max_bookings {
            if max_bookings <= 0 {
                return Err(DomainError::Validation(
                    "max bookings must be positive".into(),
                ));
            }
        }

        // The seat counter never travels through this snapshot: the store
        // recomputes remaining availability atomically, so a reservation
        // landing between the read above and this update is kept.
        let patch = SlotPatch {
            start_at: request.start_at,
            end_at: request.end_at,
            max_bookings: request.max_bookings,
            is_available: request.is_available,
            updated_at: Utc::now(),
        };
        let updated = self
            .retry
            .run("update slot", || {
                self.store.update_slot(actor.tenant_id, slot_id, &patch)
            })
            .await?
            .ok_or(DomainError::NotFound("slot"))?;
        self.publish_logged(DomainEvent::SlotUpdated(SlotUpdated::for_slot(&updated)))
            .await;
        Ok(updated)
    }

    /// Refuses deletion while any booking still references the slot.
    pub async fn delete_slot(&self, actor: Actor, slot_id: Uuid) -> DomainResult<()> {
        let slot = self
            .store
            .get_slot(actor.tenant_id, slot_id)
            .await?
            .ok_or(DomainError::NotFound("slot"))?;
        authorize(&slot, &actor)?;
        if self.store.slot_has_bookings(actor.tenant_id, slot_id).await? {
            return Err(DomainError::Validation(
                "slot has bookings and cannot be deleted".into(),
            ));
        }
        if !self.store.delete_slot(actor.tenant_id, slot_id).await? {
            return Err(DomainError::NotFound("slot"));
        }
        info!("deleted slot {}", slot_id);
        self.publish_logged(DomainEvent::SlotDeleted(SlotDeleted {
            event_id: Uuid::new_v4(),
            version: EVENT_VERSION,
            slot_id: slot.id,
            service_id: slot.service_id,
            provider_id: slot.provider_id,
            tenant_id: slot.tenant_id,
            start_at: slot.start_at,
            end_at: slot.end_at,
            deleted_at: Utc::now(),
        }))
        .await;
        Ok(())
    }

    pub async fn block_slot(&self, actor: Actor, slot_id: Uuid) -> DomainResult<Slot> {
        self.set_availability(actor, slot_id, false).await
    }

    pub async fn unblock_slot(&self, actor: Actor, slot_id: Uuid) -> DomainResult<Slot> {
        self.set_availability(actor, slot_id, true).await
    }

    /// Flips the manual block flag; the seat counter is untouched.
    async fn set_availability(
        &self,
        actor: Actor,
        slot_id: Uuid,
        available: bool,
    ) -> DomainResult<Slot> {
        let mut slot = self
            .store
            .get_slot(actor.tenant_id, slot_id)
            .await?
            .ok_or(DomainError::NotFound("slot"))?;
        authorize(&slot, &actor)?;
        self.store
            .set_available(actor.tenant_id, slot_id, available)
            .await?;
        slot.is_available = available;
        slot.updated_at = Utc::now();
        self.publish_logged(DomainEvent::SlotUpdated(SlotUpdated::for_slot(&slot)))
            .await;
        Ok(slot)
    }

    pub async fn check_availability(&self, tenant_id: Uuid, slot_id: Uuid) -> DomainResult<bool> {
        let slot = self
            .store
            .get_slot(tenant_id, slot_id)
            .await?
            .ok_or(DomainError::NotFound("slot"))?;
        Ok(slot.is_bookable(Utc::now()))
    }

    /// Takes one seat, or reports why it could not.
    pub async fn reserve(&self, tenant_id: Uuid, slot_id: Uuid) -> DomainResult<()> {
        let now = Utc::now();
        let outcome = self
            .retry
            .run("reserve slot", || self.store.reserve(tenant_id, slot_id, now))
            .await?;
        match outcome {
            ReserveOutcome::Reserved => Ok(()),
            ReserveOutcome::Unavailable => {
                if self.store.get_slot(tenant_id, slot_id).await?.is_none() {
                    Err(DomainError::NotFound("slot"))
                } else {
                    Err(DomainError::CapacityExhausted)
                }
            }
        }
    }

    pub async fn release(&self, tenant_id: Uuid, slot_id: Uuid) -> DomainResult<()> {
        self.retry
            .run("release slot", || self.store.release(tenant_id, slot_id))
            .await?;
        Ok(())
    }

    /// Generates the series, silently skipping candidates that overlap an
    /// existing slot for the same service. The result may be shorter than
    /// the requested occurrence count.
    pub async fn generate_recurring(
        &self,
        actor: Actor,
        spec: &RecurringSlotSpec,
    ) -> DomainResult<Vec<Slot>> {
        spec.validate()?;
        let now = Utc::now();
        let mut accepted: Vec<Slot> = Vec::new();

        for (start_at, end_at) in occurrences(spec) {
            let taken = self
                .store
                .has_overlap(actor.tenant_id, spec.service_id, start_at, end_at)
                .await?
                || accepted
                    .iter()
                    .any(|s| start_at < s.end_at && end_at > s.start_at);
            if taken {
                warn!(
                    "skipping occurrence at {} for service {}: overlaps an existing slot",
                    start_at, spec.service_id
                );
                continue;
            }
            accepted.push(Slot {
                id: Uuid::new_v4(),
                service_id: spec.service_id,
                provider_id: actor.user_id,
                tenant_id: actor.tenant_id,
                start_at,
                end_at,
                max_bookings: spec.max_bookings,
                available_bookings: spec.max_bookings,
                is_available: true,
                is_recurring: true,
                created_at: now,
                updated_at: now,
            });
        }

        if !accepted.is_empty() {
            self.retry
                .run("insert slots", || self.store.insert_slots(&accepted))
                .await?;
        }
        info!(
            "generated {} recurring slots for service {}",
            accepted.len(),
            spec.service_id
        );
        for slot in &accepted {
            self.publish_logged(DomainEvent::SlotCreated(SlotCreated::for_slot(slot)))
                .await;
        }
        Ok(accepted)
    }

    async fn publish_logged(&self, event: DomainEvent) {
        let result = self
            .retry
            .run(event.topic(), || self.publisher.publish(&event))
            .await;
        if let Err(e) = result {
            error!("failed to publish {}: {}", event.topic(), e);
        }
    }
}

fn authorize(slot: &Slot, actor: &Actor) -> DomainResult<()> {
    if slot.provider_id != actor.user_id {
        return Err(DomainError::Authorization(
            "slot belongs to another provider",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reserva_domain::slot::RecurrencePattern;
    use reserva_store::{MemoryPublisher, MemoryStore};
    use std::time::Duration as StdDuration;

    fn engine(
        store: Arc<MemoryStore>,
        publisher: Arc<MemoryPublisher>,
    ) -> CapacityEngine<MemoryStore, MemoryPublisher> {
        CapacityEngine::new(store, publisher, RetryPolicy::new(2, StdDuration::from_millis(1)))
    }

    async fn seed_slot(store: &MemoryStore, actor: Actor, capacity: i32) -> Slot {
        let now = Utc::now();
        let slot = Slot {
            id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            provider_id: actor.user_id,
            tenant_id: actor.tenant_id,
            start_at: now + Duration::hours(6),
            end_at: now + Duration::hours(7),
            max_bookings: capacity,
            available_bookings: capacity,
            is_available: true,
            is_recurring: false,
            created_at: now,
            updated_at: now,
        };
        store.insert_slots(&[slot.clone()]).await.unwrap();
        slot
    }

    fn provider() -> Actor {
        Actor::new(Uuid::new_v4(), Uuid::new_v4())
    }

    #[tokio::test]
    async fn concurrent_reserves_never_exceed_capacity() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let actor = provider();
        let slot = seed_slot(&store, actor, 3).await;
        let engine = Arc::new(engine(store.clone(), publisher));

        let mut handles = Vec::new();
        for _ in 0..10 {
            let engine = engine.clone();
            let (tenant_id, slot_id) = (actor.tenant_id, slot.id);
            handles.push(tokio::spawn(async move {
                engine.reserve(tenant_id, slot_id).await.is_ok()
            }));
        }
        let mut granted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                granted += 1;
            }
        }

        assert_eq!(granted, 3);
        let stored = store.get_slot(actor.tenant_id, slot.id).await.unwrap().unwrap();
        assert_eq!(stored.available_bookings, 0);
    }

    #[tokio::test]
    async fn reserve_distinguishes_missing_from_full() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let actor = provider();
        let slot = seed_slot(&store, actor, 1).await;
        let engine = engine(store, publisher);

        assert!(matches!(
            engine.reserve(actor.tenant_id, Uuid::new_v4()).await,
            Err(DomainError::NotFound("slot"))
        ));

        engine.reserve(actor.tenant_id, slot.id).await.unwrap();
        assert!(matches!(
            engine.reserve(actor.tenant_id, slot.id).await,
            Err(DomainError::CapacityExhausted)
        ));
    }

    #[tokio::test]
    async fn weekly_generation_fills_an_empty_calendar() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let actor = provider();
        let engine = engine(store, publisher.clone());

        let spec = RecurringSlotSpec {
            service_id: Uuid::new_v4(),
            pattern: RecurrencePattern::Weekly,
            interval: 1,
            start_at: Utc::now() + Duration::days(1),
            duration_minutes: 30,
            occurrences: 4,
            max_occurrence_date: None,
            max_bookings: 2,
        };
        let slots = engine.generate_recurring(actor, &spec).await.unwrap();

        assert_eq!(slots.len(), 4);
        for pair in slots.windows(2) {
            assert_eq!(pair[1].start_at - pair[0].start_at, Duration::days(7));
        }
        assert_eq!(publisher.sent_on("slot.created").len(), 4);
    }

    #[tokio::test]
    async fn conflicting_occurrence_is_skipped() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let actor = provider();
        let engine = engine(store.clone(), publisher);

        let series_start = Utc::now() + Duration::days(1);
        let service_id = Uuid::new_v4();
        // Pre-existing slot colliding with the third weekly occurrence.
        let blocker_start = series_start + Duration::days(14);
        let now = Utc::now();
        store
            .insert_slots(&[Slot {
                id: Uuid::new_v4(),
                service_id,
                provider_id: actor.user_id,
                tenant_id: actor.tenant_id,
                start_at: blocker_start,
                end_at: blocker_start + Duration::minutes(30),
                max_bookings: 1,
                available_bookings: 1,
                is_available: true,
                is_recurring: false,
                created_at: now,
                updated_at: now,
            }])
            .await
            .unwrap();

        let spec = RecurringSlotSpec {
            service_id,
            pattern: RecurrencePattern::Weekly,
            interval: 1,
            start_at: series_start,
            duration_minutes: 30,
            occurrences: 4,
            max_occurrence_date: None,
            max_bookings: 2,
        };
        let slots = engine.generate_recurring(actor, &spec).await.unwrap();

        assert_eq!(slots.len(), 3);
        assert!(slots.iter().all(|s| s.start_at != blocker_start));
    }

    #[tokio::test]
    async fn capacity_update_preserves_booked_seats() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let actor = provider();
        let slot = seed_slot(&store, actor, 5).await;
        let engine = engine(store, publisher);

        for _ in 0..3 {
            engine.reserve(actor.tenant_id, slot.id).await.unwrap();
        }

        let request = UpdateSlotRequest {
            max_bookings: Some(4),
            ..Default::default()
        };
        let updated = engine.update_slot(actor, slot.id, &request).await.unwrap();
        assert_eq!(updated.max_bookings, 4);
        assert_eq!(updated.available_bookings, 1);

        // Shrinking below the booked count floors availability at zero.
        let request = UpdateSlotRequest {
            max_bookings: Some(2),
            ..Default::default()
        };
        let updated = engine.update_slot(actor, slot.id, &request).await.unwrap();
        assert_eq!(updated.available_bookings, 0);
    }

    #[tokio::test]
    async fn slot_update_cannot_resurrect_a_taken_seat() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let actor = provider();
        let slot = seed_slot(&store, actor, 2).await;
        let engine = engine(store, publisher);

        engine.reserve(actor.tenant_id, slot.id).await.unwrap();

        // Moving the window must not restore the taken seat.
        let request = UpdateSlotRequest {
            start_at: Some(slot.start_at + Duration::hours(1)),
            end_at: Some(slot.end_at + Duration::hours(1)),
            ..Default::default()
        };
        let updated = engine.update_slot(actor, slot.id, &request).await.unwrap();
        assert_eq!(updated.available_bookings, 1);

        engine.reserve(actor.tenant_id, slot.id).await.unwrap();

        // Nor must an update right after the last seat goes.
        let request = UpdateSlotRequest {
            is_available: Some(true),
            ..Default::default()
        };
        let updated = engine.update_slot(actor, slot.id, &request).await.unwrap();
        assert_eq!(updated.available_bookings, 0);
        assert!(matches!(
            engine.reserve(actor.tenant_id, slot.id).await,
            Err(DomainError::CapacityExhausted)
        ));
    }

    #[tokio::test]
    async fn blocked_slot_is_not_bookable() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let actor = provider();
        let slot = seed_slot(&store, actor, 2).await;
        let engine = engine(store, publisher.clone());

        engine.block_slot(actor, slot.id).await.unwrap();
        assert!(!engine.check_availability(actor.tenant_id, slot.id).await.unwrap());
        assert!(matches!(
            engine.reserve(actor.tenant_id, slot.id).await,
            Err(DomainError::CapacityExhausted)
        ));
        assert_eq!(publisher.sent_on("slot.updated").len(), 1);

        engine.unblock_slot(actor, slot.id).await.unwrap();
        assert!(engine.check_availability(actor.tenant_id, slot.id).await.unwrap());
    }

    #[tokio::test]
    async fn mutation_requires_the_owning_provider() {
        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let owner = provider();
        let slot = seed_slot(&store, owner, 2).await;
        let engine = engine(store, publisher);

        let intruder = Actor::new(Uuid::new_v4(), owner.tenant_id);
        assert!(matches!(
            engine.block_slot(intruder, slot.id).await,
            Err(DomainError::Authorization(_))
        ));
        assert!(matches!(
            engine.delete_slot(intruder, slot.id).await,
            Err(DomainError::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn delete_refused_while_bookings_exist() {
        use reserva_domain::booking::{Booking, BookingHistory};
        use reserva_domain::events::{BookingCreated, EVENT_VERSION};
        use reserva_domain::store::{BookingStore, LedgerKey};

        let store = Arc::new(MemoryStore::new());
        let publisher = Arc::new(MemoryPublisher::new());
        let actor = provider();
        let slot = seed_slot(&store, actor, 2).await;

        let event = BookingCreated {
            event_id: Uuid::new_v4(),
            version: EVENT_VERSION,
            booking_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            service_id: slot.service_id,
            slot_id: slot.id,
            provider_id: slot.provider_id,
            tenant_id: slot.tenant_id,
            amount_minor: 1200,
            currency: "EUR".into(),
            notes: None,
            occurred_at: Utc::now(),
        };
        let booking = Booking::pending(&event, Utc::now());
        let history = BookingHistory::creation(&booking);
        store
            .insert_pending(
                &LedgerKey::new(event.event_id, "test-consumer"),
                &booking,
                &history,
                Utc::now(),
            )
            .await
            .unwrap();

        let engine = engine(store.clone(), publisher);
        assert!(matches!(
            engine.delete_slot(actor, slot.id).await,
            Err(DomainError::Validation(_))
        ));
        assert!(store.get_slot(actor.tenant_id, slot.id).await.unwrap().is_some());
    }
}
