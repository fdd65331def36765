use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use reserva_domain::booking::{Booking, BookingFilter, BookingHistory};
use reserva_domain::error::StoreError;
use reserva_domain::events::DomainEvent;
use reserva_domain::slot::Slot;
use reserva_domain::store::{
    BookingStore, EventPublisher, IdempotencyLedger, InsertOutcome, LedgerKey, MoveOutcome,
    ReserveOutcome, SlotMove, SlotPatch, SlotStore, StatusChange, TransitionOutcome,
};

#[derive(Default)]
struct Inner {
    slots: HashMap<Uuid, Slot>,
    bookings: HashMap<Uuid, Booking>,
    history: Vec<BookingHistory>,
    ledger: HashSet<(Uuid, String)>,
}

/// In-memory backend for local runs and tests.
///
/// A single mutex stands in for the database transaction: every composite
/// operation runs inside one critical section, so it gives the same
/// atomicity guarantees as the Postgres store. Initialized empty, never
/// reconstructed implicitly.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("memory store lock poisoned")
    }

    fn reserve_locked(
        inner: &mut Inner,
        tenant_id: Uuid,
        slot_id: Uuid,
        now: DateTime<Utc>,
    ) -> ReserveOutcome {
        match inner.slots.get_mut(&slot_id) {
            Some(slot)
                if slot.tenant_id == tenant_id
                    && slot.is_available
                    && slot.available_bookings > 0
                    && now < slot.start_at =>
            {
                slot.available_bookings -= 1;
                slot.updated_at = now;
                ReserveOutcome::Reserved
            }
            _ => ReserveOutcome::Unavailable,
        }
    }

    fn release_locked(inner: &mut Inner, tenant_id: Uuid, slot_id: Uuid) {
        if let Some(slot) = inner.slots.get_mut(&slot_id) {
            if slot.tenant_id == tenant_id && slot.available_bookings < slot.max_bookings {
                slot.available_bookings += 1;
                slot.updated_at = Utc::now();
            }
        }
    }
}

#[async_trait]
impl IdempotencyLedger for MemoryStore {
    async fn seen(&self, key: &LedgerKey) -> Result<bool, StoreError> {
        let inner = self.lock();
        Ok(inner
            .ledger
            .contains(&(key.event_id, key.consumer.to_string())))
    }
}

#[async_trait]
impl SlotStore for MemoryStore {
    async fn get_slot(&self, tenant_id: Uuid, slot_id: Uuid) -> Result<Option<Slot>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .slots
            .get(&slot_id)
            .filter(|s| s.tenant_id == tenant_id)
            .cloned())
    }

    async fn insert_slots(&self, slots: &[Slot]) -> Result<(), StoreError> {
        let mut inner = self.lock();
        for slot in slots {
            inner.slots.insert(slot.id, slot.clone());
        }
        Ok(())
    }

    async fn update_slot(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
        patch: &SlotPatch,
    ) -> Result<Option<Slot>, StoreError> {
        let mut inner = self.lock();
        match inner.slots.get_mut(&slot_id) {
            Some(slot) if slot.tenant_id == tenant_id => {
                if let Some(start_at) = patch.start_at {
                    slot.start_at = start_at;
                }
                if let Some(end_at) = patch.end_at {
                    slot.end_at = end_at;
                }
                if let Some(max_bookings) = patch.max_bookings {
                    // Recompute from the counter as it is now, not from any
                    // snapshot the caller read earlier.
                    let booked = slot.booked();
                    slot.max_bookings = max_bookings;
                    slot.available_bookings = (max_bookings - booked).max(0);
                }
                if let Some(is_available) = patch.is_available {
                    slot.is_available = is_available;
                }
                slot.updated_at = patch.updated_at;
                Ok(Some(slot.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn delete_slot(&self, tenant_id: Uuid, slot_id: Uuid) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        let exists = inner
            .slots
            .get(&slot_id)
            .is_some_and(|s| s.tenant_id == tenant_id);
        if exists {
            inner.slots.remove(&slot_id);
        }
        Ok(exists)
    }

    async fn slot_has_bookings(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
    ) -> Result<bool, StoreError> {
        let inner = self.lock();
        Ok(inner
            .bookings
            .values()
            .any(|b| b.tenant_id == tenant_id && b.slot_id == slot_id))
    }

    async fn has_overlap(
        &self,
        tenant_id: Uuid,
        service_id: Uuid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let inner = self.lock();
        Ok(inner.slots.values().any(|s| {
            s.tenant_id == tenant_id
                && s.service_id == service_id
                && start_at < s.end_at
                && end_at > s.start_at
        }))
    }

    async fn reserve(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError> {
        let mut inner = self.lock();
        Ok(Self::reserve_locked(&mut inner, tenant_id, slot_id, now))
    }

    async fn release(&self, tenant_id: Uuid, slot_id: Uuid) -> Result<(), StoreError> {
        let mut inner = self.lock();
        Self::release_locked(&mut inner, tenant_id, slot_id);
        Ok(())
    }

    async fn set_available(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
        available: bool,
    ) -> Result<bool, StoreError> {
        let mut inner = self.lock();
        match inner.slots.get_mut(&slot_id) {
            Some(slot) if slot.tenant_id == tenant_id => {
                slot.is_available = available;
                slot.updated_at = Utc::now();
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl BookingStore for MemoryStore {
    async fn get_booking(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
    ) -> Result<Option<Booking>, StoreError> {
        let inner = self.lock();
        Ok(inner
            .bookings
            .get(&booking_id)
            .filter(|b| b.tenant_id == tenant_id)
            .cloned())
    }

    async fn customer_has_booking(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        slot_id: Uuid,
    ) -> Result<bool, StoreError> {
        let inner = self.lock();
        Ok(inner.bookings.values().any(|b| {
            b.tenant_id == tenant_id && b.customer_id == customer_id && b.slot_id == slot_id
        }))
    }

    async fn insert_pending(
        &self,
        gate: &LedgerKey,
        booking: &Booking,
        history: &BookingHistory,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError> {
        let mut inner = self.lock();
        let gate_key = (gate.event_id, gate.consumer.to_string());
        if inner.ledger.contains(&gate_key) {
            return Ok(InsertOutcome::AlreadyProcessed);
        }
        // Reserve before writing anything so a failed guard leaves no trace,
        // matching the rolled-back transaction of the durable store.
        if Self::reserve_locked(&mut inner, booking.tenant_id, booking.slot_id, now)
            == ReserveOutcome::Unavailable
        {
            return Ok(InsertOutcome::CapacityExhausted);
        }
        inner.ledger.insert(gate_key);
        inner.bookings.insert(booking.id, booking.clone());
        inner.history.push(history.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn transition(
        &self,
        gate: Option<&LedgerKey>,
        change: &StatusChange,
    ) -> Result<TransitionOutcome, StoreError> {
        let mut inner = self.lock();
        if let Some(key) = gate {
            if inner
                .ledger
                .contains(&(key.event_id, key.consumer.to_string()))
            {
                return Ok(TransitionOutcome::AlreadyProcessed);
            }
        }
        let old_status = match inner.bookings.get(&change.booking_id) {
            Some(b) if b.tenant_id == change.tenant_id => b.status,
            _ => return Ok(TransitionOutcome::NotFound),
        };
        if !change.allowed_from.contains(&old_status) {
            return Ok(TransitionOutcome::WrongState(old_status));
        }

        let booking = {
            let b = inner
                .bookings
                .get_mut(&change.booking_id)
                .expect("booking checked above");
            b.status = change.to;
            b.updated_at = change.changed_at;
            if change.is_cancellation {
                b.cancelled_at = Some(change.changed_at);
                b.cancelled_by = Some(change.changed_by);
                b.cancellation_reason = change.reason.clone();
            }
            b.clone()
        };
        inner.history.push(BookingHistory {
            id: Uuid::new_v4(),
            booking_id: change.booking_id,
            tenant_id: change.tenant_id,
            old_status: Some(old_status),
            new_status: change.to,
            changed_by: change.changed_by,
            reason: change.reason.clone(),
            changed_at: change.changed_at,
        });
        if let Some(slot_id) = change.release_slot {
            Self::release_locked(&mut inner, change.tenant_id, slot_id);
        }
        if let Some(key) = gate {
            inner
                .ledger
                .insert((key.event_id, key.consumer.to_string()));
        }
        Ok(TransitionOutcome::Applied(booking))
    }

    async fn move_slot(&self, change: &SlotMove) -> Result<MoveOutcome, StoreError> {
        let mut inner = self.lock();
        let status = match inner.bookings.get(&change.booking_id) {
            Some(b) if b.tenant_id == change.tenant_id => b.status,
            _ => return Ok(MoveOutcome::NotFound),
        };
        if !change.allowed_from.contains(&status) {
            return Ok(MoveOutcome::WrongState(status));
        }
        if Self::reserve_locked(
            &mut inner,
            change.tenant_id,
            change.new_slot_id,
            change.changed_at,
        ) == ReserveOutcome::Unavailable
        {
            return Ok(MoveOutcome::CapacityExhausted);
        }
        Self::release_locked(&mut inner, change.tenant_id, change.old_slot_id);
        let booking = {
            let b = inner
                .bookings
                .get_mut(&change.booking_id)
                .expect("booking checked above");
            b.slot_id = change.new_slot_id;
            b.updated_at = change.changed_at;
            b.clone()
        };
        inner.history.push(BookingHistory {
            id: Uuid::new_v4(),
            booking_id: change.booking_id,
            tenant_id: change.tenant_id,
            old_status: Some(status),
            new_status: status,
            changed_by: change.changed_by,
            reason: change.reason.clone(),
            changed_at: change.changed_at,
        });
        Ok(MoveOutcome::Applied(booking))
    }

    async fn list_bookings(
        &self,
        tenant_id: Uuid,
        filter: &BookingFilter,
    ) -> Result<Vec<Booking>, StoreError> {
        let inner = self.lock();
        let mut matches: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| b.tenant_id == tenant_id)
            .filter(|b| filter.customer_id.map_or(true, |id| b.customer_id == id))
            .filter(|b| filter.service_id.map_or(true, |id| b.service_id == id))
            .filter(|b| filter.status.map_or(true, |s| b.status == s))
            .filter(|b| filter.from.map_or(true, |t| b.created_at >= t))
            .filter(|b| filter.to.map_or(true, |t| b.created_at <= t))
            .cloned()
            .collect();
        matches.sort_by_key(|b| b.created_at);
        Ok(matches)
    }

    async fn booking_history(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
    ) -> Result<Vec<BookingHistory>, StoreError> {
        let inner = self.lock();
        let mut rows: Vec<BookingHistory> = inner
            .history
            .iter()
            .filter(|h| h.tenant_id == tenant_id && h.booking_id == booking_id)
            .cloned()
            .collect();
        rows.sort_by_key(|h| h.changed_at);
        Ok(rows)
    }

    async fn confirmed_started_before(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError> {
        let inner = self.lock();
        let mut due: Vec<Booking> = inner
            .bookings
            .values()
            .filter(|b| b.status == reserva_domain::BookingStatus::Confirmed)
            .filter(|b| {
                inner
                    .slots
                    .get(&b.slot_id)
                    .is_some_and(|s| s.start_at <= now)
            })
            .cloned()
            .collect();
        due.sort_by_key(|b| b.created_at);
        due.truncate(limit as usize);
        Ok(due)
    }
}

/// Recording publisher with an injectable per-topic failure trigger, used by
/// tests and local runs.
#[derive(Default)]
pub struct MemoryPublisher {
    sent: Mutex<Vec<DomainEvent>>,
    failures: Mutex<HashMap<String, u32>>,
}

impl MemoryPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<DomainEvent> {
        self.sent.lock().expect("publisher lock poisoned").clone()
    }

    pub fn sent_on(&self, topic: &str) -> Vec<DomainEvent> {
        self.sent()
            .into_iter()
            .filter(|e| e.topic() == topic)
            .collect()
    }

    /// Makes the next `times` publishes on `topic` fail with a bus error.
    pub fn fail_next(&self, topic: &str, times: u32) {
        self.failures
            .lock()
            .expect("publisher lock poisoned")
            .insert(topic.to_string(), times);
    }
}

#[async_trait]
impl EventPublisher for MemoryPublisher {
    async fn publish(&self, event: &DomainEvent) -> Result<(), StoreError> {
        {
            let mut failures = self.failures.lock().expect("publisher lock poisoned");
            if let Some(remaining) = failures.get_mut(event.topic()) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(StoreError::Bus(format!(
                        "injected failure on {}",
                        event.topic()
                    )));
                }
            }
        }
        self.sent
            .lock()
            .expect("publisher lock poisoned")
            .push(event.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use reserva_domain::BookingStatus;

    fn future_slot(capacity: i32) -> Slot {
        let now = Utc::now();
        Slot {
            id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            start_at: now + Duration::hours(4),
            end_at: now + Duration::hours(5),
            max_bookings: capacity,
            available_bookings: capacity,
            is_available: true,
            is_recurring: false,
            created_at: now,
            updated_at: now,
        }
    }

    #[tokio::test]
    async fn ledger_gate_is_write_once() {
        let store = MemoryStore::new();
        let slot = future_slot(5);
        store.insert_slots(&[slot.clone()]).await.unwrap();

        let event = reserva_domain::events::BookingCreated {
            event_id: Uuid::new_v4(),
            version: 1,
            booking_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            service_id: slot.service_id,
            slot_id: slot.id,
            provider_id: slot.provider_id,
            tenant_id: slot.tenant_id,
            amount_minor: 1000,
            currency: "USD".into(),
            notes: None,
            occurred_at: Utc::now(),
        };
        let booking = Booking::pending(&event, Utc::now());
        let history = BookingHistory::creation(&booking);
        let gate = LedgerKey::new(event.event_id, "test-consumer");

        let first = store
            .insert_pending(&gate, &booking, &history, Utc::now())
            .await
            .unwrap();
        assert_eq!(first, InsertOutcome::Inserted);
        assert!(store.seen(&gate).await.unwrap());

        let second = store
            .insert_pending(&gate, &booking, &history, Utc::now())
            .await
            .unwrap();
        assert_eq!(second, InsertOutcome::AlreadyProcessed);

        let stored = store
            .get_slot(slot.tenant_id, slot.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.available_bookings, 4);
    }

    #[tokio::test]
    async fn patch_preserves_the_live_counter() {
        let store = MemoryStore::new();
        let slot = future_slot(2);
        store.insert_slots(&[slot.clone()]).await.unwrap();
        store
            .reserve(slot.tenant_id, slot.id, Utc::now())
            .await
            .unwrap();

        // Patching unrelated fields leaves the counter alone.
        let patch = SlotPatch {
            start_at: Some(slot.start_at + Duration::hours(1)),
            end_at: Some(slot.end_at + Duration::hours(1)),
            max_bookings: None,
            is_available: None,
            updated_at: Utc::now(),
        };
        let updated = store
            .update_slot(slot.tenant_id, slot.id, &patch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.available_bookings, 1);

        // A capacity change keeps the seat already taken.
        let patch = SlotPatch {
            start_at: None,
            end_at: None,
            max_bookings: Some(3),
            is_available: None,
            updated_at: Utc::now(),
        };
        let updated = store
            .update_slot(slot.tenant_id, slot.id, &patch)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.max_bookings, 3);
        assert_eq!(updated.available_bookings, 2);
    }

    #[tokio::test]
    async fn release_is_capped_at_max() {
        let store = MemoryStore::new();
        let slot = future_slot(2);
        store.insert_slots(&[slot.clone()]).await.unwrap();

        store.release(slot.tenant_id, slot.id).await.unwrap();
        store.release(slot.tenant_id, slot.id).await.unwrap();

        let stored = store
            .get_slot(slot.tenant_id, slot.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.available_bookings, 2);
    }

    #[tokio::test]
    async fn failed_capacity_guard_leaves_no_trace() {
        let store = MemoryStore::new();
        let mut slot = future_slot(1);
        slot.available_bookings = 0;
        store.insert_slots(&[slot.clone()]).await.unwrap();

        let event = reserva_domain::events::BookingCreated {
            event_id: Uuid::new_v4(),
            version: 1,
            booking_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            service_id: slot.service_id,
            slot_id: slot.id,
            provider_id: slot.provider_id,
            tenant_id: slot.tenant_id,
            amount_minor: 1000,
            currency: "USD".into(),
            notes: None,
            occurred_at: Utc::now(),
        };
        let booking = Booking::pending(&event, Utc::now());
        let history = BookingHistory::creation(&booking);
        let gate = LedgerKey::new(event.event_id, "test-consumer");

        let outcome = store
            .insert_pending(&gate, &booking, &history, Utc::now())
            .await
            .unwrap();
        assert_eq!(outcome, InsertOutcome::CapacityExhausted);
        assert!(!store.seen(&gate).await.unwrap());
        assert!(store
            .get_booking(slot.tenant_id, booking.id)
            .await
            .unwrap()
            .is_none());
        assert_eq!(
            store
                .booking_history(slot.tenant_id, booking.id)
                .await
                .unwrap()
                .len(),
            0
        );
    }

    #[tokio::test]
    async fn double_cancel_is_rejected_without_double_release() {
        let store = MemoryStore::new();
        let slot = future_slot(1);
        store.insert_slots(&[slot.clone()]).await.unwrap();

        let event = reserva_domain::events::BookingCreated {
            event_id: Uuid::new_v4(),
            version: 1,
            booking_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            service_id: slot.service_id,
            slot_id: slot.id,
            provider_id: slot.provider_id,
            tenant_id: slot.tenant_id,
            amount_minor: 1000,
            currency: "USD".into(),
            notes: None,
            occurred_at: Utc::now(),
        };
        let booking = Booking::pending(&event, Utc::now());
        let history = BookingHistory::creation(&booking);
        let gate = LedgerKey::new(event.event_id, "test-consumer");
        store
            .insert_pending(&gate, &booking, &history, Utc::now())
            .await
            .unwrap();

        let change = StatusChange {
            tenant_id: slot.tenant_id,
            booking_id: booking.id,
            allowed_from: &[BookingStatus::Pending, BookingStatus::Confirmed],
            to: BookingStatus::Cancelled,
            changed_by: booking.customer_id,
            reason: Some("changed plans".into()),
            changed_at: Utc::now(),
            is_cancellation: true,
            release_slot: Some(slot.id),
        };
        assert!(matches!(
            store.transition(None, &change).await.unwrap(),
            TransitionOutcome::Applied(_)
        ));
        assert!(matches!(
            store.transition(None, &change).await.unwrap(),
            TransitionOutcome::WrongState(BookingStatus::Cancelled)
        ));

        let stored = store
            .get_slot(slot.tenant_id, slot.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.available_bookings, 1);
    }
}
