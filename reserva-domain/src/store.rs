use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::booking::{Booking, BookingFilter, BookingHistory, BookingStatus};
use crate::error::StoreError;
use crate::events::DomainEvent;
use crate::slot::Slot;

/// Write-once key of the idempotency ledger.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LedgerKey {
    pub event_id: Uuid,
    pub consumer: &'static str,
}

impl LedgerKey {
    pub fn new(event_id: Uuid, consumer: &'static str) -> Self {
        Self { event_id, consumer }
    }
}

/// Fast duplicate probe over the durable ledger.
///
/// This is an optimization only: the authoritative gate is the ledger row
/// inserted inside the same transaction as the booking mutation (see the
/// composite operations on [`BookingStore`]). A probe that misses while a
/// concurrent handler commits is harmless; the composite insert still
/// short-circuits.
#[async_trait]
pub trait IdempotencyLedger: Send + Sync {
    async fn seen(&self, key: &LedgerKey) -> Result<bool, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved,
    /// The conditional update matched no row: blocked, full, already
    /// started, or absent.
    Unavailable,
}

/// Partial slot update applied as one atomic statement. The seat counter is
/// never carried here: when `max_bookings` changes, the store recomputes
/// `available_bookings` from the live booked count in the same statement,
/// so a concurrent reservation cannot be overwritten by a stale snapshot.
#[derive(Debug, Clone)]
pub struct SlotPatch {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub max_bookings: Option<i32>,
    pub is_available: Option<bool>,
    pub updated_at: DateTime<Utc>,
}

/// Storage seam for slots. `update_slot`, `reserve`, `release` and
/// `set_available` must be single atomic conditional updates, never
/// read-then-write.
#[async_trait]
pub trait SlotStore: Send + Sync {
    async fn get_slot(&self, tenant_id: Uuid, slot_id: Uuid) -> Result<Option<Slot>, StoreError>;

    async fn insert_slots(&self, slots: &[Slot]) -> Result<(), StoreError>;

    /// Applies the patch atomically; on a capacity change the remaining
    /// availability is recomputed from the live booked count, floored at
    /// zero. Returns the updated slot, or None when it did not exist.
    async fn update_slot(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
        patch: &SlotPatch,
    ) -> Result<Option<Slot>, StoreError>;

    /// Returns false when the slot did not exist.
    async fn delete_slot(&self, tenant_id: Uuid, slot_id: Uuid) -> Result<bool, StoreError>;

    async fn slot_has_bookings(&self, tenant_id: Uuid, slot_id: Uuid)
        -> Result<bool, StoreError>;

    /// Inclusive-exclusive temporal overlap test against existing slots for
    /// the same service and tenant.
    async fn has_overlap(
        &self,
        tenant_id: Uuid,
        service_id: Uuid,
        start_at: DateTime<Utc>,
        end_at: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    /// Atomically decrements `available_bookings` iff the slot is available,
    /// has remaining capacity and starts after `now`.
    async fn reserve(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<ReserveOutcome, StoreError>;

    /// Atomically increments `available_bookings`, capped at `max_bookings`.
    async fn release(&self, tenant_id: Uuid, slot_id: Uuid) -> Result<(), StoreError>;

    /// Flips the manual block flag without touching the counter. Returns
    /// false when the slot did not exist.
    async fn set_available(
        &self,
        tenant_id: Uuid,
        slot_id: Uuid,
        available: bool,
    ) -> Result<bool, StoreError>;
}

/// Guarded status change applied atomically with its history row, the
/// ledger gate and an optional capacity release.
#[derive(Debug, Clone)]
pub struct StatusChange {
    pub tenant_id: Uuid,
    pub booking_id: Uuid,
    /// Source states the transition is valid from; re-checked inside the
    /// transaction so concurrent handlers cannot double-apply.
    pub allowed_from: &'static [BookingStatus],
    pub to: BookingStatus,
    pub changed_by: Uuid,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
    /// Stamps `cancelled_at`/`cancelled_by` on the booking.
    pub is_cancellation: bool,
    /// Slot whose capacity is restored in the same transaction.
    pub release_slot: Option<Uuid>,
}

#[derive(Debug)]
pub enum TransitionOutcome {
    Applied(Booking),
    /// The ledger already holds the gating key; nothing was reapplied.
    AlreadyProcessed,
    NotFound,
    /// The booking exists but is not in an allowed source state.
    WrongState(BookingStatus),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    AlreadyProcessed,
    /// The slot reservation guard failed; nothing was persisted.
    CapacityExhausted,
}

/// Atomic slot move for reschedule: reserve the new slot, release the old
/// one and repoint the booking, or change nothing at all.
#[derive(Debug, Clone)]
pub struct SlotMove {
    pub tenant_id: Uuid,
    pub booking_id: Uuid,
    pub allowed_from: &'static [BookingStatus],
    pub old_slot_id: Uuid,
    pub new_slot_id: Uuid,
    pub changed_by: Uuid,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug)]
pub enum MoveOutcome {
    Applied(Booking),
    NotFound,
    WrongState(BookingStatus),
    CapacityExhausted,
}

/// Storage seam for bookings and their audit trail. The composite
/// operations bundle the idempotency-ledger write, the capacity mutation
/// and the booking/history writes into one transaction, which is what makes
/// at-least-once delivery safe.
#[async_trait]
pub trait BookingStore: Send + Sync {
    async fn get_booking(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
    ) -> Result<Option<Booking>, StoreError>;

    /// One booking per (customer, slot) guard.
    async fn customer_has_booking(
        &self,
        tenant_id: Uuid,
        customer_id: Uuid,
        slot_id: Uuid,
    ) -> Result<bool, StoreError>;

    /// Atomic: ledger insert + slot reserve + booking/history insert.
    async fn insert_pending(
        &self,
        gate: &LedgerKey,
        booking: &Booking,
        history: &BookingHistory,
        now: DateTime<Utc>,
    ) -> Result<InsertOutcome, StoreError>;

    /// Atomic: optional ledger insert + guarded status update + history row
    /// + optional capacity release. The history row is derived from the
    /// change inside the transaction, so there is exactly one per applied
    /// transition.
    async fn transition(
        &self,
        gate: Option<&LedgerKey>,
        change: &StatusChange,
    ) -> Result<TransitionOutcome, StoreError>;

    /// Atomic reschedule; see [`SlotMove`].
    async fn move_slot(&self, change: &SlotMove) -> Result<MoveOutcome, StoreError>;

    async fn list_bookings(
        &self,
        tenant_id: Uuid,
        filter: &BookingFilter,
    ) -> Result<Vec<Booking>, StoreError>;

    async fn booking_history(
        &self,
        tenant_id: Uuid,
        booking_id: Uuid,
    ) -> Result<Vec<BookingHistory>, StoreError>;

    /// Confirmed bookings whose slot start time has elapsed, for the
    /// completion sweep.
    async fn confirmed_started_before(
        &self,
        now: DateTime<Utc>,
        limit: i64,
    ) -> Result<Vec<Booking>, StoreError>;
}

/// Outbound side of the event bus.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, event: &DomainEvent) -> Result<(), StoreError>;
}
