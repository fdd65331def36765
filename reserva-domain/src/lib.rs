pub mod booking;
pub mod error;
pub mod events;
pub mod identity;
pub mod slot;
pub mod store;

pub use booking::{Booking, BookingFilter, BookingHistory, BookingStatus};
pub use error::{DomainError, StoreError};
pub use events::DomainEvent;
pub use identity::Actor;
pub use slot::{CreateSlotRequest, RecurrencePattern, RecurringSlotSpec, Slot, UpdateSlotRequest};
pub use store::{
    BookingStore, EventPublisher, IdempotencyLedger, InsertOutcome, LedgerKey, MoveOutcome,
    ReserveOutcome, SlotMove, SlotPatch, SlotStore, StatusChange, TransitionOutcome,
};

pub type DomainResult<T> = Result<T, DomainError>;
