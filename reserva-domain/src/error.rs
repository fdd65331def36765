use thiserror::Error;

use crate::booking::BookingStatus;

/// Error taxonomy shared by the capacity engine and the saga coordinator.
///
/// Everything except `Transient` is permanent: it must be acknowledged and
/// never retried. `Transient` signals the caller (or the bus, via a skipped
/// acknowledgment) to retry later.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("slot has no remaining availability")]
    CapacityExhausted,

    #[error("not authorized: {0}")]
    Authorization(&'static str),

    #[error("invalid state transition from {from} to {to}")]
    InvalidStateTransition {
        from: BookingStatus,
        to: BookingStatus,
    },

    #[error("transient infrastructure failure: {0}")]
    Transient(#[from] StoreError),
}

impl DomainError {
    /// Permanent errors are acknowledged and logged; transient ones are
    /// surfaced so the event gets redelivered.
    pub fn is_permanent(&self) -> bool {
        !matches!(self, DomainError::Transient(_))
    }
}

/// Failures raised by storage and bus adapters. Always treated as transient.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(String),

    #[error("event bus error: {0}")]
    Bus(String),
}
