use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::events::BookingCreated;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BookingStatus {
    Pending,
    Confirmed,
    Cancelled,
    Completed,
}

impl BookingStatus {
    /// Terminal states reject every further transition.
    pub fn is_terminal(&self) -> bool {
        matches!(self, BookingStatus::Cancelled | BookingStatus::Completed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            BookingStatus::Pending => "Pending",
            BookingStatus::Confirmed => "Confirmed",
            BookingStatus::Cancelled => "Cancelled",
            BookingStatus::Completed => "Completed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "Pending" => Some(BookingStatus::Pending),
            "Confirmed" => Some(BookingStatus::Confirmed),
            "Cancelled" => Some(BookingStatus::Cancelled),
            "Completed" => Some(BookingStatus::Completed),
            _ => None,
        }
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A customer's reservation of a slot. Never physically deleted; cancellation
/// is a status transition retained for audit via [`BookingHistory`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Booking {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub service_id: Uuid,
    pub slot_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub status: BookingStatus,
    pub amount_minor: i64,
    pub currency: String,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub cancelled_at: Option<DateTime<Utc>>,
    pub cancelled_by: Option<Uuid>,
    pub cancellation_reason: Option<String>,
}

impl Booking {
    /// Builds the Pending booking recorded when a `BookingCreated` event is
    /// accepted by the coordinator.
    pub fn pending(event: &BookingCreated, now: DateTime<Utc>) -> Self {
        Self {
            id: event.booking_id,
            customer_id: event.customer_id,
            service_id: event.service_id,
            slot_id: event.slot_id,
            provider_id: event.provider_id,
            tenant_id: event.tenant_id,
            status: BookingStatus::Pending,
            amount_minor: event.amount_minor,
            currency: event.currency.clone(),
            notes: event.notes.clone(),
            created_at: now,
            updated_at: now,
            cancelled_at: None,
            cancelled_by: None,
            cancellation_reason: None,
        }
    }
}

/// Append-only record of a status transition. Exactly one row per transition,
/// written in the same transaction as the booking mutation it records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingHistory {
    pub id: Uuid,
    pub booking_id: Uuid,
    pub tenant_id: Uuid,
    /// None for the creation row.
    pub old_status: Option<BookingStatus>,
    pub new_status: BookingStatus,
    pub changed_by: Uuid,
    pub reason: Option<String>,
    pub changed_at: DateTime<Utc>,
}

impl BookingHistory {
    pub fn creation(booking: &Booking) -> Self {
        Self {
            id: Uuid::new_v4(),
            booking_id: booking.id,
            tenant_id: booking.tenant_id,
            old_status: None,
            new_status: booking.status,
            changed_by: booking.customer_id,
            reason: None,
            changed_at: booking.created_at,
        }
    }
}

/// Tenant-scoped filter for operational booking reads.
#[derive(Debug, Clone, Default)]
pub struct BookingFilter {
    pub customer_id: Option<Uuid>,
    pub service_id: Option<Uuid>,
    pub status: Option<BookingStatus>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_roundtrip() {
        for status in [
            BookingStatus::Pending,
            BookingStatus::Confirmed,
            BookingStatus::Cancelled,
            BookingStatus::Completed,
        ] {
            assert_eq!(BookingStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(BookingStatus::parse("Unknown"), None);
    }

    #[test]
    fn terminal_states() {
        assert!(!BookingStatus::Pending.is_terminal());
        assert!(!BookingStatus::Confirmed.is_terminal());
        assert!(BookingStatus::Cancelled.is_terminal());
        assert!(BookingStatus::Completed.is_terminal());
    }
}
