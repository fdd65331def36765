use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::booking::Booking;
use crate::error::DomainError;
use crate::slot::Slot;

/// Current payload version stamped on every emitted event.
pub const EVENT_VERSION: u16 = 1;

/// Emitted by the (out-of-scope) request handler when a customer asks for a
/// booking. Consumed by the saga coordinator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingCreated {
    pub event_id: Uuid,
    pub version: u16,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub service_id: Uuid,
    pub slot_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub notes: Option<String>,
    pub occurred_at: DateTime<Utc>,
}

impl BookingCreated {
    pub fn validate(&self) -> Result<(), DomainError> {
        let mut errors = Vec::new();
        require_id(&mut errors, self.event_id, "event id");
        require_id(&mut errors, self.booking_id, "booking id");
        require_id(&mut errors, self.customer_id, "customer id");
        require_id(&mut errors, self.service_id, "service id");
        require_id(&mut errors, self.slot_id, "slot id");
        require_id(&mut errors, self.provider_id, "provider id");
        require_id(&mut errors, self.tenant_id, "tenant id");
        if self.amount_minor <= 0 {
            errors.push("amount must be greater than zero");
        }
        if self.currency.is_empty() {
            errors.push("currency is required");
        }
        collect(errors)
    }
}

/// Emitted by the payment collaborator after a successful charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentProcessed {
    pub event_id: Uuid,
    pub version: u16,
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub payment_method: String,
    pub transaction_id: String,
    pub gateway: String,
    pub processed_at: DateTime<Utc>,
}

impl PaymentProcessed {
    pub fn validate(&self) -> Result<(), DomainError> {
        let mut errors = Vec::new();
        require_id(&mut errors, self.event_id, "event id");
        require_id(&mut errors, self.payment_id, "payment id");
        require_id(&mut errors, self.booking_id, "booking id");
        require_id(&mut errors, self.customer_id, "customer id");
        require_id(&mut errors, self.provider_id, "provider id");
        require_id(&mut errors, self.tenant_id, "tenant id");
        if self.amount_minor <= 0 {
            errors.push("amount must be greater than zero");
        }
        if self.currency.is_empty() {
            errors.push("currency is required");
        }
        if self.payment_method.is_empty() {
            errors.push("payment method is required");
        }
        if self.transaction_id.is_empty() {
            errors.push("transaction id is required");
        }
        if self.gateway.is_empty() {
            errors.push("payment gateway is required");
        }
        collect(errors)
    }
}

/// Emitted by the payment collaborator when a charge attempt fails.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentFailed {
    pub event_id: Uuid,
    pub version: u16,
    pub payment_id: Uuid,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub failure_reason: String,
    pub failed_at: DateTime<Utc>,
}

impl PaymentFailed {
    pub fn validate(&self) -> Result<(), DomainError> {
        let mut errors = Vec::new();
        require_id(&mut errors, self.event_id, "event id");
        require_id(&mut errors, self.booking_id, "booking id");
        require_id(&mut errors, self.tenant_id, "tenant id");
        collect(errors)
    }
}

/// Payment-initiation request emitted once a Pending booking is recorded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentRequested {
    pub event_id: Uuid,
    pub version: u16,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub amount_minor: i64,
    pub currency: String,
    pub requested_at: DateTime<Utc>,
}

impl PaymentRequested {
    pub fn for_booking(booking: &Booking, now: DateTime<Utc>) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            version: EVENT_VERSION,
            booking_id: booking.id,
            customer_id: booking.customer_id,
            provider_id: booking.provider_id,
            tenant_id: booking.tenant_id,
            amount_minor: booking.amount_minor,
            currency: booking.currency.clone(),
            requested_at: now,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingConfirmed {
    pub event_id: Uuid,
    pub version: u16,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub slot_start_at: DateTime<Utc>,
    pub slot_end_at: DateTime<Utc>,
    pub confirmed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingCancelled {
    pub event_id: Uuid,
    pub version: u16,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub cancelled_by: Uuid,
    pub reason: Option<String>,
    pub cancelled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookingRescheduled {
    pub event_id: Uuid,
    pub version: u16,
    pub booking_id: Uuid,
    pub customer_id: Uuid,
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub old_slot_id: Uuid,
    pub new_slot_id: Uuid,
    pub old_start_at: DateTime<Utc>,
    pub old_end_at: DateTime<Utc>,
    pub new_start_at: DateTime<Utc>,
    pub new_end_at: DateTime<Utc>,
    pub rescheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationAudience {
    Customer,
    Provider,
}

/// Fan-out request for the (out-of-scope) notification collaborator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationRequested {
    pub event_id: Uuid,
    pub version: u16,
    pub notification_id: Uuid,
    pub recipient_id: Uuid,
    pub tenant_id: Uuid,
    pub audience: NotificationAudience,
    pub channel: String,
    pub title: String,
    pub body: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotCreated {
    pub event_id: Uuid,
    pub version: u16,
    pub slot_id: Uuid,
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub max_bookings: i32,
    pub is_recurring: bool,
    pub created_at: DateTime<Utc>,
}

impl SlotCreated {
    pub fn for_slot(slot: &Slot) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            version: EVENT_VERSION,
            slot_id: slot.id,
            service_id: slot.service_id,
            provider_id: slot.provider_id,
            tenant_id: slot.tenant_id,
            start_at: slot.start_at,
            end_at: slot.end_at,
            max_bookings: slot.max_bookings,
            is_recurring: slot.is_recurring,
            created_at: slot.created_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotUpdated {
    pub event_id: Uuid,
    pub version: u16,
    pub slot_id: Uuid,
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub max_bookings: i32,
    pub is_available: bool,
    pub updated_at: DateTime<Utc>,
}

impl SlotUpdated {
    pub fn for_slot(slot: &Slot) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            version: EVENT_VERSION,
            slot_id: slot.id,
            service_id: slot.service_id,
            provider_id: slot.provider_id,
            tenant_id: slot.tenant_id,
            start_at: slot.start_at,
            end_at: slot.end_at,
            max_bookings: slot.max_bookings,
            is_available: slot.is_available,
            updated_at: slot.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SlotDeleted {
    pub event_id: Uuid,
    pub version: u16,
    pub slot_id: Uuid,
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub deleted_at: DateTime<Utc>,
}

/// Every event the system consumes or publishes, with its topic and
/// partition key. Payloads are immutable and versioned.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    BookingCreated(BookingCreated),
    PaymentRequested(PaymentRequested),
    PaymentProcessed(PaymentProcessed),
    PaymentFailed(PaymentFailed),
    BookingConfirmed(BookingConfirmed),
    BookingCancelled(BookingCancelled),
    BookingRescheduled(BookingRescheduled),
    NotificationRequested(NotificationRequested),
    SlotCreated(SlotCreated),
    SlotUpdated(SlotUpdated),
    SlotDeleted(SlotDeleted),
}

impl DomainEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            DomainEvent::BookingCreated(_) => "booking.created",
            DomainEvent::PaymentRequested(_) => "payment.requested",
            DomainEvent::PaymentProcessed(_) => "payment.processed",
            DomainEvent::PaymentFailed(_) => "payment.failed",
            DomainEvent::BookingConfirmed(_) => "booking.confirmed",
            DomainEvent::BookingCancelled(_) => "booking.cancelled",
            DomainEvent::BookingRescheduled(_) => "booking.rescheduled",
            DomainEvent::NotificationRequested(_) => "notification.requested",
            DomainEvent::SlotCreated(_) => "slot.created",
            DomainEvent::SlotUpdated(_) => "slot.updated",
            DomainEvent::SlotDeleted(_) => "slot.deleted",
        }
    }

    /// Partition key: the aggregate the event belongs to, so per-aggregate
    /// ordering holds on the bus.
    pub fn key(&self) -> String {
        match self {
            DomainEvent::BookingCreated(e) => e.booking_id.to_string(),
            DomainEvent::PaymentRequested(e) => e.booking_id.to_string(),
            DomainEvent::PaymentProcessed(e) => e.booking_id.to_string(),
            DomainEvent::PaymentFailed(e) => e.booking_id.to_string(),
            DomainEvent::BookingConfirmed(e) => e.booking_id.to_string(),
            DomainEvent::BookingCancelled(e) => e.booking_id.to_string(),
            DomainEvent::BookingRescheduled(e) => e.booking_id.to_string(),
            DomainEvent::NotificationRequested(e) => e.recipient_id.to_string(),
            DomainEvent::SlotCreated(e) => e.slot_id.to_string(),
            DomainEvent::SlotUpdated(e) => e.slot_id.to_string(),
            DomainEvent::SlotDeleted(e) => e.slot_id.to_string(),
        }
    }

    pub fn event_id(&self) -> Uuid {
        match self {
            DomainEvent::BookingCreated(e) => e.event_id,
            DomainEvent::PaymentRequested(e) => e.event_id,
            DomainEvent::PaymentProcessed(e) => e.event_id,
            DomainEvent::PaymentFailed(e) => e.event_id,
            DomainEvent::BookingConfirmed(e) => e.event_id,
            DomainEvent::BookingCancelled(e) => e.event_id,
            DomainEvent::BookingRescheduled(e) => e.event_id,
            DomainEvent::NotificationRequested(e) => e.event_id,
            DomainEvent::SlotCreated(e) => e.event_id,
            DomainEvent::SlotUpdated(e) => e.event_id,
            DomainEvent::SlotDeleted(e) => e.event_id,
        }
    }
}

fn require_id(errors: &mut Vec<&'static str>, id: Uuid, what: &'static str) {
    if id.is_nil() {
        errors.push(what);
    }
}

fn collect(errors: Vec<&'static str>) -> Result<(), DomainError> {
    if errors.is_empty() {
        Ok(())
    } else {
        Err(DomainError::Validation(errors.join(", ")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid_created() -> BookingCreated {
        BookingCreated {
            event_id: Uuid::new_v4(),
            version: EVENT_VERSION,
            booking_id: Uuid::new_v4(),
            customer_id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            slot_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            amount_minor: 2500,
            currency: "USD".into(),
            notes: None,
            occurred_at: Utc::now(),
        }
    }

    #[test]
    fn booking_created_validation() {
        assert!(valid_created().validate().is_ok());

        let mut missing = valid_created();
        missing.customer_id = Uuid::nil();
        missing.amount_minor = 0;
        let err = missing.validate().unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("customer id"));
        assert!(msg.contains("amount"));
    }

    #[test]
    fn envelope_roundtrip() {
        let event = DomainEvent::BookingCreated(valid_created());
        let json = serde_json::to_string(&event).unwrap();
        let back: DomainEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back.event_id(), event.event_id());
        assert_eq!(back.topic(), "booking.created");
    }
}
