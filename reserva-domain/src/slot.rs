use chrono::{DateTime, Duration, Months, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::DomainError;
use crate::identity::Actor;

/// A bookable window of time for a service, with seat accounting.
///
/// Invariant: `0 <= available_bookings <= max_bookings` at all times, even
/// under concurrent reservation attempts. The counter is only ever mutated
/// through the store's atomic conditional updates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Slot {
    pub id: Uuid,
    pub service_id: Uuid,
    pub provider_id: Uuid,
    pub tenant_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub max_bookings: i32,
    pub available_bookings: i32,
    pub is_available: bool,
    pub is_recurring: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Slot {
    pub fn from_request(request: &CreateSlotRequest, actor: Actor, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            service_id: request.service_id,
            provider_id: actor.user_id,
            tenant_id: actor.tenant_id,
            start_at: request.start_at,
            end_at: request.end_at,
            max_bookings: request.max_bookings,
            available_bookings: request.max_bookings,
            is_available: request.is_available,
            is_recurring: request.is_recurring,
            created_at: now,
            updated_at: now,
        }
    }

    /// A slot can take a booking iff it is not blocked, has remaining
    /// capacity and has not started yet.
    pub fn is_bookable(&self, now: DateTime<Utc>) -> bool {
        self.is_available && self.available_bookings > 0 && now < self.start_at
    }

    /// Seats currently taken.
    pub fn booked(&self) -> i32 {
        self.max_bookings - self.available_bookings
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSlotRequest {
    pub service_id: Uuid,
    pub start_at: DateTime<Utc>,
    pub end_at: DateTime<Utc>,
    pub max_bookings: i32,
    pub is_available: bool,
    pub is_recurring: bool,
}

impl CreateSlotRequest {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.service_id.is_nil() {
            return Err(DomainError::Validation("service id is required".into()));
        }
        if self.end_at <= self.start_at {
            return Err(DomainError::Validation(
                "slot end must be after its start".into(),
            ));
        }
        if self.max_bookings <= 0 {
            return Err(DomainError::Validation(
                "max bookings must be positive".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateSlotRequest {
    pub start_at: Option<DateTime<Utc>>,
    pub end_at: Option<DateTime<Utc>>,
    pub max_bookings: Option<i32>,
    pub is_available: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecurrencePattern {
    Daily,
    Weekly,
    Monthly,
}

impl RecurrencePattern {
    /// Advances a start time by one recurrence step. Returns None on
    /// calendar overflow, which ends the candidate sequence.
    pub fn advance(&self, from: DateTime<Utc>, interval: u32) -> Option<DateTime<Utc>> {
        match self {
            RecurrencePattern::Daily => from.checked_add_signed(Duration::days(interval as i64)),
            RecurrencePattern::Weekly => {
                from.checked_add_signed(Duration::days(7 * interval as i64))
            }
            RecurrencePattern::Monthly => from.checked_add_months(Months::new(interval)),
        }
    }
}

/// Request to generate a finite series of recurring slots.
#[derive(Debug, Clone, Deserialize)]
pub struct RecurringSlotSpec {
    pub service_id: Uuid,
    pub pattern: RecurrencePattern,
    pub interval: u32,
    pub start_at: DateTime<Utc>,
    pub duration_minutes: i64,
    pub occurrences: u32,
    pub max_occurrence_date: Option<DateTime<Utc>>,
    pub max_bookings: i32,
}

impl RecurringSlotSpec {
    pub fn validate(&self) -> Result<(), DomainError> {
        if self.service_id.is_nil() {
            return Err(DomainError::Validation("service id is required".into()));
        }
        if self.interval == 0 {
            return Err(DomainError::Validation(
                "recurrence interval must be positive".into(),
            ));
        }
        if self.duration_minutes <= 0 {
            return Err(DomainError::Validation(
                "slot duration must be positive".into(),
            ));
        }
        if self.duration_minutes > 7 * 24 * 60 {
            return Err(DomainError::Validation(
                "slot duration must not exceed one week".into(),
            ));
        }
        if self.occurrences == 0 {
            return Err(DomainError::Validation(
                "at least one occurrence is required".into(),
            ));
        }
        if self.max_bookings <= 0 {
            return Err(DomainError::Validation(
                "max bookings must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn slot_at(start: DateTime<Utc>) -> Slot {
        Slot {
            id: Uuid::new_v4(),
            service_id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            tenant_id: Uuid::new_v4(),
            start_at: start,
            end_at: start + Duration::hours(1),
            max_bookings: 2,
            available_bookings: 2,
            is_available: true,
            is_recurring: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn bookable_predicate() {
        let now = Utc.with_ymd_and_hms(2026, 3, 2, 9, 0, 0).unwrap();
        let mut slot = slot_at(now + Duration::hours(2));
        assert!(slot.is_bookable(now));

        slot.is_available = false;
        assert!(!slot.is_bookable(now));

        slot.is_available = true;
        slot.available_bookings = 0;
        assert!(!slot.is_bookable(now));

        slot.available_bookings = 1;
        assert!(!slot.is_bookable(slot.start_at));
    }

    #[test]
    fn recurring_spec_bounds_duration() {
        let mut spec = RecurringSlotSpec {
            service_id: Uuid::new_v4(),
            pattern: RecurrencePattern::Daily,
            interval: 1,
            start_at: Utc::now(),
            duration_minutes: 8 * 24 * 60,
            occurrences: 2,
            max_occurrence_date: None,
            max_bookings: 1,
        };
        assert!(spec.validate().is_err());

        spec.duration_minutes = 60;
        assert!(spec.validate().is_ok());
    }

    #[test]
    fn monthly_advance_lands_on_same_day() {
        let start = Utc.with_ymd_and_hms(2026, 1, 15, 10, 0, 0).unwrap();
        let next = RecurrencePattern::Monthly.advance(start, 1).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2026, 2, 15, 10, 0, 0).unwrap());
    }
}
