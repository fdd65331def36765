use chrono::{DateTime, Duration, Utc};

use reserva_domain::slot::{RecurrencePattern, RecurringSlotSpec};

/// Lazy finite sequence of `(start, end)` windows for a recurring series.
/// Ends at the occurrence budget, the optional cutoff date, or calendar
/// overflow, whichever comes first.
pub struct Occurrences {
    next_start: Option<DateTime<Utc>>,
    remaining: u32,
    pattern: RecurrencePattern,
    interval: u32,
    duration: Duration,
    cutoff: Option<DateTime<Utc>>,
}

pub fn occurrences(spec: &RecurringSlotSpec) -> Occurrences {
    Occurrences {
        next_start: Some(spec.start_at),
        remaining: spec.occurrences,
        pattern: spec.pattern,
        interval: spec.interval,
        duration: spec.duration(),
        cutoff: spec.max_occurrence_date,
    }
}

impl Iterator for Occurrences {
    type Item = (DateTime<Utc>, DateTime<Utc>);

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        let start = self.next_start?;
        if self.cutoff.map_or(false, |cutoff| start > cutoff) {
            return None;
        }
        // Checked add so a window near the calendar bound ends the
        // sequence instead of panicking.
        let end = start.checked_add_signed(self.duration)?;
        self.remaining -= 1;
        self.next_start = self.pattern.advance(start, self.interval);
        Some((start, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use uuid::Uuid;

    fn weekly_spec(occurrences: u32) -> RecurringSlotSpec {
        RecurringSlotSpec {
            service_id: Uuid::new_v4(),
            pattern: RecurrencePattern::Weekly,
            interval: 1,
            start_at: Utc.with_ymd_and_hms(2026, 4, 6, 9, 0, 0).unwrap(),
            duration_minutes: 60,
            occurrences,
            max_occurrence_date: None,
            max_bookings: 3,
        }
    }

    #[test]
    fn weekly_series_advances_seven_days() {
        let windows: Vec<_> = occurrences(&weekly_spec(4)).collect();
        assert_eq!(windows.len(), 4);
        for pair in windows.windows(2) {
            assert_eq!(pair[1].0 - pair[0].0, Duration::days(7));
        }
        for (start, end) in windows {
            assert_eq!(end - start, Duration::minutes(60));
        }
    }

    #[test]
    fn cutoff_ends_the_series_early() {
        let mut spec = weekly_spec(10);
        spec.max_occurrence_date = Some(spec.start_at + Duration::days(15));
        let windows: Vec<_> = occurrences(&spec).collect();
        assert_eq!(windows.len(), 3);
    }

    #[test]
    fn calendar_overflow_ends_the_sequence() {
        let mut spec = weekly_spec(5);
        spec.start_at = DateTime::<Utc>::MAX_UTC - Duration::minutes(30);
        let windows: Vec<_> = occurrences(&spec).collect();
        assert!(windows.is_empty());
    }

    #[test]
    fn interval_scales_the_step() {
        let mut spec = weekly_spec(3);
        spec.pattern = RecurrencePattern::Daily;
        spec.interval = 2;
        let windows: Vec<_> = occurrences(&spec).collect();
        assert_eq!(windows[2].0 - windows[0].0, Duration::days(4));
    }
}
