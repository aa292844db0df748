// src/scheduling.rs
//
// Room availability is decided in two places: this pure check (for a useful
// 409 payload listing the conflicting bookings) and the exclusion constraint
// on the booking table (the actual guarantee under concurrent writers).

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use uuid::Uuid;

pub const BOOKING_STATUS_SCHEDULED: i16 = 0;
pub const BOOKING_STATUS_COMPLETED: i16 = 1;
pub const BOOKING_STATUS_CANCELLED: i16 = 2;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SchedulingError {
    #[error("duration must be a positive number of minutes (got {0})")]
    InvalidDuration(i64),
}

/// Half-open interval `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeWindow {
    pub fn from_start_and_minutes(
        start: DateTime<Utc>,
        minutes: i64,
    ) -> Result<Self, SchedulingError> {
        if minutes <= 0 {
            return Err(SchedulingError::InvalidDuration(minutes));
        }
        Ok(TimeWindow {
            start,
            end: start + Duration::minutes(minutes),
        })
    }

    pub fn from_bounds(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, SchedulingError> {
        let minutes = (end - start).num_minutes();
        if end <= start {
            return Err(SchedulingError::InvalidDuration(minutes));
        }
        Ok(TimeWindow { start, end })
    }
}

/// Two half-open windows overlap iff each starts before the other ends.
/// A booking that ends exactly when another begins does not conflict.
pub fn overlaps(a: TimeWindow, b: TimeWindow) -> bool {
    a.start < b.end && b.start < a.end
}

/// An existing booking as seen by the checker.
#[derive(Debug, Clone)]
pub struct BookingSlot {
    pub booking_id: Uuid,
    pub window: TimeWindow,
    pub status: i16,
}

#[derive(Debug)]
pub struct Availability {
    pub available: bool,
    pub conflicts: Vec<Uuid>,
}

/// Pure check of `candidate` against `existing`. Cancelled bookings never
/// count as conflicts. This does not hold any lock; callers that go on to
/// write must still rely on the storage-layer exclusion constraint.
pub fn check_availability(candidate: TimeWindow, existing: &[BookingSlot]) -> Availability {
    let conflicts: Vec<Uuid> = existing
        .iter()
        .filter(|b| b.status != BOOKING_STATUS_CANCELLED)
        .filter(|b| overlaps(candidate, b.window))
        .map(|b| b.booking_id)
        .collect();

    Availability {
        available: conflicts.is_empty(),
        conflicts,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 2, h, m, 0).unwrap()
    }

    fn win(h: u32, m: u32, minutes: i64) -> TimeWindow {
        TimeWindow::from_start_and_minutes(at(h, m), minutes).unwrap()
    }

    fn slot(id: u128, h: u32, m: u32, minutes: i64, status: i16) -> BookingSlot {
        BookingSlot {
            booking_id: Uuid::from_u128(id),
            window: win(h, m, minutes),
            status,
        }
    }

    #[test]
    fn test_zero_or_negative_duration_rejected() {
        assert_eq!(
            TimeWindow::from_start_and_minutes(at(9, 0), 0),
            Err(SchedulingError::InvalidDuration(0))
        );
        assert_eq!(
            TimeWindow::from_start_and_minutes(at(9, 0), -15),
            Err(SchedulingError::InvalidDuration(-15))
        );
        assert!(TimeWindow::from_bounds(at(10, 0), at(10, 0)).is_err());
        assert!(TimeWindow::from_bounds(at(10, 0), at(9, 0)).is_err());
    }

    #[test]
    fn test_adjacent_windows_do_not_overlap() {
        // 09:00-09:30 vs 09:30-10:00: half-open, no conflict
        assert!(!overlaps(win(9, 0, 30), win(9, 30, 30)));
        assert!(!overlaps(win(9, 30, 30), win(9, 0, 30)));
    }

    #[test]
    fn test_partial_overlap_detected() {
        // 09:00-09:30 vs 09:15-09:45
        assert!(overlaps(win(9, 0, 30), win(9, 15, 30)));
        assert!(overlaps(win(9, 15, 30), win(9, 0, 30)));
    }

    #[test]
    fn test_identical_windows_conflict() {
        assert!(overlaps(win(9, 0, 30), win(9, 0, 30)));
    }

    #[test]
    fn test_containment_conflicts() {
        assert!(overlaps(win(9, 0, 60), win(9, 15, 15)));
        assert!(overlaps(win(9, 15, 15), win(9, 0, 60)));
    }

    #[test]
    fn test_cancelled_booking_never_conflicts() {
        let existing = vec![slot(1, 10, 0, 30, BOOKING_STATUS_CANCELLED)];
        let result = check_availability(win(10, 0, 30), &existing);
        assert!(result.available);
        assert!(result.conflicts.is_empty());
    }

    #[test]
    fn test_room_scenario_overlap_then_adjacent() {
        // Room has one scheduled booking 10:00-10:30.
        let existing = vec![slot(7, 10, 0, 30, BOOKING_STATUS_SCHEDULED)];

        // 10:15 for 20 minutes: rejected, conflict is the 10:00 booking.
        let overlap = check_availability(win(10, 15, 20), &existing);
        assert!(!overlap.available);
        assert_eq!(overlap.conflicts, vec![Uuid::from_u128(7)]);

        // 10:30 for 15 minutes: adjacent window, accepted.
        let adjacent = check_availability(win(10, 30, 15), &existing);
        assert!(adjacent.available);
    }

    #[test]
    fn test_completed_booking_still_blocks() {
        let existing = vec![slot(3, 10, 0, 30, BOOKING_STATUS_COMPLETED)];
        let result = check_availability(win(10, 15, 20), &existing);
        assert!(!result.available);
    }

    #[test]
    fn test_all_conflicts_reported() {
        let existing = vec![
            slot(1, 9, 0, 60, BOOKING_STATUS_SCHEDULED),
            slot(2, 9, 30, 60, BOOKING_STATUS_SCHEDULED),
            slot(3, 11, 0, 30, BOOKING_STATUS_SCHEDULED),
        ];
        let result = check_availability(win(9, 45, 30), &existing);
        assert!(!result.available);
        assert_eq!(
            result.conflicts,
            vec![Uuid::from_u128(1), Uuid::from_u128(2)]
        );
    }
}
