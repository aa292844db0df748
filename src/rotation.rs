// src/rotation.rs
//
// Sponsor banner rotation. The carousel advances one slot per fixed interval;
// these helpers keep the index math and the eligibility rule in one place so
// the list endpoint and /ads/current agree.

use chrono::{DateTime, Utc};

pub const AD_STATUS_INACTIVE: i16 = 0;
pub const AD_STATUS_ACTIVE: i16 = 1;

/// An ad is shown only while active and strictly before its expiry.
/// An ad expiring exactly at `now` is already out of rotation.
pub fn is_eligible(status: i16, expires_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    status == AD_STATUS_ACTIVE && expires_at > now
}

/// Displayed index after `ticks` interval boundaries have passed since the
/// carousel started. Single-item (or empty) sets never rotate.
pub fn index_after_ticks(len: usize, ticks: u64) -> usize {
    if len < 2 {
        return 0;
    }
    (ticks % len as u64) as usize
}

/// Tick count for a carousel that started `elapsed_secs` ago.
pub fn ticks_elapsed(elapsed_secs: i64, interval_secs: i64) -> u64 {
    if elapsed_secs <= 0 || interval_secs <= 0 {
        return 0;
    }
    (elapsed_secs / interval_secs) as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_750_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn test_expiry_boundary_is_strict() {
        let now = t(0);
        assert!(is_eligible(AD_STATUS_ACTIVE, t(1), now));
        // expiry exactly at now is not eligible
        assert!(!is_eligible(AD_STATUS_ACTIVE, now, now));
        assert!(!is_eligible(AD_STATUS_ACTIVE, t(-1), now));
    }

    #[test]
    fn test_only_active_status_is_eligible() {
        let now = t(0);
        assert!(!is_eligible(AD_STATUS_INACTIVE, t(3600), now));
        assert!(!is_eligible(99, t(3600), now));
    }

    #[test]
    fn test_rotation_cycles_back_after_len_ticks() {
        for len in 2..=5 {
            assert_eq!(index_after_ticks(len, 0), 0);
            for tick in 0..len as u64 {
                assert_eq!(index_after_ticks(len, tick), tick as usize);
            }
            assert_eq!(index_after_ticks(len, len as u64), 0);
        }
    }

    #[test]
    fn test_single_item_never_rotates() {
        assert_eq!(index_after_ticks(1, 0), 0);
        assert_eq!(index_after_ticks(1, 17), 0);
        assert_eq!(index_after_ticks(0, 3), 0);
    }

    #[test]
    fn test_ticks_elapsed() {
        assert_eq!(ticks_elapsed(0, 10), 0);
        assert_eq!(ticks_elapsed(9, 10), 0);
        assert_eq!(ticks_elapsed(10, 10), 1);
        assert_eq!(ticks_elapsed(35, 10), 3);
        assert_eq!(ticks_elapsed(-5, 10), 0);
    }
}
