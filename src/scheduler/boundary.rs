//! Wall-clock boundary arithmetic. Everything is absolute unix seconds so a
//! slow run never shifts later boundaries.
use crate::granularity::Granularity;
use chrono::Utc;
use std::time::Duration;

/// Smallest multiple of `period` strictly after `now`
pub fn next_boundary(now: i64, period: i64) -> i64 {
    (now.div_euclid(period) + 1) * period
}

pub fn is_aligned(timestamp: i64, period: i64) -> bool {
    timestamp.rem_euclid(period) == 0
}

pub fn align_down(timestamp: i64, period: i64) -> i64 {
    timestamp - timestamp.rem_euclid(period)
}

/// Window the upstream should have published by `boundary`
pub fn target_window(boundary: i64, granularity: Granularity) -> i64 {
    boundary - granularity.period_secs()
}

/// Time left until `boundary` on the wall clock, zero if already past
pub fn until_boundary(boundary: i64) -> Duration {
    let remaining_ms = boundary.saturating_mul(1_000) - Utc::now().timestamp_millis();
    Duration::from_millis(remaining_ms.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn next_boundary_is_strictly_after_now() {
        assert_eq!(next_boundary(0, 300), 300);
        assert_eq!(next_boundary(299, 300), 300);
        assert_eq!(next_boundary(300, 300), 600);
        assert_eq!(next_boundary(1_700_000_123, 60), 1_700_000_160);
    }

    #[test]
    fn alignment_helpers() {
        assert!(is_aligned(3_600, 3_600));
        assert!(!is_aligned(3_900, 3_600));
        assert_eq!(align_down(3_899, 300), 3_600);
        assert_eq!(align_down(-1, 300), -300);
    }

    #[test]
    fn hourly_boundary_targets_the_previous_hour() {
        assert_eq!(target_window(7_200, Granularity::OneHour), 3_600);
        assert_eq!(target_window(7_200, Granularity::FiveMinutes), 6_900);
    }

    #[test]
    fn past_boundaries_do_not_wait() {
        assert_eq!(until_boundary(0), Duration::ZERO);
    }
}
