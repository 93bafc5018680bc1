//! Priorities for queued computations and cache retention.
//!
//! A [`Priority`] is a plain signed integer; larger means more important.
//! [`combined()`] packs a caller-supplied class into the upper 32 bits and the
//! current Unix time (seconds) into the lower 32 bits, so combined priorities
//! compare by class first and by recency second.

use time::UtcDateTime;

pub type Priority = i64;

/// Work that should happen right now, ahead of everything else.
pub const PRIORITY_NOW: Priority = Priority::MAX;
/// Default class for background warming.
pub const PRIORITY_BACKGROUND: Priority = 0;

const TIME_BITS: u32 = 32;
const TIME_MASK: i64 = 0xFFFF_FFFF;

/// Combine a priority class with the current time.
///
/// Classes outside the `i32` range are clamped to it.
pub fn combined(class: i64) -> Priority {
    combined_at(class, UtcDateTime::now())
}

fn combined_at(class: i64, at: UtcDateTime) -> Priority {
    let class = class.clamp(i64::from(i32::MIN), i64::from(i32::MAX));
    (class << TIME_BITS) | (at.unix_timestamp() & TIME_MASK)
}

/// Recover the class from a combined priority.
pub fn class(priority: Priority) -> i64 {
    priority >> TIME_BITS
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use time::Duration;

    #[rstest]
    #[case(0, 1)]
    #[case(-1, 0)]
    #[case(1, 2)]
    #[case(-5, -4)]
    fn test_class_dominates_time(#[case] low: i64, #[case] high: i64) {
        let now = UtcDateTime::now();
        let later = now + Duration::days(365);
        assert!(combined_at(high, now) > combined_at(low, later));
    }

    #[test]
    fn test_recency_breaks_ties() {
        let now = UtcDateTime::now();
        let later = now + Duration::seconds(10);
        assert!(combined_at(3, later) > combined_at(3, now));
    }

    #[rstest]
    #[case(0)]
    #[case(7)]
    #[case(-3)]
    fn test_class_round_trip(#[case] value: i64) {
        assert_eq!(class(combined(value)), value);
    }

    #[test]
    fn test_out_of_range_class_is_clamped() {
        assert_eq!(class(combined(PRIORITY_NOW)), i64::from(i32::MAX));
        assert_eq!(class(combined(i64::MIN)), i64::from(i32::MIN));
    }

    #[test]
    fn test_now_outranks_everything() {
        assert!(PRIORITY_NOW > combined(i32::MAX as i64));
    }
}
