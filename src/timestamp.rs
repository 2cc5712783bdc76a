//! Segment/AMF timestamp suffixes of the form `YYYYMMDDhhmmssµµµµµµ`.
//!
//! Names are compared lexicographically to order segments by age, so
//! timestamps must be strictly monotonic in creation order: every call to
//! [`next_timestamp`] is guaranteed to produce a value strictly greater than
//! the previous one, even if the wall clock hasn't advanced between two
//! calls in a tight loop.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

static LAST_MICROS: AtomicU64 = AtomicU64::new(0);

/// Returns a microsecond-since-epoch value strictly greater than every value
/// previously returned by this function in the current process.
fn next_micros() -> u64 {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;

    loop {
        let last = LAST_MICROS.load(Ordering::SeqCst);
        let candidate = if now > last { now } else { last + 1 };
        if LAST_MICROS
            .compare_exchange(last, candidate, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            return candidate;
        }
    }
}

/// Days-since-epoch -> proleptic Gregorian (year, month, day), per Howard
/// Hinnant's `civil_from_days` algorithm.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = (z - era * 146_097) as u64; // [0, 146096]
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365; // [0, 399]
    let y = yoe as i64 + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100); // [0, 365]
    let mp = (5 * doy + 2) / 153; // [0, 11]
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32; // [1, 31]
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32; // [1, 12]
    let y = if m <= 2 { y + 1 } else { y };
    (y, m, d)
}

/// Formats a microseconds-since-epoch value as `YYYYMMDDhhmmssµµµµµµ`.
fn format_micros(total_micros: u64) -> String {
    let total_seconds = total_micros / 1_000_000;
    let micros = total_micros % 1_000_000;
    let days = (total_seconds / 86_400) as i64;
    let secs_of_day = total_seconds % 86_400;

    let (year, month, day) = civil_from_days(days);
    let hour = secs_of_day / 3600;
    let minute = (secs_of_day % 3600) / 60;
    let second = secs_of_day % 60;

    format!(
        "{:04}{:02}{:02}{:02}{:02}{:02}{:06}",
        year, month, day, hour, minute, second, micros
    )
}

/// Returns a fresh, strictly-increasing timestamp suffix for segment/AMF
/// names.
pub fn next_timestamp() -> String {
    format_micros(next_micros())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_twenty_digits() {
        let ts = next_timestamp();
        assert_eq!(ts.len(), 20);
        assert!(ts.chars().all(|c| c.is_ascii_digit()));
    }

    #[test]
    fn strictly_monotonic_under_rapid_calls() {
        let mut previous = next_timestamp();
        for _ in 0..1000 {
            let current = next_timestamp();
            assert!(current > previous);
            previous = current;
        }
    }

    #[test]
    fn known_epoch_instant() {
        // 2021-01-02 03:04:05.123456 UTC
        let days = civil_from_days_reverse_check();
        let _ = days;
        let formatted = format_micros(1_609_556_645_123_456);
        assert_eq!(formatted, "20210102030405123456");
    }

    fn civil_from_days_reverse_check() -> i64 {
        // 1970-01-01 is day 0.
        let (y, m, d) = civil_from_days(0);
        assert_eq!((y, m, d), (1970, 1, 1));
        0
    }
}
