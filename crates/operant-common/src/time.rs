//! Millisecond timestamp helpers
//!
//! All persisted timestamps are UTC milliseconds with a separate local
//! timezone offset, also in milliseconds.

use chrono::{Local, Offset, Utc};

/// Current UTC time in milliseconds since the epoch
pub fn utc_now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Local timezone offset from UTC in milliseconds
pub fn timezone_offset_ms() -> i64 {
    Local::now().offset().fix().local_minus_utc() as i64 * 1000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utc_now_is_recent() {
        let now = utc_now_ms();
        // Sometime after 2020-01-01 and before 2100
        assert!(now > 1_577_836_800_000);
        assert!(now < 4_102_444_800_000);
    }

    #[test]
    fn test_offset_is_whole_seconds() {
        assert_eq!(timezone_offset_ms() % 1000, 0);
    }
}
