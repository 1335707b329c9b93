//! Time helpers. Schedules and user-facing timestamps are in IST (UTC+05:30).

use chrono::{DateTime, FixedOffset, TimeZone, Utc};

/// Offset of Indian Standard Time from UTC, in seconds.
pub const IST_OFFSET_SECS: i32 = 5 * 3600 + 30 * 60;

/// The fixed IST offset.
pub fn ist() -> FixedOffset {
    match FixedOffset::east_opt(IST_OFFSET_SECS) {
        Some(tz) => tz,
        None => unreachable!("IST offset is within +/-24h"),
    }
}

/// Current wall-clock time in IST.
pub fn now_ist() -> DateTime<FixedOffset> {
    Utc::now().with_timezone(&ist())
}

/// Current Unix timestamp in seconds.
pub fn now_ts() -> i64 {
    Utc::now().timestamp()
}

/// Format a Unix timestamp as `19 Oct 2026, 08:05 PM` in IST.
pub fn format_ist(ts: i64) -> String {
    match ist().timestamp_opt(ts, 0).single() {
        Some(dt) => dt.format("%d %b %Y, %I:%M %p").to_string(),
        None => "-".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ist_offset() {
        assert_eq!(ist().local_minus_utc(), 19_800);
    }

    #[test]
    fn test_format_ist_epoch() {
        // 1970-01-01 00:00 UTC is 05:30 IST
        assert_eq!(format_ist(0), "01 Jan 1970, 05:30 AM");
    }

    #[test]
    fn test_now_ist_matches_utc_instant() {
        let a = now_ist().timestamp();
        let b = now_ts();
        assert!((a - b).abs() <= 1);
    }
}
