//! Daily broadcast window in IST.

use std::time::Duration;

use chrono::{NaiveTime, Timelike};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::store::ScheduleWindow;

const DAY_SECS: i64 = 24 * 3600;

static TIME: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?i)^(\d{1,2})(?::(\d{2}))?\s*(am|pm)?$").unwrap());

/// Parse `"8:00 AM"`, `"8 pm"`, `"08:30PM"` or `"20:00"`.
pub fn parse_time(input: &str) -> Option<NaiveTime> {
    let caps = TIME.captures(input.trim())?;
    let hour: u32 = caps.get(1)?.as_str().parse().ok()?;
    let minute: u32 = match caps.get(2) {
        Some(m) => m.as_str().parse().ok()?,
        None => 0,
    };
    let hour = match caps.get(3).map(|m| m.as_str().to_ascii_lowercase()) {
        Some(meridiem) => {
            if !(1..=12).contains(&hour) {
                return None;
            }
            match (meridiem.as_str(), hour) {
                ("am", 12) => 0,
                ("am", h) => h,
                ("pm", 12) => 12,
                (_, h) => h + 12,
            }
        }
        None => hour,
    };
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// `8:00 AM` style rendering.
pub fn format_time(t: NaiveTime) -> String {
    t.format("%-I:%M %p").to_string()
}

/// A daily window, both ends inclusive at minute precision. A window whose
/// end is before its start crosses midnight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Schedule {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl Schedule {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            start: truncate_to_minute(start),
            end: truncate_to_minute(end),
        }
    }

    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self::new(parse_time(start)?, parse_time(end)?))
    }

    /// The stored window, if set and parseable.
    pub fn from_window(window: &ScheduleWindow) -> Option<Self> {
        Self::parse(&window.start, &window.end)
    }

    pub fn to_window(&self) -> ScheduleWindow {
        ScheduleWindow {
            start: format_time(self.start),
            end: format_time(self.end),
        }
    }

    pub fn is_active_at(&self, now: NaiveTime) -> bool {
        let t = truncate_to_minute(now);
        if self.start <= self.end {
            self.start <= t && t <= self.end
        } else {
            t >= self.start || t <= self.end
        }
    }

    /// Time until the next end of the window (the end minute included).
    pub fn remaining_today(&self, now: NaiveTime) -> Duration {
        let now_s = i64::from(now.num_seconds_from_midnight());
        let end_s = i64::from(self.end.num_seconds_from_midnight()) + 60;
        let mut diff = (end_s - now_s).rem_euclid(DAY_SECS);
        if diff == 0 {
            diff = DAY_SECS;
        }
        Duration::from_secs(diff as u64)
    }
}

fn truncate_to_minute(t: NaiveTime) -> NaiveTime {
    t.with_second(0)
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(t)
}
