//! Time and duration sanity checks.
//!
//! Everything that reaches storage or user-facing output passes through here.
//! Impossible values (unset timestamps, 87:00 clocks, negative or day-long
//! blocks, >100% efficiency) are replaced with a bounded value or a placeholder.

use chrono::{DateTime, Datelike, Duration, Local, Timelike, Utc};

pub const PLACEHOLDER: &str = "--:--";
pub const MIN_YEAR: i32 = 1900;
pub const MAX_YEAR: i32 = 2100;

pub fn is_valid_time(t: &DateTime<Utc>) -> bool {
    if t.timestamp() == 0 && t.timestamp_subsec_nanos() == 0 {
        return false;
    }
    let year = t.year();
    (MIN_YEAR..=MAX_YEAR).contains(&year) && is_valid_clock(t.hour(), t.minute())
}

pub fn is_valid_clock(hour: u32, minute: u32) -> bool {
    hour <= 23 && minute <= 59
}

pub fn is_valid_duration(start: &DateTime<Utc>, end: &DateTime<Utc>, max: Duration) -> bool {
    end >= start && (*end - *start) <= max
}

/// Formats `t` with a chrono `strftime` layout, or returns [`PLACEHOLDER`].
pub fn safe_format(t: Option<&DateTime<Utc>>, layout: &str) -> String {
    match t {
        Some(t) if is_valid_time(t) => t.format(layout).to_string(),
        _ => PLACEHOLDER.to_string(),
    }
}

/// Like [`safe_format`], rendered in the local timezone.
pub fn safe_format_local(t: Option<&DateTime<Utc>>, layout: &str) -> String {
    match t {
        Some(t) if is_valid_time(t) => t.with_timezone(&Local).format(layout).to_string(),
        _ => PLACEHOLDER.to_string(),
    }
}

/// `HH:MM` for raw clock components, or [`PLACEHOLDER`] when out of range.
pub fn safe_clock(hour: u32, minute: u32) -> String {
    if is_valid_clock(hour, minute) {
        format!("{:02}:{:02}", hour, minute)
    } else {
        PLACEHOLDER.to_string()
    }
}

/// Clamps a percentage into `[0, 100]`. NaN becomes 0.
pub fn clamp_efficiency(percent: f64) -> f64 {
    if percent.is_nan() {
        return 0.0;
    }
    percent.clamp(0.0, 100.0)
}

/// `work / schedule` as a clamped percentage. A non-positive schedule yields 0.
pub fn efficiency_percent(work_secs: i64, schedule_secs: i64) -> f64 {
    if schedule_secs <= 0 || work_secs <= 0 {
        return 0.0;
    }
    clamp_efficiency(work_secs as f64 / schedule_secs as f64 * 100.0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundedDuration {
    pub end: DateTime<Utc>,
    pub seconds: i64,
    /// True when `end` was moved to satisfy the bounds.
    pub adjusted: bool,
}

/// Forces `start <= end <= start + max`.
///
/// An end before the start collapses to a zero-length span; a span longer than
/// `max` is truncated.
pub fn bound_duration(start: DateTime<Utc>, end: DateTime<Utc>, max: Duration) -> BoundedDuration {
    if end < start {
        return BoundedDuration {
            end: start,
            seconds: 0,
            adjusted: true,
        };
    }
    if end - start > max {
        return BoundedDuration {
            end: start + max,
            seconds: max.num_seconds(),
            adjusted: true,
        };
    }
    BoundedDuration {
        end,
        seconds: (end - start).num_seconds(),
        adjusted: false,
    }
}

/// Renders seconds as `"3h 05m"` or `"42m"`. Negative input renders as `"0m"`.
pub fn format_duration_secs(seconds: i64) -> String {
    let seconds = seconds.max(0);
    let hours = seconds / 3600;
    let minutes = (seconds % 3600) / 60;
    if hours > 0 {
        format!("{}h {:02}m", hours, minutes)
    } else {
        format!("{}m", minutes)
    }
}
