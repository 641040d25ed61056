use chrono::{DateTime, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike};

use crate::config::SchedulingConfig;
use crate::model::*;

use super::error::WindowError;

const NAIVE_FORMATS: [&str; 6] = [
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%dT%H:%M",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
];

/// Parse an ISO-8601 instant. Strings without an offset are read as
/// wall-clock time in `offset`.
pub fn parse_instant(raw: &str, offset: FixedOffset) -> Option<Ms> {
    let raw = raw.trim();
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.timestamp_millis());
    }
    NAIVE_FORMATS.iter().find_map(|fmt| {
        let naive = NaiveDateTime::parse_from_str(raw, fmt).ok()?;
        offset
            .from_local_datetime(&naive)
            .single()
            .map(|dt| dt.timestamp_millis())
    })
}

/// Parse a bare `YYYY-MM-DD` date.
pub fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw.trim(), "%Y-%m-%d").ok()
}

fn wall_clock(t: Ms, offset: FixedOffset) -> Option<DateTime<FixedOffset>> {
    DateTime::from_timestamp_millis(t).map(|dt| dt.with_timezone(&offset))
}

/// 00:00:00.000 of `date` in `offset`.
pub fn day_start(date: NaiveDate, offset: FixedOffset) -> Option<Ms> {
    offset
        .from_local_datetime(&date.and_hms_opt(0, 0, 0)?)
        .single()
        .map(|dt| dt.timestamp_millis())
}

/// 23:59:59.999 of `date` in `offset`.
pub fn day_end(date: NaiveDate, offset: FixedOffset) -> Option<Ms> {
    day_start(date, offset).map(|start| start + DAY_MS - 1)
}

/// Calendar date of `t` in `offset`.
pub fn date_of(t: Ms, offset: FixedOffset) -> Option<NaiveDate> {
    wall_clock(t, offset).map(|dt| dt.date_naive())
}

/// Parse both bounds of a proposed window.
pub fn parse_window(start: &str, end: &str, offset: FixedOffset) -> Result<(Ms, Ms), WindowError> {
    match (parse_instant(start, offset), parse_instant(end, offset)) {
        (Some(s), Some(e)) => Ok((s, e)),
        _ => Err(WindowError::Malformed),
    }
}

/// Parse and check a window for a new reservation.
pub fn validate_window(
    start: &str,
    end: &str,
    now: Ms,
    config: &SchedulingConfig,
) -> Result<Span, WindowError> {
    let (start, end) = parse_window(start, end, config.utc_offset)?;
    check_window(start, end, now, config, true)
}

/// Apply the window rules in order; the first failure wins.
///
/// `check_past` is false when an update keeps its stored start, so a
/// reservation that already began can still have its end moved.
pub fn check_window(
    start: Ms,
    end: Ms,
    now: Ms,
    config: &SchedulingConfig,
    check_past: bool,
) -> Result<Span, WindowError> {
    if check_past && start < now {
        return Err(WindowError::StartInPast);
    }
    if start >= end {
        return Err(WindowError::EndBeforeStart);
    }
    let advance = start - now;
    if advance < config.min_advance_ms() {
        return Err(WindowError::InsufficientAdvance(config.min_advance_minutes));
    }
    let span = Span::new(start, end);
    if span.duration_ms() > config.max_duration_ms() {
        return Err(WindowError::DurationExceeded(config.max_duration_hours));
    }
    if let Some(horizon) = config.max_advance_ms()
        && advance > horizon
    {
        return Err(WindowError::TooFarInAdvance(config.max_advance_days));
    }
    if config.enforce_business_hours && !within_business_hours(&span, config) {
        return Err(WindowError::OutsideBusinessHours {
            start: config.business_start,
            end: config.business_end,
        });
    }
    Ok(span)
}

/// The start hour must fall in `[business_start, business_end)` and the
/// end's own wall-clock time must not pass `business_end:00`, judged to
/// the minute. The calendar day of the end is not considered.
fn within_business_hours(span: &Span, config: &SchedulingConfig) -> bool {
    let offset = config.utc_offset;
    let (Some(start), Some(end)) = (wall_clock(span.start, offset), wall_clock(span.end, offset)) else {
        return false;
    };
    let hour = start.hour();
    if hour < config.business_start || hour >= config.business_end {
        return false;
    }
    let end_hour = end.hour();
    !(end_hour > config.business_end || (end_hour == config.business_end && end.minute() > 0))
}
