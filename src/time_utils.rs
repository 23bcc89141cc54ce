// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Shared helpers for timezone conversion and date/time formatting.

use chrono::{DateTime, Duration, LocalResult, NaiveDateTime, TimeZone, Utc};
use chrono_tz::Tz;

/// Wire format for instants and civil datetimes.
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Resolve an IANA timezone name, falling back to `fallback`.
pub fn resolve_tz(name: Option<&str>, fallback: Tz) -> Tz {
    name.and_then(|n| n.parse().ok()).unwrap_or(fallback)
}

/// Convert a provider wall-clock time to UTC.
///
/// Ambiguous times (DST fall-back) take the earlier instant; nonexistent
/// times (spring-forward gap) are nudged past the gap.
pub fn to_utc(civil: NaiveDateTime, tz: Tz) -> DateTime<Utc> {
    match tz.from_local_datetime(&civil) {
        LocalResult::Single(dt) | LocalResult::Ambiguous(dt, _) => dt.with_timezone(&Utc),
        LocalResult::None => tz
            .from_local_datetime(&(civil + Duration::hours(1)))
            .earliest()
            .map(|dt| dt.with_timezone(&Utc))
            .unwrap_or_else(|| Utc.from_utc_datetime(&civil)),
    }
}

/// Convert an instant to the wall-clock time in `tz`.
pub fn to_local(instant: DateTime<Utc>, tz: Tz) -> NaiveDateTime {
    instant.with_timezone(&tz).naive_local()
}

/// Format a UTC instant as `YYYY-MM-DD HH:MM:SS`.
pub fn format_instant(dt: DateTime<Utc>) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// Format a civil datetime as `YYYY-MM-DD HH:MM:SS`.
pub fn format_civil(dt: NaiveDateTime) -> String {
    dt.format(DATETIME_FORMAT).to_string()
}

/// Parse `YYYY-MM-DD HH:MM:SS` as a UTC instant.
pub fn parse_instant(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT).map(|n| Utc.from_utc_datetime(&n))
}

/// Parse `YYYY-MM-DD HH:MM:SS` as a civil datetime.
pub fn parse_civil(s: &str) -> Result<NaiveDateTime, chrono::ParseError> {
    NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
}

/// Format a duration in seconds as zero-padded `HH:MM:SS`.
///
/// Hours may exceed 24 for multi-day efforts; negative inputs clamp to zero.
pub fn format_hms(total_secs: i64) -> String {
    let secs = total_secs.max(0);
    format!("{:02}:{:02}:{:02}", secs / 3600, (secs % 3600) / 60, secs % 60)
}

/// Parse `HH:MM:SS` (or `H:MM:SS`) into seconds.
pub fn parse_hms(s: &str) -> Result<i64, String> {
    let mut parts = s.split(':');
    let (h, m, sec) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(h), Some(m), Some(s), None) => (h, m, s),
        _ => return Err(format!("expected HH:MM:SS, got {s:?}")),
    };
    let parse = |v: &str| v.trim().parse::<i64>().map_err(|e| format!("{s:?}: {e}"));
    Ok(parse(h)? * 3600 + parse(m)? * 60 + parse(sec)?)
}
