//! Timestamp extraction for syslog-style log lines.
//!
//! Syslog timestamps carry no year; the current UTC year is assumed
//! (cross-year rollover is a documented non-goal). Lines without a parsable
//! timestamp fall back to "now" in UTC.

use std::sync::LazyLock;

use chrono::{DateTime, Datelike, TimeZone, Utc};
use regex::Regex;

static ISO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\d{4}-\d{2}-\d{2}T\d{2}:\d{2}:\d{2})").unwrap());

static SYSLOG_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([A-Za-z]{3})\s+(\d{1,2})\s+(\d{2}):(\d{2}):(\d{2})").unwrap());

fn month_number(abbr: &str) -> Option<u32> {
    match abbr {
        "Jan" => Some(1),
        "Feb" => Some(2),
        "Mar" => Some(3),
        "Apr" => Some(4),
        "May" => Some(5),
        "Jun" => Some(6),
        "Jul" => Some(7),
        "Aug" => Some(8),
        "Sep" => Some(9),
        "Oct" => Some(10),
        "Nov" => Some(11),
        "Dec" => Some(12),
        _ => None,
    }
}

/// Parse a timestamp out of a log line, trying ISO 8601 first and then the
/// syslog `MMM DD HH:MM:SS` form. Returns `None` when neither matches.
pub fn parse_line_timestamp(line: &str) -> Option<DateTime<Utc>> {
    if let Some(caps) = ISO_RE.captures(line) {
        let raw = caps.get(1)?.as_str();
        if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }

    if let Some(caps) = SYSLOG_RE.captures(line) {
        let month = month_number(caps.get(1)?.as_str())?;
        let day: u32 = caps.get(2)?.as_str().parse().ok()?;
        let hour: u32 = caps.get(3)?.as_str().parse().ok()?;
        let minute: u32 = caps.get(4)?.as_str().parse().ok()?;
        let second: u32 = caps.get(5)?.as_str().parse().ok()?;
        let year = Utc::now().year();
        return Utc
            .with_ymd_and_hms(year, month, day, hour, minute, second)
            .single();
    }

    None
}

/// Extract a timestamp with the now-UTC fallback contract.
pub fn extract_timestamp(line: &str) -> DateTime<Utc> {
    parse_line_timestamp(line).unwrap_or_else(Utc::now)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Timelike;

    #[test]
    fn test_parse_syslog_timestamp_assumes_current_year() {
        let ts = parse_line_timestamp("Jan  1 10:00:00 host sshd[1]: message").unwrap();
        assert_eq!(ts.year(), Utc::now().year());
        assert_eq!(ts.month(), 1);
        assert_eq!(ts.day(), 1);
        assert_eq!(ts.hour(), 10);
    }

    #[test]
    fn test_parse_iso_timestamp() {
        let ts = parse_line_timestamp("2024-02-29T23:59:58 service: hello").unwrap();
        assert_eq!(ts.year(), 2024);
        assert_eq!(ts.month(), 2);
        assert_eq!(ts.day(), 29);
    }

    #[test]
    fn test_fallback_to_now() {
        let before = Utc::now();
        let ts = extract_timestamp("no timestamp here at all");
        assert!(ts >= before);
    }

    #[test]
    fn test_invalid_day_rejected() {
        assert!(parse_line_timestamp("Feb 31 10:00:00 host").is_none());
    }
}
