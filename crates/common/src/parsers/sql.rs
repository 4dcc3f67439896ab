//! SQL attack heuristics over free-form log text.
//!
//! This parser only claims lines that show an actual SQL signal: an injection
//! pattern, a SQL authentication failure, a SQL connection mention, or a SQL
//! port mention. Everything else falls through to the other parsers.

use std::sync::LazyLock;

use regex::Regex;

use crate::parsers::timestamp::extract_timestamp;
use crate::{Event, Severity, event_type};

static SQL_INJECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:union|select|insert|delete|update|drop|exec|execute).*?(?:--|;|/\*|\*/)")
        .unwrap()
});

static SQL_FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?:failed|denied|error|unauthorized).*?(?:login|connection|authentication).*?(?:mysql|postgres|mssql|sql)",
    )
    .unwrap()
});

static SQL_CONNECTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:mysql|postgres|mssql|sql server).*?(?:connection|login|auth).*?from\s+[\d.]+")
        .unwrap()
});

static SQL_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?:1433|3306|5432|1521)").unwrap());

static IP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?P<ip>(?:\d{1,3}\.){3}\d{1,3})\b").unwrap());

/// Infer a destination port from SQL product mentions in the line.
fn infer_sql_port(line: &str) -> Option<u16> {
    let lower = line.to_lowercase();
    if line.contains("1433") || lower.contains("mssql") || lower.contains("sql server") {
        Some(1433)
    } else if line.contains("3306") || lower.contains("mysql") {
        Some(3306)
    } else if line.contains("5432") || lower.contains("postgres") {
        Some(5432)
    } else if line.contains("1521") || lower.contains("oracle") {
        Some(1521)
    } else {
        None
    }
}

/// Parse a SQL-related log line.
pub fn parse_sql_log(line: &str) -> Option<Event> {
    if line.trim().is_empty() {
        return None;
    }

    let (event_kind, severity) = if SQL_INJECTION_RE.is_match(line) {
        (event_type::SQL_INJECTION_ATTEMPT, Severity::Critical)
    } else if SQL_FAILED_RE.is_match(line) {
        (event_type::SQL_AUTH_FAILED, Severity::High)
    } else if SQL_CONNECTION_RE.is_match(line) {
        (event_type::SQL_CONNECTION_ATTEMPT, Severity::Medium)
    } else if SQL_PORT_RE.is_match(line) {
        (event_type::SQL_PORT_ACCESS, Severity::High)
    } else {
        return None;
    };

    let ip_match = IP_RE.captures(line)?.name("ip")?;
    let source_ip = ip_match.as_str().to_string();
    let timestamp = extract_timestamp(line);

    let destination_port =
        super::port_near_ip(line, ip_match.end()).or_else(|| infer_sql_port(line));

    let mut event = Event::new(timestamp, source_ip, "sql.log", event_kind, severity, line);
    event.destination_port = Some(destination_port.unwrap_or(1433));
    event.protocol = Some("TCP".to_string());
    Some(event)
}
