//! Parser for generic syslog lines.
//!
//! Tries SSH patterns first, then SQL patterns, and finally emits a generic
//! `SYSLOG_ENTRY` for any line that at least carries an IP address. Security
//! keywords upgrade the generic entry to `SYSLOG_SECURITY_EVENT`.

use std::sync::LazyLock;

use regex::Regex;

use crate::parsers::timestamp::extract_timestamp;
use crate::{Event, Severity, event_type};

static IP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\b(?P<ip>(?:\d{1,3}\.){3}\d{1,3})\b").unwrap());

static SSH_FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Failed password for (?:invalid user )?(?P<user>\w+) from (?P<ip>[\d.]+)").unwrap()
});

static SSH_ACCEPTED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Accepted password for (?P<user>\w+) from (?P<ip>[\d.]+)").unwrap());

static SSH_INVALID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Invalid user (?P<user>\w+) from (?P<ip>[\d.]+)").unwrap());

static SQL_FAILURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:mysql|postgres|mssql|sql).*?(?:connection|login|auth).*?(?:failed|denied|error)")
        .unwrap()
});

static SQL_PORT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)port\s+(?:1433|3306|5432)").unwrap());

const SECURITY_KEYWORDS: [&str; 7] = [
    "denied", "blocked", "rejected", "failed", "error", "attack", "intrusion",
];

fn ssh_event(line: &str) -> Option<Event> {
    for re in [&*SSH_FAILED_RE, &*SSH_ACCEPTED_RE, &*SSH_INVALID_RE] {
        let Some(caps) = re.captures(line) else {
            continue;
        };
        let ip = caps.name("ip")?.as_str();
        let username = caps.name("user").map(|m| m.as_str().to_string());
        let timestamp = extract_timestamp(line);

        let (event_kind, severity) = if line.contains("Accepted password") {
            (event_type::SSH_LOGIN_SUCCESS, Severity::Low)
        } else {
            (event_type::SSH_FAILED_LOGIN, Severity::High)
        };

        let mut event = Event::new(timestamp, ip, "syslog", event_kind, severity, line);
        event.destination_port = Some(22);
        event.protocol = Some("TCP".to_string());
        event.username = username;
        return Some(event);
    }
    None
}

fn sql_event(line: &str) -> Option<Event> {
    if !SQL_FAILURE_RE.is_match(line) && !SQL_PORT_RE.is_match(line) {
        return None;
    }

    let ip_match = IP_RE.captures(line)?.name("ip")?;
    let ip = ip_match.as_str().to_string();
    let timestamp = extract_timestamp(line);

    let destination_port = super::port_near_ip(line, ip_match.end())
        .or_else(|| {
            let lower = line.to_lowercase();
            if line.contains("1433") || lower.contains("mssql") {
                Some(1433)
            } else if line.contains("3306") || lower.contains("mysql") {
                Some(3306)
            } else if line.contains("5432") || lower.contains("postgres") {
                Some(5432)
            } else {
                None
            }
        });

    let lower = line.to_lowercase();
    let (event_kind, severity) =
        if lower.contains("failed") || lower.contains("denied") || lower.contains("error") {
            (event_type::SQL_AUTH_FAILED, Severity::High)
        } else {
            (event_type::SQL_ACCESS_ATTEMPT, Severity::High)
        };

    let mut event = Event::new(timestamp, ip, "syslog", event_kind, severity, line);
    event.destination_port = Some(destination_port.unwrap_or(1433));
    event.protocol = Some("TCP".to_string());
    Some(event)
}

/// Parse a generic syslog line. Returns `None` only when no IP address can be
/// extracted at all.
pub fn parse_syslog(line: &str) -> Option<Event> {
    if line.trim().is_empty() {
        return None;
    }

    if let Some(event) = ssh_event(line) {
        return Some(event);
    }
    if let Some(event) = sql_event(line) {
        return Some(event);
    }

    let ip_match = IP_RE.captures(line)?.name("ip")?;
    let ip = ip_match.as_str().to_string();
    let timestamp = extract_timestamp(line);
    let destination_port = super::port_near_ip(line, ip_match.end());

    let lower = line.to_lowercase();
    let (event_kind, severity) = if SECURITY_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        (event_type::SYSLOG_SECURITY_EVENT, Severity::Medium)
    } else {
        (event_type::SYSLOG_ENTRY, Severity::Low)
    };

    let mut event = Event::new(timestamp, ip, "syslog", event_kind, severity, line);
    event.destination_port = destination_port;
    Some(event)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssh_failed_via_syslog() {
        let line = "Jan  2 03:04:05 host sshd[9]: Failed password for root from 203.0.113.9 port 2200 ssh2";
        let event = parse_syslog(line).unwrap();
        assert_eq!(event.event_type, event_type::SSH_FAILED_LOGIN);
        assert_eq!(event.username.as_deref(), Some("root"));
    }

    #[test]
    fn test_invalid_user_is_failed_login() {
        let line = "Jan  2 03:04:05 host sshd[9]: Invalid user postgres from 203.0.113.9";
        let event = parse_syslog(line).unwrap();
        assert_eq!(event.event_type, event_type::SSH_FAILED_LOGIN);
        assert_eq!(event.severity, Severity::High);
    }

    #[test]
    fn test_generic_entry_with_ip() {
        let line = "Jan  2 03:04:05 host dhclient: lease renewed for 192.0.2.10";
        let event = parse_syslog(line).unwrap();
        assert_eq!(event.event_type, event_type::SYSLOG_ENTRY);
        assert_eq!(event.severity, Severity::Low);
    }

    #[test]
    fn test_security_keyword_upgrade() {
        let line = "Jan  2 03:04:05 host fw: connection from 192.0.2.10 denied by policy";
        let event = parse_syslog(line).unwrap();
        assert_eq!(event.event_type, event_type::SYSLOG_SECURITY_EVENT);
        assert_eq!(event.severity, Severity::Medium);
    }

    #[test]
    fn test_line_without_ip_skipped() {
        assert!(parse_syslog("Jan  2 03:04:05 host cron: job finished").is_none());
    }
}
