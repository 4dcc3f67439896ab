//! Parser for `auth.log` SSH authentication lines.

use std::sync::LazyLock;

use regex::Regex;

use crate::parsers::timestamp::extract_timestamp;
use crate::{Event, Severity, event_type};

static FAILED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"Failed password for (invalid user )?(?P<user>\w+) from (?P<ip>[\d.]+)").unwrap()
});

static SUCCESS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Accepted password for (?P<user>\w+) from (?P<ip>[\d.]+)").unwrap());

/// Parse an SSH authentication line into an event.
///
/// `Failed password` lines become `SSH_FAILED_LOGIN`/HIGH, `Accepted password`
/// lines `SSH_LOGIN_SUCCESS`/LOW. Anything else is skipped.
pub fn parse_auth_log(line: &str) -> Option<Event> {
    let timestamp = extract_timestamp(line);

    if line.contains("Failed password") {
        let caps = FAILED_RE.captures(line)?;
        let mut event = Event::new(
            timestamp,
            caps.name("ip")?.as_str(),
            "auth.log",
            event_type::SSH_FAILED_LOGIN,
            Severity::High,
            line,
        );
        event.destination_port = Some(22);
        event.protocol = Some("TCP".to_string());
        event.username = Some(caps.name("user")?.as_str().to_string());
        return Some(event);
    }

    if line.contains("Accepted password") {
        let caps = SUCCESS_RE.captures(line)?;
        let mut event = Event::new(
            timestamp,
            caps.name("ip")?.as_str(),
            "auth.log",
            event_type::SSH_LOGIN_SUCCESS,
            Severity::Low,
            line,
        );
        event.destination_port = Some(22);
        event.protocol = Some("TCP".to_string());
        event.username = Some(caps.name("user")?.as_str().to_string());
        return Some(event);
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failed_password() {
        let line = "Jan 15 10:00:00 host sshd[1234]: Failed password for admin from 192.168.1.100 port 52233 ssh2";
        let event = parse_auth_log(line).unwrap();
        assert_eq!(event.event_type, event_type::SSH_FAILED_LOGIN);
        assert_eq!(event.severity, Severity::High);
        assert_eq!(event.source_ip, "192.168.1.100");
        assert_eq!(event.username.as_deref(), Some("admin"));
        assert_eq!(event.destination_port, Some(22));
    }

    #[test]
    fn test_failed_password_invalid_user() {
        let line = "Jan 15 10:00:00 host sshd[1234]: Failed password for invalid user oracle from 10.0.0.9 port 4242 ssh2";
        let event = parse_auth_log(line).unwrap();
        assert_eq!(event.username.as_deref(), Some("oracle"));
        assert_eq!(event.source_ip, "10.0.0.9");
    }

    #[test]
    fn test_accepted_password() {
        let line = "Jan 15 10:00:00 host sshd[1234]: Accepted password for deploy from 192.168.1.5 port 9000 ssh2";
        let event = parse_auth_log(line).unwrap();
        assert_eq!(event.event_type, event_type::SSH_LOGIN_SUCCESS);
        assert_eq!(event.severity, Severity::Low);
    }

    #[test]
    fn test_unrelated_line_skipped() {
        assert!(parse_auth_log("Jan 15 10:00:00 host CRON[1]: session opened for root").is_none());
    }

    #[test]
    fn test_failed_line_without_ip_skipped() {
        assert!(parse_auth_log("sshd: Failed password for admin from nowhere").is_none());
    }
}
