// Log parser module
// One parser per supported format plus the dispatcher that routes raw lines.

pub mod auth;
pub mod iptables;
pub mod netfilter;
pub mod sql;
pub mod syslog;
pub mod timestamp;
pub mod ufw;

use std::sync::LazyLock;

use regex::Regex;

use crate::Event;

pub use auth::parse_auth_log;
pub use iptables::parse_iptables_log;
pub use sql::parse_sql_log;
pub use syslog::parse_syslog;
pub use ufw::parse_ufw_log;

static PORT_WORD_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)port\s+(?P<port>\d{1,5})\b").unwrap());

/// Extract a destination port mentioned next to an IP address (`ip:port`) or
/// as a `port N` phrase. `ip_end` is the byte offset just past the IP match,
/// which keeps `HH:MM:SS` timestamp fragments from being read as ports.
pub(crate) fn port_near_ip(line: &str, ip_end: usize) -> Option<u16> {
    let rest = &line[ip_end..];
    if let Some(stripped) = rest.strip_prefix(':') {
        let digits: String = stripped.chars().take_while(|c| c.is_ascii_digit()).collect();
        if !digits.is_empty() {
            if let Ok(port) = digits.parse::<u16>() {
                return Some(port);
            }
        }
    }
    PORT_WORD_RE
        .captures(line)
        .and_then(|caps| caps.name("port")?.as_str().parse::<u16>().ok())
}

/// Parse a raw log line with the appropriate parser.
///
/// Routing order: the parser keyed to the `log_source` hint first, then
/// content sniffing (SQL heuristics, auth markers, UFW tag, kernel netfilter
/// markers), and finally the generic syslog parser. Lines nothing can parse
/// are silently dropped.
pub fn parse_line(line: &str, log_source: Option<&str>) -> Option<Event> {
    if line.trim().is_empty() {
        return None;
    }

    if let Some(source) = log_source {
        let source = source.to_lowercase();
        let hinted = if source.contains("auth") {
            parse_auth_log(line)
        } else if source.contains("ufw") {
            parse_ufw_log(line)
        } else if source.contains("iptables") || source.contains("netfilter") || source.contains("kern") {
            parse_iptables_log(line)
        } else if source.contains("sql") {
            parse_sql_log(line)
        } else if source.contains("syslog") {
            parse_syslog(line)
        } else {
            None
        };
        if hinted.is_some() {
            return hinted;
        }
    }

    if let Some(event) = parse_sql_log(line) {
        return Some(event);
    }
    if line.contains("Failed password") || line.contains("Accepted password") {
        if let Some(event) = parse_auth_log(line) {
            return Some(event);
        }
    }
    if line.contains("[UFW") {
        if let Some(event) = parse_ufw_log(line) {
            return Some(event);
        }
    }
    if line.contains("kernel:") && line.contains("SRC=") {
        if let Some(event) = parse_iptables_log(line) {
            return Some(event);
        }
    }

    parse_syslog(line)
}

/// Parse a batch of lines, dropping the ones no parser claims.
pub fn parse_lines(lines: &[String], log_source: Option<&str>) -> Vec<Event> {
    lines
        .iter()
        .filter_map(|line| parse_line(line, log_source))
        .collect()
}
