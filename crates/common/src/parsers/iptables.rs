//! Parser for iptables/netfilter kernel log lines.
//!
//! Example line:
//! `Jan  1 10:00:00 host kernel: [12345.123] IN=eth0 OUT= MAC=... SRC=192.168.1.1
//! DST=192.168.1.100 LEN=60 TTL=64 PROTO=TCP SPT=12345 DPT=22 SYN URGP=0`

use crate::parsers::netfilter::parse_fields;
use crate::parsers::timestamp::extract_timestamp;
use crate::{Event, Severity, event_type};

const SUSPICIOUS_PORTS: [u16; 6] = [22, 23, 1433, 3306, 3389, 5432];
const SQL_PORTS: [u16; 3] = [1433, 3306, 5432];

/// Parse an iptables/netfilter kernel log line. Requires both the `kernel:`
/// marker and a `SRC=` field.
pub fn parse_iptables_log(line: &str) -> Option<Event> {
    if !line.contains("kernel:") || !line.contains("SRC=") {
        return None;
    }

    let fields = parse_fields(line);
    let source_ip = fields.src.clone()?;
    let timestamp = extract_timestamp(line);

    let mut event_kind = event_type::IPTABLES_TRAFFIC;
    let mut severity = Severity::Low;

    if let Some(port) = fields.destination_port {
        if SUSPICIOUS_PORTS.contains(&port) {
            event_kind = event_type::SUSPICIOUS_PORT_ACCESS;
            severity = Severity::High;
        }
        if SQL_PORTS.contains(&port) {
            event_kind = event_type::SQL_ACCESS_ATTEMPT;
            severity = Severity::High;
        }
    }

    // SYN without ACK marks a fresh connection attempt.
    if fields.has_flag("SYN") && !fields.has_flag("ACK") {
        if event_kind == event_type::IPTABLES_TRAFFIC {
            event_kind = event_type::CONNECTION_ATTEMPT;
        }
        severity = severity.max(Severity::Medium);
    }

    if line.contains("DROP") || line.contains("REJECT") {
        event_kind = event_type::IPTABLES_BLOCKED;
        severity = Severity::Medium;
    }

    let mut event = Event::new(timestamp, source_ip, "iptables", event_kind, severity, line);
    event.destination_ip = fields.dst;
    event.source_port = fields.source_port;
    event.destination_port = fields.destination_port;
    event.protocol = fields.protocol;
    Some(event)
}
