//! Parser for UFW firewall audit lines.

use crate::parsers::netfilter::parse_fields;
use crate::parsers::timestamp::extract_timestamp;
use crate::{Event, Severity, event_type};

/// Destination ports that upgrade plain UFW traffic to a suspicious access event.
const SUSPICIOUS_PORTS: [u16; 4] = [22, 23, 1433, 3306];

/// Parse a UFW log line (`[UFW ...] ... SRC=... DPT=...`).
pub fn parse_ufw_log(line: &str) -> Option<Event> {
    if !line.contains("[UFW") {
        return None;
    }

    let fields = parse_fields(line);
    let source_ip = fields.src?;
    let timestamp = extract_timestamp(line);

    let (event_kind, severity) = match fields.destination_port {
        Some(port) if SUSPICIOUS_PORTS.contains(&port) => {
            (event_type::SUSPICIOUS_PORT_ACCESS, Severity::High)
        }
        _ => (event_type::UFW_TRAFFIC, Severity::Low),
    };

    let mut event = Event::new(timestamp, source_ip, "ufw.log", event_kind, severity, line);
    event.destination_ip = fields.dst;
    event.source_port = fields.source_port;
    event.destination_port = fields.destination_port;
    event.protocol = fields.protocol;
    Some(event)
}
