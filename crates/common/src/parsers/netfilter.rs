//! `KEY=value` field scanner for UFW and netfilter kernel log payloads.
//!
//! Both formats carry the same token vocabulary
//! (`SRC= DST= SPT= DPT= PROTO= IN= OUT=` plus bare TCP flag words), so the
//! field walk is shared between the two parsers.

use nom::{
    IResult,
    bytes::complete::take_while1,
    character::complete::char,
    sequence::terminated,
};

/// Fields extracted from a netfilter-style log payload.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct NetfilterFields {
    pub src: Option<String>,
    pub dst: Option<String>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    pub interface_in: Option<String>,
    pub interface_out: Option<String>,
    pub tcp_flags: Vec<String>,
}

impl NetfilterFields {
    pub fn has_flag(&self, flag: &str) -> bool {
        self.tcp_flags.iter().any(|f| f == flag)
    }
}

const TCP_FLAGS: [&str; 6] = ["SYN", "ACK", "FIN", "RST", "PSH", "URG"];

fn key(input: &str) -> IResult<&str, &str> {
    terminated(take_while1(|c: char| c.is_ascii_uppercase()), char('='))(input)
}

/// Split one whitespace-separated token into `(KEY, value)` if it has the
/// `KEY=value` shape. A trailing empty value (e.g. `OUT=`) yields `""`.
fn key_value(token: &str) -> Option<(&str, &str)> {
    match key(token) {
        Ok((value, k)) => Some((k, value)),
        Err(_) => None,
    }
}

fn parse_port(value: &str) -> Option<u16> {
    value.parse::<u16>().ok()
}

fn looks_like_ipv4(value: &str) -> bool {
    !value.is_empty() && value.chars().all(|c| c.is_ascii_digit() || c == '.')
}

/// Walk every token of the line and collect the netfilter fields.
pub fn parse_fields(line: &str) -> NetfilterFields {
    let mut fields = NetfilterFields::default();

    for token in line.split_whitespace() {
        if TCP_FLAGS.contains(&token) {
            fields.tcp_flags.push(token.to_string());
            continue;
        }

        let Some((k, value)) = key_value(token) else {
            continue;
        };
        match k {
            "SRC" if looks_like_ipv4(value) => fields.src = Some(value.to_string()),
            "DST" if looks_like_ipv4(value) => fields.dst = Some(value.to_string()),
            "SPT" => fields.source_port = parse_port(value),
            "DPT" => fields.destination_port = parse_port(value),
            "PROTO" if !value.is_empty() => fields.protocol = Some(value.to_string()),
            "IN" if !value.is_empty() => fields.interface_in = Some(value.to_string()),
            "OUT" if !value.is_empty() => fields.interface_out = Some(value.to_string()),
            _ => {}
        }
    }

    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ufw_payload() {
        let line = "[UFW AUDIT] IN=enp0s8 OUT= SRC=192.168.56.1 DST=192.168.56.101 PROTO=TCP SPT=50520 DPT=22";
        let fields = parse_fields(line);
        assert_eq!(fields.src.as_deref(), Some("192.168.56.1"));
        assert_eq!(fields.dst.as_deref(), Some("192.168.56.101"));
        assert_eq!(fields.source_port, Some(50520));
        assert_eq!(fields.destination_port, Some(22));
        assert_eq!(fields.protocol.as_deref(), Some("TCP"));
        assert_eq!(fields.interface_in.as_deref(), Some("enp0s8"));
        assert_eq!(fields.interface_out, None);
    }

    #[test]
    fn test_parse_kernel_payload_with_flags() {
        let line = "Jan  1 10:00:00 host kernel: [12345.123] IN=eth0 OUT= MAC=aa:bb SRC=10.0.0.1 DST=10.0.0.2 LEN=60 TTL=64 PROTO=TCP SPT=12345 DPT=3306 SYN URGP=0";
        let fields = parse_fields(line);
        assert_eq!(fields.src.as_deref(), Some("10.0.0.1"));
        assert_eq!(fields.destination_port, Some(3306));
        assert!(fields.has_flag("SYN"));
        assert!(!fields.has_flag("ACK"));
    }

    #[test]
    fn test_missing_src_is_none() {
        let fields = parse_fields("kernel: DPT=80 PROTO=UDP");
        assert_eq!(fields.src, None);
        assert_eq!(fields.destination_port, Some(80));
    }

    #[test]
    fn test_non_numeric_src_rejected() {
        let fields = parse_fields("SRC=not-an-ip DPT=22");
        assert_eq!(fields.src, None);
    }
}
