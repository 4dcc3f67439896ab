// Common library for the firewall log analysis service
// Contains the canonical event model, log parsers, and the event store

pub mod database;
pub mod error;
pub mod parsers;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Ordered severity scale assigned by detection rules.
///
/// The natural ordering is `Low < Medium < High < Critical`, which is what
/// threshold comparisons use. Dashboard and store sorting use [`Severity::sort_rank`]
/// instead, where `CRITICAL` sorts first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "UPPERCASE")]
#[sqlx(rename_all = "UPPERCASE")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }

    /// Sort rank used by the store and the dashboard: `CRITICAL=0 .. LOW=3`.
    pub fn sort_rank(&self) -> i64 {
        match self {
            Severity::Critical => 0,
            Severity::High => 1,
            Severity::Medium => 2,
            Severity::Low => 3,
        }
    }

    /// One rank down, saturating at `LOW`.
    pub fn step_down(&self) -> Severity {
        match self {
            Severity::Critical => Severity::High,
            Severity::High => Severity::Medium,
            Severity::Medium => Severity::Low,
            Severity::Low => Severity::Low,
        }
    }

    pub fn parse(s: &str) -> Option<Severity> {
        match s.trim().to_uppercase().as_str() {
            "LOW" => Some(Severity::Low),
            "MEDIUM" => Some(Severity::Medium),
            "HIGH" => Some(Severity::High),
            "CRITICAL" => Some(Severity::Critical),
            _ => None,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Known event type identifiers produced by the parsers.
pub mod event_type {
    pub const SSH_FAILED_LOGIN: &str = "SSH_FAILED_LOGIN";
    pub const SSH_LOGIN_SUCCESS: &str = "SSH_LOGIN_SUCCESS";
    pub const UFW_TRAFFIC: &str = "UFW_TRAFFIC";
    pub const SUSPICIOUS_PORT_ACCESS: &str = "SUSPICIOUS_PORT_ACCESS";
    pub const IPTABLES_TRAFFIC: &str = "IPTABLES_TRAFFIC";
    pub const IPTABLES_BLOCKED: &str = "IPTABLES_BLOCKED";
    pub const CONNECTION_ATTEMPT: &str = "CONNECTION_ATTEMPT";
    pub const SQL_ACCESS_ATTEMPT: &str = "SQL_ACCESS_ATTEMPT";
    pub const SQL_INJECTION_ATTEMPT: &str = "SQL_INJECTION_ATTEMPT";
    pub const SQL_AUTH_FAILED: &str = "SQL_AUTH_FAILED";
    pub const SQL_CONNECTION_ATTEMPT: &str = "SQL_CONNECTION_ATTEMPT";
    pub const SQL_PORT_ACCESS: &str = "SQL_PORT_ACCESS";
    pub const SYSLOG_ENTRY: &str = "SYSLOG_ENTRY";
    pub const SYSLOG_SECURITY_EVENT: &str = "SYSLOG_SECURITY_EVENT";
}

/// Canonical parsed record of one raw log line.
///
/// `timestamp` and `source_ip` are always present; a line that yields neither
/// is rejected by the parsers. Events are immutable once inserted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_ip: String,
    pub destination_ip: Option<String>,
    pub source_port: Option<u16>,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    pub log_source: String,
    pub event_type: String,
    pub severity: Severity,
    pub username: Option<String>,
    pub raw_log: String,
}

impl Event {
    pub fn new(
        timestamp: DateTime<Utc>,
        source_ip: impl Into<String>,
        log_source: &str,
        event_type: &str,
        severity: Severity,
        raw_log: &str,
    ) -> Self {
        Event {
            id: Uuid::new_v4().to_string(),
            timestamp,
            source_ip: source_ip.into(),
            destination_ip: None,
            source_port: None,
            destination_port: None,
            protocol: None,
            log_source: log_source.to_string(),
            event_type: event_type.to_string(),
            severity,
            username: None,
            raw_log: raw_log.trim().to_string(),
        }
    }

    /// Representative sample used for ML scoring and alert details.
    pub fn sample(&self) -> SampleEvent {
        SampleEvent {
            raw_log: self.raw_log.clone(),
            log_source: self.log_source.clone(),
            event_type: self.event_type.clone(),
        }
    }
}

/// Representative log line carried inside detections for ML scoring.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleEvent {
    pub raw_log: String,
    pub log_source: String,
    pub event_type: String,
}

/// Timestamp encoding used by the store.
///
/// Timestamps are persisted as fixed-width RFC 3339 UTC text so that string
/// comparison in SQL equals chronological comparison.
pub mod store_time {
    use super::*;

    pub fn encode(dt: &DateTime<Utc>) -> String {
        dt.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    pub fn decode(s: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(s).map(|dt| dt.with_timezone(&Utc))
    }
}
