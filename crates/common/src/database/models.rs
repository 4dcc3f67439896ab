//! Row types decoded from the store.

use crate::error::StoreError;
use crate::{Event, Severity, store_time};

#[derive(Debug, sqlx::FromRow)]
pub struct EventRow {
    pub id: String,
    pub timestamp: String,
    pub source_ip: String,
    pub destination_ip: Option<String>,
    pub source_port: Option<i64>,
    pub destination_port: Option<i64>,
    pub protocol: Option<String>,
    pub log_source: String,
    pub event_type: String,
    pub severity: Severity,
    pub username: Option<String>,
    pub raw_log: String,
}

impl TryFrom<EventRow> for Event {
    type Error = StoreError;

    fn try_from(row: EventRow) -> Result<Self, Self::Error> {
        Ok(Event {
            id: row.id,
            timestamp: store_time::decode(&row.timestamp)?,
            source_ip: row.source_ip,
            destination_ip: row.destination_ip,
            source_port: row.source_port.map(|p| p as u16),
            destination_port: row.destination_port.map(|p| p as u16),
            protocol: row.protocol,
            log_source: row.log_source,
            event_type: row.event_type,
            severity: row.severity,
            username: row.username,
            raw_log: row.raw_log,
        })
    }
}
