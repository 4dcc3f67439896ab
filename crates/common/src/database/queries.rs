//! Query layer over the event store.
//!
//! All functions take the pool by reference; filters are assembled with
//! `QueryBuilder` so every value is bound, never interpolated.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{QueryBuilder, Sqlite};

use super::DbPool;
use super::models::EventRow;
use crate::error::StoreError;
use crate::{Event, store_time};

const EVENT_COLUMNS: &str = "id, timestamp, source_ip, destination_ip, source_port, \
     destination_port, protocol, log_source, event_type, severity, username, raw_log";

/// Filters understood by [`find_events`].
#[derive(Debug, Default, Clone)]
pub struct EventFilter {
    pub source_ip: Option<String>,
    pub severity: Option<crate::Severity>,
    pub event_type: Option<String>,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    pub log_source: Option<String>,
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
    /// Substring match against `source_ip`, `raw_log`, or `username`.
    pub search: Option<String>,
}

/// Sortable columns for log browsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortField {
    Timestamp,
    Severity,
    SourceIp,
    EventType,
}

impl SortField {
    pub fn parse(s: &str) -> SortField {
        match s {
            "severity" => SortField::Severity,
            "source_ip" => SortField::SourceIp,
            "event_type" => SortField::EventType,
            _ => SortField::Timestamp,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EventPage {
    pub events: Vec<Event>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
    pub total_pages: i64,
}

/// Append WHERE clauses for the filter to a builder that already names the table.
fn push_filters(builder: &mut QueryBuilder<'_, Sqlite>, filter: &EventFilter) {
    builder.push(" WHERE 1=1");
    if let Some(ip) = &filter.source_ip {
        builder.push(" AND source_ip = ").push_bind(ip.clone());
    }
    if let Some(severity) = &filter.severity {
        builder.push(" AND severity = ").push_bind(severity.as_str());
    }
    if let Some(event_type) = &filter.event_type {
        builder.push(" AND event_type = ").push_bind(event_type.clone());
    }
    if let Some(port) = filter.destination_port {
        builder.push(" AND destination_port = ").push_bind(port as i64);
    }
    if let Some(protocol) = &filter.protocol {
        builder.push(" AND protocol = ").push_bind(protocol.clone());
    }
    if let Some(log_source) = &filter.log_source {
        builder.push(" AND log_source = ").push_bind(log_source.clone());
    }
    if let Some(start) = &filter.start {
        builder.push(" AND timestamp >= ").push_bind(store_time::encode(start));
    }
    if let Some(end) = &filter.end {
        builder.push(" AND timestamp <= ").push_bind(store_time::encode(end));
    }
    if let Some(search) = &filter.search {
        let pattern = format!("%{}%", search);
        builder
            .push(" AND (source_ip LIKE ")
            .push_bind(pattern.clone())
            .push(" OR raw_log LIKE ")
            .push_bind(pattern.clone())
            .push(" OR username LIKE ")
            .push_bind(pattern)
            .push(")");
    }
}

/// Append a batch of events in one transaction. Batches are atomic: either
/// every event in the slice becomes visible or none does.
pub async fn insert_events(pool: &DbPool, events: &[Event]) -> Result<u64, StoreError> {
    if events.is_empty() {
        return Ok(0);
    }

    let mut tx = pool.begin().await?;
    for event in events {
        sqlx::query(
            "INSERT INTO events (id, timestamp, source_ip, destination_ip, source_port, \
             destination_port, protocol, log_source, event_type, severity, severity_rank, \
             username, raw_log) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&event.id)
        .bind(store_time::encode(&event.timestamp))
        .bind(&event.source_ip)
        .bind(&event.destination_ip)
        .bind(event.source_port.map(|p| p as i64))
        .bind(event.destination_port.map(|p| p as i64))
        .bind(&event.protocol)
        .bind(&event.log_source)
        .bind(&event.event_type)
        .bind(event.severity.as_str())
        .bind(event.severity.sort_rank())
        .bind(&event.username)
        .bind(&event.raw_log)
        .execute(&mut *tx)
        .await?;
    }
    tx.commit().await?;
    Ok(events.len() as u64)
}

/// Paginated, filtered, sorted log browsing. Severity sorting uses the custom
/// rank order (`CRITICAL` first), not lexicographic order.
pub async fn find_events(
    pool: &DbPool,
    filter: &EventFilter,
    sort_by: SortField,
    descending: bool,
    page: u32,
    page_size: u32,
) -> Result<EventPage, StoreError> {
    let page = page.max(1);
    let page_size = page_size.clamp(1, 500);

    let mut count_builder = QueryBuilder::new("SELECT COUNT(*) FROM events");
    push_filters(&mut count_builder, filter);
    let total: i64 = count_builder.build_query_scalar().fetch_one(pool).await?;

    let mut builder = QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events"));
    push_filters(&mut builder, filter);
    builder.push(match (sort_by, descending) {
        (SortField::Timestamp, true) => " ORDER BY timestamp DESC",
        (SortField::Timestamp, false) => " ORDER BY timestamp ASC",
        (SortField::Severity, _) => " ORDER BY severity_rank ASC, timestamp DESC",
        (SortField::SourceIp, _) => " ORDER BY source_ip ASC, timestamp DESC",
        (SortField::EventType, _) => " ORDER BY event_type ASC, timestamp DESC",
    });
    builder
        .push(" LIMIT ")
        .push_bind(page_size as i64)
        .push(" OFFSET ")
        .push_bind(((page - 1) * page_size) as i64);

    let rows: Vec<EventRow> = builder.build_query_as().fetch_all(pool).await?;
    let events = rows
        .into_iter()
        .map(Event::try_from)
        .collect::<Result<Vec<_>, _>>()?;

    let total_pages = (total + page_size as i64 - 1) / page_size as i64;
    Ok(EventPage {
        events,
        total,
        page,
        page_size,
        total_pages,
    })
}

/// Filter for detector scans.
#[derive(Debug, Clone)]
pub struct ScanFilter {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub event_type: Option<String>,
    pub source_ip: Option<String>,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    /// Restrict to events that carry a destination port (port-scan detection).
    pub require_destination_port: bool,
}

impl ScanFilter {
    pub fn range(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        ScanFilter {
            start,
            end,
            event_type: None,
            source_ip: None,
            destination_port: None,
            protocol: None,
            require_destination_port: false,
        }
    }
}

/// Scan a time slice ordered by timestamp ascending, the shape every detector
/// consumes.
pub async fn scan_range(pool: &DbPool, filter: &ScanFilter) -> Result<Vec<Event>, StoreError> {
    let mut builder = QueryBuilder::new(format!("SELECT {EVENT_COLUMNS} FROM events"));
    builder
        .push(" WHERE timestamp >= ")
        .push_bind(store_time::encode(&filter.start))
        .push(" AND timestamp <= ")
        .push_bind(store_time::encode(&filter.end));
    if let Some(event_type) = &filter.event_type {
        builder.push(" AND event_type = ").push_bind(event_type.clone());
    }
    if let Some(ip) = &filter.source_ip {
        builder.push(" AND source_ip = ").push_bind(ip.clone());
    }
    if let Some(port) = filter.destination_port {
        builder.push(" AND destination_port = ").push_bind(port as i64);
    }
    if let Some(protocol) = &filter.protocol {
        builder.push(" AND protocol = ").push_bind(protocol.clone());
    }
    if filter.require_destination_port {
        builder.push(" AND destination_port IS NOT NULL");
    }
    builder.push(" ORDER BY timestamp ASC");

    let rows: Vec<EventRow> = builder.build_query_as().fetch_all(pool).await?;
    rows.into_iter().map(Event::try_from).collect()
}

/// Most recent events, newest first. Used to assemble training sets.
pub async fn recent_events(pool: &DbPool, limit: u32) -> Result<Vec<Event>, StoreError> {
    let rows: Vec<EventRow> = sqlx::query_as(&format!(
        "SELECT {EVENT_COLUMNS} FROM events ORDER BY timestamp DESC LIMIT ?"
    ))
    .bind(limit as i64)
    .fetch_all(pool)
    .await?;
    rows.into_iter().map(Event::try_from).collect()
}

/// Most recent event for a source IP, used as ML context.
pub async fn latest_event_for_ip(pool: &DbPool, ip: &str) -> Result<Option<Event>, StoreError> {
    let row: Option<EventRow> = sqlx::query_as(&format!(
        "SELECT {EVENT_COLUMNS} FROM events WHERE source_ip = ? ORDER BY timestamp DESC LIMIT 1"
    ))
    .bind(ip)
    .fetch_optional(pool)
    .await?;
    row.map(Event::try_from).transpose()
}

#[derive(Debug, Serialize)]
pub struct TopIpEntry {
    pub ip: String,
    pub count: i64,
    pub severity_breakdown: BTreeMap<String, i64>,
}

#[derive(Debug, Serialize)]
pub struct TopPortEntry {
    pub port: i64,
    pub count: i64,
    pub severity_breakdown: BTreeMap<String, i64>,
}

/// Top-N source IPs by event count with a per-severity breakdown.
pub async fn top_source_ips(
    pool: &DbPool,
    limit: u32,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<Vec<TopIpEntry>, StoreError> {
    let mut builder = QueryBuilder::new("SELECT source_ip, COUNT(*) AS c FROM events WHERE 1=1");
    if let Some(start) = &start {
        builder.push(" AND timestamp >= ").push_bind(store_time::encode(start));
    }
    if let Some(end) = &end {
        builder.push(" AND timestamp <= ").push_bind(store_time::encode(end));
    }
    builder
        .push(" GROUP BY source_ip ORDER BY c DESC LIMIT ")
        .push_bind(limit as i64);

    let top: Vec<(String, i64)> = builder.build_query_as().fetch_all(pool).await?;

    let mut entries = Vec::with_capacity(top.len());
    for (ip, count) in top {
        let mut breakdown_builder = QueryBuilder::new(
            "SELECT severity, COUNT(*) FROM events WHERE source_ip = ",
        );
        breakdown_builder.push_bind(ip.clone());
        if let Some(start) = &start {
            breakdown_builder
                .push(" AND timestamp >= ")
                .push_bind(store_time::encode(start));
        }
        if let Some(end) = &end {
            breakdown_builder
                .push(" AND timestamp <= ")
                .push_bind(store_time::encode(end));
        }
        breakdown_builder.push(" GROUP BY severity");
        let rows: Vec<(String, i64)> = breakdown_builder.build_query_as().fetch_all(pool).await?;
        entries.push(TopIpEntry {
            ip,
            count,
            severity_breakdown: rows.into_iter().collect(),
        });
    }
    Ok(entries)
}

/// Top-N destination ports by event count with a per-severity breakdown.
pub async fn top_destination_ports(
    pool: &DbPool,
    limit: u32,
    start: Option<DateTime<Utc>>,
    end: Option<DateTime<Utc>>,
) -> Result<Vec<TopPortEntry>, StoreError> {
    let mut builder = QueryBuilder::new(
        "SELECT destination_port, COUNT(*) AS c FROM events WHERE destination_port IS NOT NULL",
    );
    if let Some(start) = &start {
        builder.push(" AND timestamp >= ").push_bind(store_time::encode(start));
    }
    if let Some(end) = &end {
        builder.push(" AND timestamp <= ").push_bind(store_time::encode(end));
    }
    builder
        .push(" GROUP BY destination_port ORDER BY c DESC LIMIT ")
        .push_bind(limit as i64);

    let top: Vec<(i64, i64)> = builder.build_query_as().fetch_all(pool).await?;

    let mut entries = Vec::with_capacity(top.len());
    for (port, count) in top {
        let mut breakdown_builder =
            QueryBuilder::new("SELECT severity, COUNT(*) FROM events WHERE destination_port = ");
        breakdown_builder.push_bind(port);
        if let Some(start) = &start {
            breakdown_builder
                .push(" AND timestamp >= ")
                .push_bind(store_time::encode(start));
        }
        if let Some(end) = &end {
            breakdown_builder
                .push(" AND timestamp <= ")
                .push_bind(store_time::encode(end));
        }
        breakdown_builder.push(" GROUP BY severity");
        let rows: Vec<(String, i64)> = breakdown_builder.build_query_as().fetch_all(pool).await?;
        entries.push(TopPortEntry {
            port,
            count,
            severity_breakdown: rows.into_iter().collect(),
        });
    }
    Ok(entries)
}

/// Event counts bucketed by hour, keyed `YYYY-MM-DDTHH:00:00`.
pub async fn hourly_counts(
    pool: &DbPool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<BTreeMap<String, i64>, StoreError> {
    let timestamps: Vec<String> = sqlx::query_scalar(
        "SELECT timestamp FROM events WHERE timestamp >= ? AND timestamp <= ?",
    )
    .bind(store_time::encode(&start))
    .bind(store_time::encode(&end))
    .fetch_all(pool)
    .await?;

    let mut buckets = BTreeMap::new();
    for raw in timestamps {
        let ts = store_time::decode(&raw)?;
        let key = ts.format("%Y-%m-%dT%H:00:00").to_string();
        *buckets.entry(key).or_insert(0) += 1;
    }
    Ok(buckets)
}

/// Event counts grouped by severity inside a time range.
pub async fn severity_counts(
    pool: &DbPool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<BTreeMap<String, i64>, StoreError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT severity, COUNT(*) FROM events WHERE timestamp >= ? AND timestamp <= ? GROUP BY severity",
    )
    .bind(store_time::encode(&start))
    .bind(store_time::encode(&end))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Event counts grouped by event type inside a time range.
pub async fn event_type_counts(
    pool: &DbPool,
    start: DateTime<Utc>,
    end: DateTime<Utc>,
) -> Result<BTreeMap<String, i64>, StoreError> {
    let rows: Vec<(String, i64)> = sqlx::query_as(
        "SELECT event_type, COUNT(*) FROM events WHERE timestamp >= ? AND timestamp <= ? GROUP BY event_type",
    )
    .bind(store_time::encode(&start))
    .bind(store_time::encode(&end))
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().collect())
}

/// Total events newer than `since`.
pub async fn count_events_since(pool: &DbPool, since: DateTime<Utc>) -> Result<i64, StoreError> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE timestamp >= ?")
        .bind(store_time::encode(&since))
        .fetch_one(pool)
        .await?;
    Ok(count)
}

/// Timestamp of the newest stored event, if any.
pub async fn last_event_timestamp(pool: &DbPool) -> Result<Option<DateTime<Utc>>, StoreError> {
    let raw: Option<String> = sqlx::query_scalar("SELECT MAX(timestamp) FROM events")
        .fetch_optional(pool)
        .await?
        .flatten();
    raw.as_deref().map(store_time::decode).transpose().map_err(StoreError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::init_memory_db;
    use crate::{Severity, event_type};
    use chrono::Duration;

    fn event(ip: &str, minutes_ago: i64, severity: Severity, kind: &str) -> Event {
        let mut e = Event::new(
            Utc::now() - Duration::minutes(minutes_ago),
            ip,
            "auth.log",
            kind,
            severity,
            &format!("raw line from {ip}"),
        );
        e.destination_port = Some(22);
        e.protocol = Some("TCP".to_string());
        e
    }

    #[tokio::test]
    async fn test_insert_and_find_events() {
        let pool = init_memory_db().await.unwrap();
        let events = vec![
            event("10.0.0.1", 5, Severity::High, event_type::SSH_FAILED_LOGIN),
            event("10.0.0.2", 3, Severity::Low, event_type::SSH_LOGIN_SUCCESS),
        ];
        assert_eq!(insert_events(&pool, &events).await.unwrap(), 2);

        let page = find_events(&pool, &EventFilter::default(), SortField::Timestamp, true, 1, 50)
            .await
            .unwrap();
        assert_eq!(page.total, 2);
        // Descending by timestamp: newest first.
        assert_eq!(page.events[0].source_ip, "10.0.0.2");
    }

    #[tokio::test]
    async fn test_filter_by_severity_and_search() {
        let pool = init_memory_db().await.unwrap();
        insert_events(
            &pool,
            &[
                event("10.0.0.1", 5, Severity::High, event_type::SSH_FAILED_LOGIN),
                event("10.0.0.2", 3, Severity::Low, event_type::SSH_LOGIN_SUCCESS),
            ],
        )
        .await
        .unwrap();

        let filter = EventFilter {
            severity: Some(Severity::High),
            ..Default::default()
        };
        let page = find_events(&pool, &filter, SortField::Timestamp, true, 1, 50)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.events[0].source_ip, "10.0.0.1");

        let filter = EventFilter {
            search: Some("10.0.0.2".to_string()),
            ..Default::default()
        };
        let page = find_events(&pool, &filter, SortField::Timestamp, true, 1, 50)
            .await
            .unwrap();
        assert_eq!(page.total, 1);
    }

    #[tokio::test]
    async fn test_severity_sort_uses_custom_order() {
        let pool = init_memory_db().await.unwrap();
        insert_events(
            &pool,
            &[
                event("10.0.0.1", 5, Severity::Low, event_type::SSH_LOGIN_SUCCESS),
                event("10.0.0.2", 4, Severity::Critical, event_type::SSH_FAILED_LOGIN),
                event("10.0.0.3", 3, Severity::Medium, event_type::SSH_FAILED_LOGIN),
            ],
        )
        .await
        .unwrap();

        let page = find_events(&pool, &EventFilter::default(), SortField::Severity, false, 1, 50)
            .await
            .unwrap();
        let severities: Vec<_> = page.events.iter().map(|e| e.severity).collect();
        assert_eq!(
            severities,
            vec![Severity::Critical, Severity::Medium, Severity::Low]
        );
    }

    #[tokio::test]
    async fn test_scan_range_is_ascending() {
        let pool = init_memory_db().await.unwrap();
        insert_events(
            &pool,
            &[
                event("10.0.0.1", 1, Severity::High, event_type::SSH_FAILED_LOGIN),
                event("10.0.0.1", 10, Severity::High, event_type::SSH_FAILED_LOGIN),
            ],
        )
        .await
        .unwrap();

        let events = scan_range(
            &pool,
            &ScanFilter::range(Utc::now() - Duration::hours(1), Utc::now()),
        )
        .await
        .unwrap();
        assert_eq!(events.len(), 2);
        assert!(events[0].timestamp <= events[1].timestamp);
    }

    #[tokio::test]
    async fn test_top_source_ips_and_latest_event() {
        let pool = init_memory_db().await.unwrap();
        insert_events(
            &pool,
            &[
                event("10.0.0.1", 5, Severity::High, event_type::SSH_FAILED_LOGIN),
                event("10.0.0.1", 4, Severity::High, event_type::SSH_FAILED_LOGIN),
                event("10.0.0.2", 3, Severity::Low, event_type::SSH_LOGIN_SUCCESS),
            ],
        )
        .await
        .unwrap();

        let top = top_source_ips(&pool, 10, None, None).await.unwrap();
        assert_eq!(top[0].ip, "10.0.0.1");
        assert_eq!(top[0].count, 2);
        assert_eq!(top[0].severity_breakdown.get("HIGH"), Some(&2));

        let latest = latest_event_for_ip(&pool, "10.0.0.1").await.unwrap().unwrap();
        assert_eq!(latest.source_ip, "10.0.0.1");
    }

    #[tokio::test]
    async fn test_hourly_counts_bucket_format() {
        let pool = init_memory_db().await.unwrap();
        insert_events(
            &pool,
            &[event("10.0.0.1", 0, Severity::High, event_type::SSH_FAILED_LOGIN)],
        )
        .await
        .unwrap();

        let buckets = hourly_counts(&pool, Utc::now() - Duration::hours(1), Utc::now())
            .await
            .unwrap();
        let (key, count) = buckets.iter().next().unwrap();
        assert!(key.ends_with(":00:00"));
        assert_eq!(*count, 1);
    }
}
