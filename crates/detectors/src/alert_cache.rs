//! Materialized alert cache.
//!
//! Detector output is bucketed on a fixed minute boundary and upserted into
//! the alerts collection under the key
//! `(bucket_end, lookback_seconds, alert_type, source_ip)`. Reads inside the
//! freshness window reuse the cached set without running the detectors.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use firewall_common::database::DbPool;
use firewall_common::error::StoreError;
use firewall_common::{Severity, store_time};

use crate::brute_force::{BruteForceParams, detect_brute_force};
use crate::ddos::{DdosParams, FloodDetection, detect_ddos};
use crate::port_scan::{PortScanParams, detect_port_scan};

pub mod alert_type {
    pub const BRUTE_FORCE: &str = "BRUTE_FORCE";
    pub const DDOS: &str = "DDOS";
    pub const PORT_SCAN: &str = "PORT_SCAN";
}

pub const DEFAULT_LOOKBACK_SECONDS: i64 = 24 * 3600;
pub const DEFAULT_BUCKET_MINUTES: u32 = 5;

/// Cached entries younger than this are served without recomputation.
pub const FRESHNESS_SECONDS: i64 = 120;

const MAX_PER_TYPE: usize = 200;

/// Placeholder IP for distributed floods with no primary source.
const MULTIPLE_IPS: &str = "Multiple IPs";

/// Floor a UTC instant to the nearest `minutes` boundary.
pub fn floor_to_bucket(dt: DateTime<Utc>, minutes: u32) -> DateTime<Utc> {
    let truncated = dt
        .with_second(0)
        .and_then(|d| d.with_nanosecond(0))
        .unwrap_or(dt);
    if minutes == 0 {
        return truncated;
    }
    let floored_minute = dt.minute() - (dt.minute() % minutes);
    truncated.with_minute(floored_minute).unwrap_or(truncated)
}

/// Materialized alert document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertDoc {
    pub bucket_end: DateTime<Utc>,
    pub lookback_seconds: i64,
    pub alert_type: String,
    pub source_ip: String,
    pub severity: Severity,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
    pub count: i64,
    pub description: String,
    pub details: serde_json::Value,
    pub computed_at: DateTime<Utc>,
}

impl AlertDoc {
    /// The unique cache key of this entry.
    pub fn key(&self) -> (DateTime<Utc>, i64, &str, &str) {
        (
            self.bucket_end,
            self.lookback_seconds,
            self.alert_type.as_str(),
            self.source_ip.as_str(),
        )
    }
}

#[derive(sqlx::FromRow)]
struct AlertRow {
    bucket_end: String,
    lookback_seconds: i64,
    alert_type: String,
    source_ip: String,
    severity: Severity,
    first_seen: Option<String>,
    last_seen: Option<String>,
    count: i64,
    description: String,
    details: String,
    computed_at: String,
}

impl TryFrom<AlertRow> for AlertDoc {
    type Error = StoreError;

    fn try_from(row: AlertRow) -> Result<Self, Self::Error> {
        Ok(AlertDoc {
            bucket_end: store_time::decode(&row.bucket_end)?,
            lookback_seconds: row.lookback_seconds,
            alert_type: row.alert_type,
            source_ip: row.source_ip,
            severity: row.severity,
            first_seen: row.first_seen.as_deref().map(store_time::decode).transpose()?,
            last_seen: row.last_seen.as_deref().map(store_time::decode).transpose()?,
            count: row.count,
            description: row.description,
            details: serde_json::from_str(&row.details)?,
            computed_at: store_time::decode(&row.computed_at)?,
        })
    }
}

/// Fetch alerts for the stable time bucket, computing and persisting them when
/// no fresh cached set exists. Returns `(start, bucket_end, alerts)`.
pub async fn get_or_compute_alerts(
    pool: &DbPool,
    now: Option<DateTime<Utc>>,
    lookback_seconds: i64,
    bucket_minutes: u32,
) -> Result<(DateTime<Utc>, DateTime<Utc>, Vec<AlertDoc>), StoreError> {
    let now = now.unwrap_or_else(Utc::now);
    let bucket_end = floor_to_bucket(now, bucket_minutes);
    let start = bucket_end - Duration::seconds(lookback_seconds);

    if let Some(cached) = cached_alerts(pool, bucket_end, lookback_seconds, now).await? {
        return Ok((start, bucket_end, cached));
    }

    let computed = compute_alert_docs(pool, start, bucket_end, lookback_seconds, now).await?;
    upsert_alert_docs(pool, &computed).await?;
    Ok((start, bucket_end, computed))
}

/// Cached entries for the bucket, if fresh enough.
async fn cached_alerts(
    pool: &DbPool,
    bucket_end: DateTime<Utc>,
    lookback_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Option<Vec<AlertDoc>>, StoreError> {
    let threshold = now - Duration::seconds(FRESHNESS_SECONDS);
    let rows: Vec<AlertRow> = sqlx::query_as(
        "SELECT bucket_end, lookback_seconds, alert_type, source_ip, severity, first_seen, \
         last_seen, count, description, details, computed_at FROM alerts \
         WHERE bucket_end = ? AND lookback_seconds = ? AND computed_at >= ?",
    )
    .bind(store_time::encode(&bucket_end))
    .bind(lookback_seconds)
    .bind(store_time::encode(&threshold))
    .fetch_all(pool)
    .await?;

    if rows.is_empty() {
        return Ok(None);
    }
    let docs = rows
        .into_iter()
        .map(AlertDoc::try_from)
        .collect::<Result<Vec<_>, _>>()?;
    Ok(Some(docs))
}

/// Run all three detectors over `[start, bucket_end]` and convert the output
/// into alert documents.
async fn compute_alert_docs(
    pool: &DbPool,
    start: DateTime<Utc>,
    bucket_end: DateTime<Utc>,
    lookback_seconds: i64,
    now: DateTime<Utc>,
) -> Result<Vec<AlertDoc>, StoreError> {
    let brute_force = detect_brute_force(
        pool,
        &BruteForceParams {
            start: Some(start),
            end: Some(bucket_end),
            ..Default::default()
        },
    )
    .await?;

    let ddos = detect_ddos(
        pool,
        &DdosParams {
            start: Some(start),
            end: Some(bucket_end),
            ..Default::default()
        },
    )
    .await?;

    let port_scan = detect_port_scan(
        pool,
        &PortScanParams {
            start: Some(start),
            end: Some(bucket_end),
            ..Default::default()
        },
    )
    .await?;

    let mut docs = Vec::new();

    for d in brute_force.iter().take(MAX_PER_TYPE) {
        docs.push(AlertDoc {
            bucket_end,
            lookback_seconds,
            alert_type: alert_type::BRUTE_FORCE.to_string(),
            source_ip: d.source_ip.clone(),
            severity: d.severity,
            first_seen: Some(d.first_attempt),
            last_seen: Some(d.last_attempt),
            count: d.total_attempts as i64,
            description: format!(
                "Brute force attack: {} failed login attempts",
                d.total_attempts
            ),
            details: serde_json::to_value(d)?,
            computed_at: now,
        });
    }

    for d in ddos.iter().take(MAX_PER_TYPE) {
        let (source_ip, description) = match d {
            FloodDetection::Distributed(f) => (
                f.source_ips.first().cloned().unwrap_or_else(|| MULTIPLE_IPS.to_string()),
                format!(
                    "Distributed DDoS: {} IPs, {} requests",
                    f.source_ip_count, f.total_requests
                ),
            ),
            FloodDetection::SingleIp(f) => (
                f.source_ip.clone(),
                format!("Single IP flood: {} requests", f.total_requests),
            ),
        };
        docs.push(AlertDoc {
            bucket_end,
            lookback_seconds,
            alert_type: alert_type::DDOS.to_string(),
            source_ip,
            severity: d.severity(),
            first_seen: Some(d.first_request()),
            last_seen: Some(d.last_request()),
            count: d.total_requests() as i64,
            description,
            details: serde_json::to_value(d)?,
            computed_at: now,
        });
    }

    for d in port_scan.iter().take(MAX_PER_TYPE) {
        docs.push(AlertDoc {
            bucket_end,
            lookback_seconds,
            alert_type: alert_type::PORT_SCAN.to_string(),
            source_ip: d.source_ip.clone(),
            severity: d.severity,
            first_seen: Some(d.first_attempt),
            last_seen: Some(d.last_attempt),
            count: d.total_attempts as i64,
            description: format!(
                "Port scan detected: {} unique ports attempted",
                d.unique_ports_attempted
            ),
            details: serde_json::to_value(d)?,
            computed_at: now,
        });
    }

    Ok(docs)
}

/// Upsert entries by their unique key; the last writer wins.
async fn upsert_alert_docs(pool: &DbPool, docs: &[AlertDoc]) -> Result<(), StoreError> {
    for doc in docs {
        sqlx::query(
            "INSERT INTO alerts (id, bucket_end, lookback_seconds, alert_type, source_ip, \
             severity, severity_rank, first_seen, last_seen, count, description, details, \
             computed_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT (bucket_end, lookback_seconds, alert_type, source_ip) DO UPDATE SET \
             severity = excluded.severity, severity_rank = excluded.severity_rank, \
             first_seen = excluded.first_seen, last_seen = excluded.last_seen, \
             count = excluded.count, description = excluded.description, \
             details = excluded.details, computed_at = excluded.computed_at",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(store_time::encode(&doc.bucket_end))
        .bind(doc.lookback_seconds)
        .bind(&doc.alert_type)
        .bind(&doc.source_ip)
        .bind(doc.severity.as_str())
        .bind(doc.severity.sort_rank())
        .bind(doc.first_seen.as_ref().map(store_time::encode))
        .bind(doc.last_seen.as_ref().map(store_time::encode))
        .bind(doc.count)
        .bind(&doc.description)
        .bind(serde_json::to_string(&doc.details)?)
        .bind(store_time::encode(&doc.computed_at))
        .execute(pool)
        .await?;
    }
    Ok(())
}

/// Dashboard order: severity rank ascending (`CRITICAL` first), then most
/// recently seen.
pub fn sort_alert_docs(docs: &mut [AlertDoc]) {
    docs.sort_by(|a, b| {
        a.severity
            .sort_rank()
            .cmp(&b.severity.sort_rank())
            .then(b.last_seen.cmp(&a.last_seen))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use firewall_common::database::init_memory_db;
    use firewall_common::database::queries::insert_events;
    use firewall_common::{Event, event_type};

    #[test]
    fn test_floor_to_bucket() {
        let dt = Utc.with_ymd_and_hms(2025, 6, 1, 12, 7, 42).unwrap();
        let floored = floor_to_bucket(dt, 5);
        assert_eq!(floored, Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap());

        let exact = Utc.with_ymd_and_hms(2025, 6, 1, 12, 10, 0).unwrap();
        assert_eq!(floor_to_bucket(exact, 5), exact);
    }

    fn failed_login(ip: &str, at: DateTime<Utc>) -> Event {
        let mut event = Event::new(
            at,
            ip,
            "auth.log",
            event_type::SSH_FAILED_LOGIN,
            Severity::High,
            &format!("Failed password for admin from {ip} port 22 ssh2"),
        );
        event.username = Some("admin".to_string());
        event.destination_port = Some(22);
        event.protocol = Some("TCP".to_string());
        event
    }

    #[tokio::test]
    async fn test_compute_then_cache_hit() {
        let pool = init_memory_db().await.unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 7, 0).unwrap();

        let events: Vec<Event> = (0..8)
            .map(|i| failed_login("203.0.113.9", now - Duration::minutes(10) + Duration::seconds(i * 20)))
            .collect();
        insert_events(&pool, &events).await.unwrap();

        let (_, bucket_end, first) =
            get_or_compute_alerts(&pool, Some(now), DEFAULT_LOOKBACK_SECONDS, 5)
                .await
                .unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].alert_type, alert_type::BRUTE_FORCE);
        assert_eq!(first[0].source_ip, "203.0.113.9");
        assert_eq!(bucket_end, Utc.with_ymd_and_hms(2025, 6, 1, 12, 5, 0).unwrap());

        // Remove the underlying events: a fresh cache hit must still return
        // the same set without rerunning the detectors.
        sqlx::query("DELETE FROM events").execute(&pool).await.unwrap();
        let (_, _, second) =
            get_or_compute_alerts(&pool, Some(now + Duration::seconds(60)), DEFAULT_LOOKBACK_SECONDS, 5)
                .await
                .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].key(), first[0].key());
    }

    #[tokio::test]
    async fn test_stale_cache_recomputes() {
        let pool = init_memory_db().await.unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 7, 0).unwrap();

        let events: Vec<Event> = (0..8)
            .map(|i| failed_login("203.0.113.9", now - Duration::minutes(10) + Duration::seconds(i * 20)))
            .collect();
        insert_events(&pool, &events).await.unwrap();

        let (_, _, first) = get_or_compute_alerts(&pool, Some(now), DEFAULT_LOOKBACK_SECONDS, 5)
            .await
            .unwrap();
        assert_eq!(first.len(), 1);

        // Same bucket but past the freshness window: detectors rerun against
        // an emptied store and the cached entry is superseded by nothing new.
        sqlx::query("DELETE FROM events").execute(&pool).await.unwrap();
        let later = now + Duration::seconds(FRESHNESS_SECONDS + 30);
        let (_, _, second) = get_or_compute_alerts(&pool, Some(later), DEFAULT_LOOKBACK_SECONDS, 5)
            .await
            .unwrap();
        assert!(second.is_empty());
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_per_key() {
        let pool = init_memory_db().await.unwrap();
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let doc = AlertDoc {
            bucket_end: now,
            lookback_seconds: 3600,
            alert_type: alert_type::BRUTE_FORCE.to_string(),
            source_ip: "10.0.0.1".to_string(),
            severity: Severity::High,
            first_seen: Some(now),
            last_seen: Some(now),
            count: 10,
            description: "Brute force attack: 10 failed login attempts".to_string(),
            details: serde_json::json!({}),
            computed_at: now,
        };
        upsert_alert_docs(&pool, &[doc.clone()]).await.unwrap();
        let mut updated = doc.clone();
        updated.count = 12;
        upsert_alert_docs(&pool, &[updated]).await.unwrap();

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM alerts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
        let stored: i64 = sqlx::query_scalar("SELECT count FROM alerts")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(stored, 12);
    }

    #[test]
    fn test_sort_alert_docs_order() {
        let now = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let mk = |severity: Severity, last_seen_minutes: i64, ip: &str| AlertDoc {
            bucket_end: now,
            lookback_seconds: 3600,
            alert_type: alert_type::DDOS.to_string(),
            source_ip: ip.to_string(),
            severity,
            first_seen: None,
            last_seen: Some(now - Duration::minutes(last_seen_minutes)),
            count: 1,
            description: String::new(),
            details: serde_json::json!({}),
            computed_at: now,
        };
        let mut docs = vec![
            mk(Severity::Low, 1, "a"),
            mk(Severity::Critical, 30, "b"),
            mk(Severity::Critical, 5, "c"),
        ];
        sort_alert_docs(&mut docs);
        assert_eq!(docs[0].source_ip, "c");
        assert_eq!(docs[1].source_ip, "b");
        assert_eq!(docs[2].source_ip, "a");
    }
}
