//! Dashboard summary: active alerts, 24h threat counts, top talkers, and
//! system health.

use std::collections::BTreeMap;

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use firewall_common::Severity;
use firewall_common::database::queries::{
    TopIpEntry, TopPortEntry, count_events_since, event_type_counts, hourly_counts,
    last_event_timestamp, severity_counts, top_destination_ports, top_source_ips,
};
use firewall_common::database::test_connection;
use firewall_detectors::AlertDoc;
use firewall_detectors::alert_cache::{
    DEFAULT_BUCKET_MINUTES, DEFAULT_LOOKBACK_SECONDS, get_or_compute_alerts, sort_alert_docs,
};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SystemHealth {
    pub db_status: String,
    pub logs_24h: i64,
    pub last_log_timestamp: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct DashboardSummary {
    pub active_alerts: Vec<AlertDoc>,
    pub threat_counts_by_type: BTreeMap<String, i64>,
    pub threat_counts_by_severity: BTreeMap<String, i64>,
    pub hourly_event_counts: BTreeMap<String, i64>,
    pub top_source_ips: Vec<TopIpEntry>,
    pub top_destination_ports: Vec<TopPortEntry>,
    pub system_health: SystemHealth,
}

pub async fn summary(State(state): State<AppState>) -> Result<Json<DashboardSummary>, ApiError> {
    let now = Utc::now();

    // Health first: a down store short-circuits into a degraded summary.
    if test_connection(&state.pool).await.is_err() {
        return Ok(Json(DashboardSummary {
            active_alerts: Vec::new(),
            threat_counts_by_type: BTreeMap::new(),
            threat_counts_by_severity: BTreeMap::new(),
            hourly_event_counts: BTreeMap::new(),
            top_source_ips: Vec::new(),
            top_destination_ports: Vec::new(),
            system_health: SystemHealth {
                db_status: "down".to_string(),
                logs_24h: 0,
                last_log_timestamp: None,
            },
        }));
    }

    let (_, _, mut alerts) = get_or_compute_alerts(
        &state.pool,
        None,
        DEFAULT_LOOKBACK_SECONDS,
        DEFAULT_BUCKET_MINUTES,
    )
    .await?;
    sort_alert_docs(&mut alerts);
    let active_alerts: Vec<AlertDoc> = alerts
        .into_iter()
        .filter(|alert| alert.severity >= Severity::High)
        .take(10)
        .collect();

    let day_ago = now - Duration::hours(24);
    let threat_counts_by_type = event_type_counts(&state.pool, day_ago, now).await?;
    let threat_counts_by_severity = severity_counts(&state.pool, day_ago, now).await?;
    let hourly_event_counts = hourly_counts(&state.pool, day_ago, now).await?;

    // 7-day window with an all-time fallback when the week is quiet.
    let week_ago = now - Duration::days(7);
    let mut top = top_source_ips(&state.pool, 10, Some(week_ago), Some(now)).await?;
    if top.is_empty() {
        top = top_source_ips(&state.pool, 10, None, None).await?;
    }
    let top_ports = top_destination_ports(&state.pool, 10, Some(week_ago), Some(now)).await?;

    let mut db_status = "healthy";
    let logs_24h = match count_events_since(&state.pool, day_ago).await {
        Ok(count) => count,
        Err(e) => {
            tracing::warn!(error = %e, "failed to count recent events");
            db_status = "degraded";
            0
        }
    };
    let last_log_timestamp = last_event_timestamp(&state.pool).await.unwrap_or_default();

    Ok(Json(DashboardSummary {
        active_alerts,
        threat_counts_by_type,
        threat_counts_by_severity,
        hourly_event_counts,
        top_source_ips: top,
        top_destination_ports: top_ports,
        system_health: SystemHealth {
            db_status: db_status.to_string(),
            logs_24h,
            last_log_timestamp,
        },
    }))
}
