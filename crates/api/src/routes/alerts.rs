//! Cached alert listing.

use axum::Json;
use axum::extract::{Query, State};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use firewall_detectors::AlertDoc;
use firewall_detectors::alert_cache::{
    DEFAULT_BUCKET_MINUTES, DEFAULT_LOOKBACK_SECONDS, get_or_compute_alerts, sort_alert_docs,
};

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct AlertsQuery {
    pub lookback_seconds: Option<i64>,
    pub bucket_minutes: Option<u32>,
}

#[derive(Debug, Serialize)]
pub struct AlertsResponse {
    pub window_start: DateTime<Utc>,
    pub bucket_end: DateTime<Utc>,
    pub count: usize,
    pub alerts: Vec<AlertDoc>,
}

pub async fn list_alerts(
    State(state): State<AppState>,
    Query(query): Query<AlertsQuery>,
) -> Result<Json<AlertsResponse>, ApiError> {
    let (window_start, bucket_end, mut alerts) = get_or_compute_alerts(
        &state.pool,
        None,
        query.lookback_seconds.unwrap_or(DEFAULT_LOOKBACK_SECONDS),
        query.bucket_minutes.unwrap_or(DEFAULT_BUCKET_MINUTES),
    )
    .await?;
    sort_alert_docs(&mut alerts);

    Ok(Json(AlertsResponse {
        window_start,
        bucket_end,
        count: alerts.len(),
        alerts,
    }))
}
