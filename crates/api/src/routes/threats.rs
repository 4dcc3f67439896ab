//! Detector endpoints with optional ML adjustment, reputation enrichment,
//! and CSV export.

use axum::Json;
use axum::extract::{Query, State};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use firewall_common::Severity;
use firewall_detectors::brute_force::{self, BruteForceDetection, BruteForceParams};
use firewall_detectors::ddos::{DdosParams, FloodDetection};
use firewall_detectors::port_scan::{PortScanDetection, PortScanParams};
use firewall_detectors::reputation::{IpReputation, enhance_severity};
use firewall_detectors::{detect_brute_force, detect_ddos, detect_port_scan};
use firewall_ml::{MlResult, ScoreContext, adjust_severity_with_ml};

use crate::error::ApiError;
use crate::export::csv_attachment;
use crate::state::AppState;

fn wants_csv(format: &Option<String>) -> bool {
    format.as_deref() == Some("csv")
}

/// Enrichment attached to each detection when requested.
#[derive(Debug, Serialize)]
pub struct Enriched<T> {
    #[serde(flatten)]
    pub detection: T,
    /// Severity after ML/reputation adjustment (equals the rule severity when
    /// no adjustment applies).
    pub effective_severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ml: Option<MlResult>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reputation: Option<IpReputation>,
}

#[derive(Debug, Serialize)]
pub struct DetectionsResponse<T> {
    pub count: usize,
    pub detections: Vec<Enriched<T>>,
}

async fn enrich<T>(
    state: &AppState,
    detection: T,
    severity: Severity,
    primary_ip: Option<&str>,
    sample: Option<&firewall_common::SampleEvent>,
    threat_type: &str,
    enable_ml: bool,
    enrich_reputation: bool,
) -> Enriched<T> {
    let mut effective = severity;

    let ml = if enable_ml {
        let ctx = ScoreContext {
            source_ip: primary_ip.map(str::to_string),
            threat_type_hint: Some(threat_type.to_string()),
            severity_hint: Some(severity),
            timestamp: None,
            log_source: sample.map(|s| s.log_source.clone()),
            event_type: sample.map(|s| s.event_type.clone()),
            raw_log: sample.map(|s| s.raw_log.clone()),
        };
        let result = state.ml.score(&state.pool, &ctx).await;
        effective = adjust_severity_with_ml(effective, &result);
        Some(result)
    } else {
        None
    };

    let reputation = match (enrich_reputation, primary_ip) {
        (true, Some(ip)) => state.reputation.get(&state.pool, ip).await,
        _ => None,
    };
    if let Some(rep) = &reputation {
        effective = enhance_severity(effective, rep);
    }

    Enriched {
        detection,
        effective_severity: effective,
        ml,
        reputation,
    }
}

#[derive(Debug, Deserialize)]
pub struct BruteForceQuery {
    pub time_window_minutes: Option<i64>,
    pub threshold: Option<usize>,
    pub source_ip: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub enable_ml: Option<bool>,
    pub enrich_reputation: Option<bool>,
    pub format: Option<String>,
}

pub async fn brute_force(
    State(state): State<AppState>,
    Query(query): Query<BruteForceQuery>,
) -> Result<Response, ApiError> {
    let params = BruteForceParams {
        time_window_minutes: query.time_window_minutes.unwrap_or(15),
        threshold: query.threshold.unwrap_or(5),
        source_ip: query.source_ip.clone(),
        start: query.start_date,
        end: query.end_date,
    };
    let detections = detect_brute_force(&state.pool, &params).await?;

    let mut enriched = Vec::with_capacity(detections.len());
    for detection in detections {
        let severity = detection.severity;
        let ip = detection.source_ip.clone();
        let sample = detection.sample.clone();
        enriched.push(
            enrich(
                &state,
                detection,
                severity,
                Some(ip.as_str()),
                Some(&sample),
                "BRUTE_FORCE",
                query.enable_ml.unwrap_or(false),
                query.enrich_reputation.unwrap_or(false),
            )
            .await,
        );
    }

    if wants_csv(&query.format) {
        let rows: Vec<Vec<String>> = enriched
            .iter()
            .map(|e| brute_force_csv_row(&e.detection, e.effective_severity))
            .collect();
        return Ok(csv_attachment(
            "brute_force_report",
            &[
                "source_ip",
                "total_attempts",
                "unique_usernames",
                "first_attempt",
                "last_attempt",
                "attack_windows",
                "severity",
            ],
            &rows,
        ));
    }

    Ok(Json(DetectionsResponse {
        count: enriched.len(),
        detections: enriched,
    })
    .into_response())
}

fn brute_force_csv_row(d: &BruteForceDetection, severity: Severity) -> Vec<String> {
    vec![
        d.source_ip.clone(),
        d.total_attempts.to_string(),
        d.unique_usernames_attempted.to_string(),
        d.first_attempt.to_rfc3339(),
        d.last_attempt.to_rfc3339(),
        d.attack_windows.len().to_string(),
        severity.to_string(),
    ]
}

#[derive(Debug, Deserialize)]
pub struct TimelineQuery {
    pub source_ip: String,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
}

pub async fn brute_force_timeline(
    State(state): State<AppState>,
    Query(query): Query<TimelineQuery>,
) -> Result<Json<brute_force::BruteForceTimeline>, ApiError> {
    let timeline = brute_force::brute_force_timeline(
        &state.pool,
        &query.source_ip,
        query.start_date,
        query.end_date,
    )
    .await?;
    Ok(Json(timeline))
}

#[derive(Debug, Deserialize)]
pub struct DdosQuery {
    pub time_window_seconds: Option<i64>,
    pub single_ip_threshold: Option<usize>,
    pub distributed_ip_count: Option<usize>,
    pub distributed_request_threshold: Option<usize>,
    pub destination_port: Option<u16>,
    pub protocol: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub enable_ml: Option<bool>,
    pub enrich_reputation: Option<bool>,
    pub format: Option<String>,
}

pub async fn ddos(
    State(state): State<AppState>,
    Query(query): Query<DdosQuery>,
) -> Result<Response, ApiError> {
    let params = DdosParams {
        time_window_seconds: query.time_window_seconds.unwrap_or(60),
        single_ip_threshold: query.single_ip_threshold.unwrap_or(100),
        distributed_ip_count: query.distributed_ip_count.unwrap_or(10),
        distributed_request_threshold: query.distributed_request_threshold.unwrap_or(500),
        destination_port: query.destination_port,
        protocol: query.protocol.clone(),
        start: query.start_date,
        end: query.end_date,
    };
    let detections = detect_ddos(&state.pool, &params).await?;

    let mut enriched = Vec::with_capacity(detections.len());
    for detection in detections {
        let severity = detection.severity();
        let ip = detection.primary_ip().map(str::to_string);
        let sample = detection.sample().clone();
        enriched.push(
            enrich(
                &state,
                detection,
                severity,
                ip.as_deref(),
                Some(&sample),
                "DDOS",
                query.enable_ml.unwrap_or(false),
                query.enrich_reputation.unwrap_or(false),
            )
            .await,
        );
    }

    if wants_csv(&query.format) {
        let rows: Vec<Vec<String>> = enriched
            .iter()
            .map(|e| ddos_csv_row(&e.detection, e.effective_severity))
            .collect();
        return Ok(csv_attachment(
            "ddos_report",
            &[
                "attack_type",
                "primary_source_ip",
                "source_ip_count",
                "total_requests",
                "peak_request_rate",
                "severity",
            ],
            &rows,
        ));
    }

    Ok(Json(DetectionsResponse {
        count: enriched.len(),
        detections: enriched,
    })
    .into_response())
}

fn ddos_csv_row(d: &FloodDetection, severity: Severity) -> Vec<String> {
    let (kind, ip_count) = match d {
        FloodDetection::SingleIp(_) => ("SINGLE_IP_FLOOD", 1),
        FloodDetection::Distributed(f) => ("DISTRIBUTED_FLOOD", f.source_ip_count),
    };
    vec![
        kind.to_string(),
        d.primary_ip().unwrap_or("Multiple IPs").to_string(),
        ip_count.to_string(),
        d.total_requests().to_string(),
        format!("{:.1}", d.peak_request_rate()),
        severity.to_string(),
    ]
}

#[derive(Debug, Deserialize)]
pub struct PortScanQuery {
    pub time_window_minutes: Option<i64>,
    pub unique_ports_threshold: Option<usize>,
    pub min_total_attempts: Option<usize>,
    pub source_ip: Option<String>,
    pub protocol: Option<String>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub enable_ml: Option<bool>,
    pub enrich_reputation: Option<bool>,
    pub format: Option<String>,
}

pub async fn port_scan(
    State(state): State<AppState>,
    Query(query): Query<PortScanQuery>,
) -> Result<Response, ApiError> {
    let params = PortScanParams {
        time_window_minutes: query.time_window_minutes.unwrap_or(10),
        unique_ports_threshold: query.unique_ports_threshold.unwrap_or(10),
        min_total_attempts: query.min_total_attempts.unwrap_or(20),
        source_ip: query.source_ip.clone(),
        protocol: query.protocol.clone(),
        start: query.start_date,
        end: query.end_date,
    };
    let detections = detect_port_scan(&state.pool, &params).await?;

    let mut enriched = Vec::with_capacity(detections.len());
    for detection in detections {
        let severity = detection.severity;
        let ip = detection.source_ip.clone();
        let sample = detection.sample.clone();
        enriched.push(
            enrich(
                &state,
                detection,
                severity,
                Some(ip.as_str()),
                Some(&sample),
                "PORT_SCAN",
                query.enable_ml.unwrap_or(false),
                query.enrich_reputation.unwrap_or(false),
            )
            .await,
        );
    }

    if wants_csv(&query.format) {
        let rows: Vec<Vec<String>> = enriched
            .iter()
            .map(|e| port_scan_csv_row(&e.detection, e.effective_severity))
            .collect();
        return Ok(csv_attachment(
            "port_scan_report",
            &[
                "source_ip",
                "total_attempts",
                "unique_ports",
                "first_attempt",
                "last_attempt",
                "attack_windows",
                "severity",
            ],
            &rows,
        ));
    }

    Ok(Json(DetectionsResponse {
        count: enriched.len(),
        detections: enriched,
    })
    .into_response())
}

fn port_scan_csv_row(d: &PortScanDetection, severity: Severity) -> Vec<String> {
    vec![
        d.source_ip.clone(),
        d.total_attempts.to_string(),
        d.unique_ports_attempted.to_string(),
        d.first_attempt.to_rfc3339(),
        d.last_attempt.to_rfc3339(),
        d.attack_windows.len().to_string(),
        severity.to_string(),
    ]
}
