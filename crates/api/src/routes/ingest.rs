//! Remote log ingestion endpoint.

use std::net::SocketAddr;

use axum::Json;
use axum::extract::{ConnectInfo, State};
use axum::http::HeaderMap;
use serde::{Deserialize, Serialize};

use firewall_common::database::queries::insert_events;
use firewall_common::parsers::parse_lines;

use crate::error::ApiError;
use crate::middleware::verify_api_key;
use crate::state::AppState;

pub const MAX_BATCH_LINES: usize = 1000;

#[derive(Debug, Deserialize)]
pub struct LogIngestionRequest {
    pub logs: Vec<String>,
    pub log_source: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogIngestionResponse {
    pub success: bool,
    pub ingested_count: usize,
    pub failed_count: usize,
    pub total_received: usize,
    pub message: String,
}

/// Best available client identity for rate limiting: proxy header first,
/// then the socket peer address.
fn client_ip(headers: &HeaderMap, connect_info: Option<&ConnectInfo<SocketAddr>>) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for") {
        if let Ok(value) = forwarded.to_str() {
            if let Some(first) = value.split(',').next() {
                let first = first.trim();
                if !first.is_empty() {
                    return first.to_string();
                }
            }
        }
    }
    connect_info
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `POST /api/logs/ingest` — accept a batch of raw lines, parse them with the
/// dispatcher, and bulk-insert the successes. Partial success is normal and
/// reported in the counts.
pub async fn ingest_logs(
    State(state): State<AppState>,
    connect_info: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(request): Json<LogIngestionRequest>,
) -> Result<Json<LogIngestionResponse>, ApiError> {
    verify_api_key(&headers, &state.config.ingestion_api_key)?;

    if request.logs.is_empty() {
        return Err(ApiError::BadRequest("Logs list cannot be empty".to_string()));
    }
    if request.logs.len() > MAX_BATCH_LINES {
        return Err(ApiError::BadRequest(format!(
            "Maximum {MAX_BATCH_LINES} log lines per request"
        )));
    }

    state
        .rate_limiter
        .check(&client_ip(&headers, connect_info.as_ref()))?;

    let total_received = request.logs.len();
    let events = parse_lines(&request.logs, request.log_source.as_deref());
    let ingested_count = events.len();
    let failed_count = total_received - ingested_count;

    if ingested_count == 0 {
        return Ok(Json(LogIngestionResponse {
            success: false,
            ingested_count: 0,
            failed_count,
            total_received,
            message: "No logs could be parsed from the provided lines".to_string(),
        }));
    }

    insert_events(&state.pool, &events).await.map_err(ApiError::from)?;
    tracing::info!(ingested = ingested_count, failed = failed_count, "ingested log batch");

    Ok(Json(LogIngestionResponse {
        success: true,
        ingested_count,
        failed_count,
        total_received,
        message: format!(
            "Successfully ingested {ingested_count} log(s). {failed_count} failed to parse."
        ),
    }))
}
