//! Manual IP blocking endpoints, riding the same blocklist service the
//! auto-block actor uses.

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};

use crate::error::ApiError;
use crate::services::blocklist::BlockRecord;
use crate::services::firewall::FirewallError;
use crate::services::blocklist::BlockError;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub active_only: Option<bool>,
}

#[derive(Debug, Serialize)]
pub struct BlockedListResponse {
    pub count: usize,
    pub blocked: Vec<BlockRecord>,
}

pub async fn list_blocked(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> Result<Json<BlockedListResponse>, ApiError> {
    let blocked = state
        .blocklist
        .list(query.active_only.unwrap_or(true))
        .await?;
    Ok(Json(BlockedListResponse {
        count: blocked.len(),
        blocked,
    }))
}

#[derive(Debug, Deserialize)]
pub struct BlockRequest {
    pub ip: String,
    pub reason: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BlockResponse {
    pub success: bool,
    pub ip: String,
    pub changed: bool,
    pub message: String,
}

fn map_block_error(e: BlockError) -> ApiError {
    match e {
        BlockError::Firewall(FirewallError::AuthFailed(detail)) => {
            tracing::error!(detail = %detail, "firewall helper authentication failed");
            ApiError::Internal("firewall helper authentication failed".to_string())
        }
        BlockError::Firewall(e) => ApiError::Internal(e.to_string()),
        BlockError::Store(e) => ApiError::Store(e),
    }
}

pub async fn block_ip(
    State(state): State<AppState>,
    Json(request): Json<BlockRequest>,
) -> Result<Json<BlockResponse>, ApiError> {
    if request.ip.parse::<std::net::IpAddr>().is_err() {
        return Err(ApiError::BadRequest(format!("invalid IP address: {}", request.ip)));
    }

    let outcome = state
        .blocklist
        .block_ip(&request.ip, request.reason.as_deref(), "manual")
        .await
        .map_err(map_block_error)?;

    Ok(Json(BlockResponse {
        success: true,
        ip: outcome.ip,
        changed: outcome.changed,
        message: if outcome.changed {
            format!("IP {} blocked successfully", request.ip)
        } else {
            format!("IP {} was already blocked", request.ip)
        },
    }))
}

#[derive(Debug, Deserialize)]
pub struct UnblockRequest {
    pub ip: String,
}

pub async fn unblock_ip(
    State(state): State<AppState>,
    Json(request): Json<UnblockRequest>,
) -> Result<Json<BlockResponse>, ApiError> {
    let outcome = state
        .blocklist
        .unblock_ip(&request.ip, "manual")
        .await
        .map_err(map_block_error)?;

    Ok(Json(BlockResponse {
        success: true,
        ip: outcome.ip,
        changed: outcome.changed,
        message: if outcome.changed {
            format!("IP {} unblocked successfully", request.ip)
        } else {
            format!("IP {} was not blocked", request.ip)
        },
    }))
}
