// HTTP surface: route registration.

pub mod alerts;
pub mod blocking;
pub mod dashboard;
pub mod ingest;
pub mod live;
pub mod ml;
pub mod threats;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/logs/ingest", post(ingest::ingest_logs))
        .route("/api/threats/brute-force", get(threats::brute_force))
        .route("/api/threats/brute-force/timeline", get(threats::brute_force_timeline))
        .route("/api/threats/ddos", get(threats::ddos))
        .route("/api/threats/port-scan", get(threats::port_scan))
        .route("/api/alerts", get(alerts::list_alerts))
        .route("/api/dashboard/summary", get(dashboard::summary))
        .route("/api/blocking/list", get(blocking::list_blocked))
        .route("/api/blocking/block", post(blocking::block_ip))
        .route("/api/blocking/unblock", post(blocking::unblock_ip))
        .route("/api/ml/status", get(ml::status))
        .route("/api/ml/retrain", post(ml::retrain))
        .route("/api/ml/versions", get(ml::versions))
        .route("/api/ml/rollback", post(ml::rollback))
        .route("/api/live/cache", get(live::cached_lines))
        .route("/ws/live-logs", get(live::live_logs_ws))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
