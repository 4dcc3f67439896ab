//! Live log view: the WebSocket subscription endpoint and the hot-cache
//! backlog endpoint.

use axum::Json;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct CacheQuery {
    pub source: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct CacheResponse {
    pub source: String,
    pub count: usize,
    /// Cached frames, newest first, already JSON-encoded.
    pub lines: Vec<String>,
}

/// `GET /api/live/cache` — recent raw lines for a source, for instant
/// switching in the live view.
pub async fn cached_lines(
    State(state): State<AppState>,
    Query(query): Query<CacheQuery>,
) -> Json<CacheResponse> {
    let source = query.source.unwrap_or_else(|| "all".to_string());
    let lines = state.hot_cache.recent(&source, query.limit.unwrap_or(200));
    Json(CacheResponse {
        source,
        count: lines.len(),
        lines,
    })
}

/// Subscription control frames sent by the client.
#[derive(Debug, Deserialize)]
struct ControlFrame {
    action: String,
    log_source: String,
}

pub async fn live_logs_ws(State(state): State<AppState>, upgrade: WebSocketUpgrade) -> Response {
    upgrade.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (id, mut receiver) = state.broadcaster.add_connection();
    let (mut sink, mut stream) = socket.split();

    // Drain the broadcast channel into the socket independently of the
    // control-frame loop so a slow reader never blocks subscriptions.
    let forward = tokio::spawn(async move {
        while let Some(payload) = receiver.recv().await {
            if sink.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    while let Some(frame) = stream.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<ControlFrame>(&text) {
                Ok(frame) if frame.action == "subscribe" => {
                    state.broadcaster.subscribe(id, &frame.log_source);
                }
                Ok(frame) if frame.action == "unsubscribe" => {
                    state.broadcaster.unsubscribe(id, &frame.log_source);
                }
                Ok(frame) => {
                    tracing::debug!(action = %frame.action, "unknown ws control action");
                }
                Err(e) => {
                    tracing::debug!(error = %e, "malformed ws control frame");
                }
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                tracing::debug!(connection = id, error = %e, "ws receive error");
                break;
            }
        }
    }

    state.broadcaster.remove_connection(id);
    forward.abort();
}
