//! Local log file tailers.
//!
//! One task per configured source follows its file from the end. Every new
//! line goes to the hot cache first, then to the broadcaster, then through
//! the parser into the store; a parse failure never suppresses the broadcast.

use std::io::SeekFrom;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};

use firewall_common::database::DbPool;
use firewall_common::database::queries::insert_events;
use firewall_common::parsers::parse_line;

use crate::config::LiveSource;
use crate::services::broadcaster::{RawLogBroadcaster, RawLogMessage};
use crate::services::hot_cache::HotLogCache;

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Handle one freshly observed raw line: cache, broadcast, then parse+store.
pub async fn process_live_line(
    pool: &DbPool,
    broadcaster: &RawLogBroadcaster,
    hot_cache: &HotLogCache,
    source: &str,
    line: &str,
) {
    let trimmed = line.trim_end_matches(['\r', '\n']);
    if trimmed.trim().is_empty() {
        return;
    }

    match serde_json::to_string(&RawLogMessage::new(source, trimmed)) {
        Ok(payload) => hot_cache.add(source, &payload),
        Err(e) => tracing::warn!(error = %e, "failed to encode hot cache payload"),
    }

    broadcaster.broadcast(source, trimmed);

    if let Some(event) = parse_line(trimmed, Some(source)) {
        if let Err(e) = insert_events(pool, &[event]).await {
            tracing::warn!(source, error = %e, "failed to store live event");
        }
    }
}

async fn tail_source(
    pool: DbPool,
    broadcaster: Arc<RawLogBroadcaster>,
    hot_cache: Arc<HotLogCache>,
    name: String,
    path: std::path::PathBuf,
) {
    if !Path::new(&path).exists() {
        tracing::warn!(source = %name, path = %path.display(), "log file does not exist; tailer not started");
        return;
    }

    let file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(source = %name, error = %e, "failed to open log file");
            return;
        }
    };

    let mut reader = BufReader::new(file);
    if let Err(e) = reader.seek(SeekFrom::End(0)).await {
        tracing::warn!(source = %name, error = %e, "failed to seek to end of log file");
        return;
    }

    tracing::info!(source = %name, path = %path.display(), "tailing log file");
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => tokio::time::sleep(POLL_INTERVAL).await,
            Ok(_) => {
                process_live_line(&pool, &broadcaster, &hot_cache, &name, &line).await;
            }
            Err(e) => {
                tracing::warn!(source = %name, error = %e, "error reading log file");
                tokio::time::sleep(POLL_INTERVAL).await;
            }
        }
    }
}

/// Spawn one tailer task per configured source.
pub fn spawn_tailers(
    pool: &DbPool,
    broadcaster: &Arc<RawLogBroadcaster>,
    hot_cache: &Arc<HotLogCache>,
    sources: &[LiveSource],
) {
    for source in sources {
        tokio::spawn(tail_source(
            pool.clone(),
            Arc::clone(broadcaster),
            Arc::clone(hot_cache),
            source.name.clone(),
            source.path.clone(),
        ));
    }
}
