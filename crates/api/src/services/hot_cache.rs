//! In-process hot cache of recent raw log lines, per source.
//!
//! Bounded FIFO per source plus an aggregate `all` queue, with a TTL so a
//! quiet source does not serve hour-old lines forever. Serves the live view's
//! instant source switching.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

const ALL_SOURCES: &str = "all";

struct CachedLine {
    at: DateTime<Utc>,
    payload: String,
}

pub struct HotLogCache {
    max_per_source: usize,
    ttl: Duration,
    inner: Mutex<HashMap<String, VecDeque<CachedLine>>>,
}

impl HotLogCache {
    pub fn new(max_per_source: usize, ttl_seconds: i64) -> Self {
        HotLogCache {
            max_per_source,
            ttl: Duration::seconds(ttl_seconds),
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Defaults matching the live view contract: 5000 lines per source, 1h TTL.
    pub fn with_defaults() -> Self {
        Self::new(5000, 3600)
    }

    pub fn add(&self, log_source: &str, payload: &str) {
        let now = Utc::now();
        let mut inner = self.inner.lock().expect("hot cache lock");
        for key in [log_source, ALL_SOURCES] {
            let queue = inner.entry(key.to_string()).or_default();
            queue.push_back(CachedLine {
                at: now,
                payload: payload.to_string(),
            });
            while queue.len() > self.max_per_source {
                queue.pop_front();
            }
            let cutoff = now - self.ttl;
            while queue.front().map(|line| line.at < cutoff).unwrap_or(false) {
                queue.pop_front();
            }
        }
    }

    /// Most recent lines for a source, newest first.
    pub fn recent(&self, log_source: &str, limit: usize) -> Vec<String> {
        let cutoff = Utc::now() - self.ttl;
        let inner = self.inner.lock().expect("hot cache lock");
        let Some(queue) = inner.get(log_source) else {
            return Vec::new();
        };
        queue
            .iter()
            .rev()
            .filter(|line| line.at >= cutoff)
            .take(limit)
            .map(|line| line.payload.clone())
            .collect()
    }
}
