//! Batching forwarder.
//!
//! Wire contract: `POST /api/logs/ingest` with `{logs, log_source}` batches of
//! at most `batch_size` lines, flushed at least every `flush_seconds`.
//! Failures back off exponentially from 1s up to 30s; the failed batch stays
//! queued ahead of newer lines.

use std::collections::VecDeque;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tokio::sync::mpsc;

pub const DEFAULT_BATCH_SIZE: usize = 200;
pub const DEFAULT_FLUSH_SECONDS: u64 = 2;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const TAIL_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub endpoint: String,
    pub api_key: String,
    pub log_source: String,
    pub files: Vec<PathBuf>,
    pub batch_size: usize,
    pub flush_seconds: u64,
}

impl AgentConfig {
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let env = |name: &str, default: &str| {
            std::env::var(name).unwrap_or_else(|_| default.to_string())
        };
        AgentConfig {
            endpoint: env("FORWARDER_ENDPOINT", "http://localhost:8000/api/logs/ingest"),
            api_key: env("INGESTION_API_KEY", "default-api-key-change-in-production"),
            log_source: env("FORWARDER_LOG_SOURCE", "auth.log"),
            files: env("FORWARDER_FILES", "/var/log/auth.log")
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(PathBuf::from)
                .collect(),
            batch_size: env("FORWARDER_BATCH_SIZE", "200").parse().unwrap_or(DEFAULT_BATCH_SIZE),
            flush_seconds: env("FORWARDER_FLUSH_SECONDS", "2")
                .parse()
                .unwrap_or(DEFAULT_FLUSH_SECONDS),
        }
    }
}

#[derive(Serialize)]
struct IngestRequest<'a> {
    logs: &'a [String],
    log_source: &'a str,
}

pub struct Forwarder {
    config: AgentConfig,
    client: reqwest::Client,
    /// Lines awaiting delivery, oldest first.
    pending: VecDeque<String>,
    backoff: Duration,
}

impl Forwarder {
    pub fn new(config: AgentConfig) -> Self {
        Forwarder {
            config,
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
            pending: VecDeque::new(),
            backoff: BACKOFF_INITIAL,
        }
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn enqueue(&mut self, line: String) {
        if !line.trim().is_empty() {
            self.pending.push_back(line);
        }
    }

    /// Next batch to ship: up to `batch_size` of the oldest pending lines.
    fn next_batch(&self) -> Vec<String> {
        self.pending
            .iter()
            .take(self.config.batch_size)
            .cloned()
            .collect()
    }

    fn mark_delivered(&mut self, count: usize) {
        for _ in 0..count {
            self.pending.pop_front();
        }
        self.backoff = BACKOFF_INITIAL;
    }

    /// Grow the backoff after a failed delivery, capped at 30s.
    fn grow_backoff(&mut self) -> Duration {
        let current = self.backoff;
        self.backoff = (self.backoff * 2).min(BACKOFF_MAX);
        current
    }

    /// Try to deliver one batch. Returns how long to wait before the next
    /// attempt (zero after success with more pending work).
    pub async fn flush_once(&mut self) -> Duration {
        if self.pending.is_empty() {
            return Duration::from_secs(self.config.flush_seconds);
        }

        let batch = self.next_batch();
        let request = IngestRequest {
            logs: &batch,
            log_source: &self.config.log_source,
        };

        let sent = self
            .client
            .post(&self.config.endpoint)
            .header("X-API-Key", &self.config.api_key)
            .json(&request)
            .send()
            .await;

        match sent {
            Ok(response) if response.status().is_success() => {
                tracing::debug!(lines = batch.len(), "batch delivered");
                self.mark_delivered(batch.len());
                Duration::ZERO
            }
            Ok(response) => {
                let wait = self.grow_backoff();
                tracing::warn!(
                    status = response.status().as_u16(),
                    retry_in = ?wait,
                    "ingest endpoint rejected batch; retrying"
                );
                wait
            }
            Err(e) => {
                let wait = self.grow_backoff();
                tracing::warn!(error = %e, retry_in = ?wait, "failed to reach ingest endpoint; retrying");
                wait
            }
        }
    }

    /// Run the delivery loop: collect tailed lines, flush on size or on the
    /// flush interval, and back off on failure without dropping anything.
    pub async fn run(mut self, mut lines: mpsc::UnboundedReceiver<String>) {
        let flush_interval = Duration::from_secs(self.config.flush_seconds);
        let mut next_flush = tokio::time::Instant::now() + flush_interval;

        loop {
            tokio::select! {
                line = lines.recv() => {
                    match line {
                        Some(line) => {
                            self.enqueue(line);
                            if self.pending.len() >= self.config.batch_size {
                                let wait = self.flush_once().await;
                                if !wait.is_zero() {
                                    tokio::time::sleep(wait).await;
                                }
                                next_flush = tokio::time::Instant::now() + flush_interval;
                            }
                        }
                        None => {
                            // Tailers are gone; drain what is left and stop.
                            while self.pending_len() > 0 {
                                let wait = self.flush_once().await;
                                if !wait.is_zero() {
                                    tokio::time::sleep(wait).await;
                                }
                            }
                            return;
                        }
                    }
                }
                _ = tokio::time::sleep_until(next_flush) => {
                    let wait = self.flush_once().await;
                    if !wait.is_zero() {
                        tokio::time::sleep(wait).await;
                    }
                    next_flush = tokio::time::Instant::now() + flush_interval;
                }
            }
        }
    }
}

/// Tail one file from its end into the line channel.
pub async fn tail_into(path: PathBuf, sender: mpsc::UnboundedSender<String>) {
    let file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "cannot open file; tailer not started");
            return;
        }
    };
    let mut reader = BufReader::new(file);
    if reader.seek(SeekFrom::End(0)).await.is_err() {
        return;
    }

    tracing::info!(path = %path.display(), "tailing");
    let mut line = String::new();
    loop {
        line.clear();
        match reader.read_line(&mut line).await {
            Ok(0) => tokio::time::sleep(TAIL_POLL).await,
            Ok(_) => {
                let trimmed = line.trim_end_matches(['\r', '\n']).to_string();
                if sender.send(trimmed).is_err() {
                    return;
                }
            }
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "read error while tailing");
                tokio::time::sleep(TAIL_POLL).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> AgentConfig {
        AgentConfig {
            endpoint: "http://localhost:9/api/logs/ingest".to_string(),
            api_key: "k".to_string(),
            log_source: "auth.log".to_string(),
            files: vec![],
            batch_size: 3,
            flush_seconds: 2,
        }
    }

    #[test]
    fn test_batching_respects_size_and_order() {
        let mut forwarder = Forwarder::new(config());
        for i in 0..5 {
            forwarder.enqueue(format!("line-{i}"));
        }
        forwarder.enqueue("   ".to_string());
        assert_eq!(forwarder.pending_len(), 5);

        let batch = forwarder.next_batch();
        assert_eq!(batch, vec!["line-0", "line-1", "line-2"]);

        forwarder.mark_delivered(batch.len());
        assert_eq!(forwarder.next_batch(), vec!["line-3", "line-4"]);
    }

    #[test]
    fn test_backoff_doubles_to_cap() {
        let mut forwarder = Forwarder::new(config());
        let waits: Vec<u64> = (0..7).map(|_| forwarder.grow_backoff().as_secs()).collect();
        assert_eq!(waits, vec![1, 2, 4, 8, 16, 30, 30]);

        forwarder.mark_delivered(0);
        assert_eq!(forwarder.grow_backoff(), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failed_delivery_keeps_lines_queued() {
        // Port 9 (discard) refuses connections: delivery fails, nothing drops.
        let mut forwarder = Forwarder::new(config());
        forwarder.enqueue("keep me".to_string());
        let wait = forwarder.flush_once().await;
        assert!(wait >= Duration::from_secs(1));
        assert_eq!(forwarder.pending_len(), 1);
    }
}
