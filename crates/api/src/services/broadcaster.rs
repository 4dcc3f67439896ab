//! Raw log line fan-out to WebSocket subscribers.
//!
//! Every connection owns an unbounded channel and a subscription set; a slow
//! or dead connection never stalls the others. Per-source delivery order
//! equals arrival order because `broadcast` enqueues synchronously under one
//! lock.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::mpsc;

/// Wire frame sent to subscribers and kept in the hot cache.
#[derive(Debug, Serialize)]
pub struct RawLogMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub log_source: &'a str,
    pub raw_line: &'a str,
    pub timestamp: String,
}

impl<'a> RawLogMessage<'a> {
    pub fn new(log_source: &'a str, raw_line: &'a str) -> Self {
        RawLogMessage {
            kind: "raw_log",
            log_source,
            raw_line,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

struct Connection {
    sender: mpsc::UnboundedSender<String>,
    subscriptions: HashSet<String>,
}

#[derive(Default)]
struct Inner {
    next_id: u64,
    connections: HashMap<u64, Connection>,
}

#[derive(Default)]
pub struct RawLogBroadcaster {
    inner: Mutex<Inner>,
}

impl RawLogBroadcaster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; the caller drains the returned receiver into
    /// its socket.
    pub fn add_connection(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock().expect("broadcaster lock");
        inner.next_id += 1;
        let id = inner.next_id;
        inner.connections.insert(
            id,
            Connection {
                sender,
                subscriptions: HashSet::new(),
            },
        );
        tracing::debug!(connection = id, total = inner.connections.len(), "ws connection added");
        (id, receiver)
    }

    pub fn remove_connection(&self, id: u64) {
        let mut inner = self.inner.lock().expect("broadcaster lock");
        inner.connections.remove(&id);
        tracing::debug!(connection = id, total = inner.connections.len(), "ws connection removed");
    }

    /// Subscribe a connection to a source name or `all`.
    pub fn subscribe(&self, id: u64, log_source: &str) {
        let mut inner = self.inner.lock().expect("broadcaster lock");
        if let Some(connection) = inner.connections.get_mut(&id) {
            connection.subscriptions.insert(log_source.to_string());
        }
    }

    pub fn unsubscribe(&self, id: u64, log_source: &str) {
        let mut inner = self.inner.lock().expect("broadcaster lock");
        if let Some(connection) = inner.connections.get_mut(&id) {
            connection.subscriptions.remove(log_source);
        }
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().expect("broadcaster lock").connections.len()
    }

    /// Fan a raw line out to every subscribed connection. Connections whose
    /// channel is closed are removed.
    pub fn broadcast(&self, log_source: &str, raw_line: &str) {
        let line = raw_line.trim();
        if line.is_empty() {
            return;
        }
        let payload = match serde_json::to_string(&RawLogMessage::new(log_source, line)) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "failed to encode broadcast frame");
                return;
            }
        };

        let mut inner = self.inner.lock().expect("broadcaster lock");
        let mut dead = Vec::new();
        for (id, connection) in &inner.connections {
            let subscribed = connection.subscriptions.contains("all")
                || connection.subscriptions.contains(log_source);
            if !subscribed {
                continue;
            }
            if connection.sender.send(payload.clone()).is_err() {
                dead.push(*id);
            }
        }
        for id in dead {
            inner.connections.remove(&id);
            tracing::debug!(connection = id, "ws connection dropped during broadcast");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscribed_connection_receives_in_order() {
        let broadcaster = RawLogBroadcaster::new();
        let (id, mut receiver) = broadcaster.add_connection();
        broadcaster.subscribe(id, "auth");

        broadcaster.broadcast("auth", "line one");
        broadcaster.broadcast("auth", "line two");
        broadcaster.broadcast("ufw", "other source");

        let first = receiver.recv().await.unwrap();
        let second = receiver.recv().await.unwrap();
        assert!(first.contains("line one"));
        assert!(second.contains("line two"));
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_all_subscription_sees_everything() {
        let broadcaster = RawLogBroadcaster::new();
        let (id, mut receiver) = broadcaster.add_connection();
        broadcaster.subscribe(id, "all");

        broadcaster.broadcast("auth", "a");
        broadcaster.broadcast("kern", "b");
        assert!(receiver.recv().await.unwrap().contains("\"log_source\":\"auth\""));
        assert!(receiver.recv().await.unwrap().contains("\"log_source\":\"kern\""));
    }

    #[tokio::test]
    async fn test_dead_connection_is_removed() {
        let broadcaster = RawLogBroadcaster::new();
        let (id, receiver) = broadcaster.add_connection();
        broadcaster.subscribe(id, "auth");
        drop(receiver);

        broadcaster.broadcast("auth", "line");
        assert_eq!(broadcaster.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let broadcaster = RawLogBroadcaster::new();
        let (id, mut receiver) = broadcaster.add_connection();
        broadcaster.subscribe(id, "auth");
        broadcaster.unsubscribe(id, "auth");

        broadcaster.broadcast("auth", "line");
        assert!(receiver.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_empty_lines_are_dropped() {
        let broadcaster = RawLogBroadcaster::new();
        let (id, mut receiver) = broadcaster.add_connection();
        broadcaster.subscribe(id, "all");
        broadcaster.broadcast("auth", "   ");
        assert!(receiver.try_recv().is_err());
    }
}
