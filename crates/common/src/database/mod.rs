//! Event store and document collections on SQLite via sqlx.
//!
//! The schema is applied at pool initialization; every statement is
//! idempotent (`IF NOT EXISTS`) so repeated startups are safe.

pub mod models;
pub mod queries;
pub mod retention;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};

use crate::error::StoreError;

/// Database connection pool type.
pub type DbPool = sqlx::SqlitePool;

/// Initialize the database connection pool and apply the schema.
pub async fn init_db(database_url: &str) -> Result<DbPool, StoreError> {
    let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(10)
        .connect_with(options)
        .await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// In-memory pool for tests. A single connection keeps the database alive for
/// the pool's lifetime.
pub async fn init_memory_db() -> Result<DbPool, StoreError> {
    let pool = SqlitePoolOptions::new()
        .min_connections(1)
        .max_connections(1)
        .connect("sqlite::memory:")
        .await?;
    apply_schema(&pool).await?;
    Ok(pool)
}

/// Test database connection.
pub async fn test_connection(pool: &DbPool) -> Result<(), StoreError> {
    sqlx::query("SELECT 1").fetch_one(pool).await?;
    Ok(())
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS events (
        id TEXT PRIMARY KEY,
        timestamp TEXT NOT NULL,
        source_ip TEXT NOT NULL,
        destination_ip TEXT,
        source_port INTEGER,
        destination_port INTEGER,
        protocol TEXT,
        log_source TEXT NOT NULL,
        event_type TEXT NOT NULL,
        severity TEXT NOT NULL,
        severity_rank INTEGER NOT NULL,
        username TEXT,
        raw_log TEXT NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS events_timestamp_desc ON events (timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS events_source_ip ON events (source_ip)",
    "CREATE INDEX IF NOT EXISTS events_severity ON events (severity)",
    "CREATE INDEX IF NOT EXISTS events_event_type ON events (event_type)",
    "CREATE INDEX IF NOT EXISTS events_destination_port ON events (destination_port)",
    "CREATE INDEX IF NOT EXISTS events_protocol ON events (protocol)",
    "CREATE INDEX IF NOT EXISTS events_log_source ON events (log_source)",
    "CREATE INDEX IF NOT EXISTS events_timestamp_severity ON events (timestamp DESC, severity)",
    "CREATE INDEX IF NOT EXISTS events_source_ip_timestamp ON events (source_ip, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS events_severity_event_timestamp ON events (severity, event_type, timestamp DESC)",
    "CREATE INDEX IF NOT EXISTS events_port_timestamp ON events (destination_port, timestamp DESC)",
    "CREATE TABLE IF NOT EXISTS alerts (
        id TEXT PRIMARY KEY,
        bucket_end TEXT NOT NULL,
        lookback_seconds INTEGER NOT NULL,
        alert_type TEXT NOT NULL,
        source_ip TEXT NOT NULL,
        severity TEXT NOT NULL,
        severity_rank INTEGER NOT NULL,
        first_seen TEXT,
        last_seen TEXT,
        count INTEGER NOT NULL,
        description TEXT NOT NULL,
        details TEXT NOT NULL,
        computed_at TEXT NOT NULL,
        UNIQUE (bucket_end, lookback_seconds, alert_type, source_ip)
    )",
    "CREATE INDEX IF NOT EXISTS alerts_bucket_end_desc ON alerts (bucket_end DESC)",
    "CREATE INDEX IF NOT EXISTS alerts_bucket_lookback_severity ON alerts (bucket_end DESC, lookback_seconds, severity_rank)",
    "CREATE TABLE IF NOT EXISTS email_notifications (
        id TEXT PRIMARY KEY,
        alert_type TEXT NOT NULL,
        source_ip TEXT NOT NULL,
        severity TEXT NOT NULL,
        ml_risk_score REAL,
        ml_anomaly_score REAL,
        ml_confidence REAL,
        recipients TEXT NOT NULL,
        email_subject TEXT NOT NULL,
        sent_at TEXT NOT NULL,
        deduplication_key TEXT NOT NULL UNIQUE
    )",
    "CREATE INDEX IF NOT EXISTS notifications_ip_type_sent ON email_notifications (source_ip, alert_type, sent_at DESC)",
    "CREATE TABLE IF NOT EXISTS blocked_ips (
        id TEXT PRIMARY KEY,
        ip TEXT NOT NULL,
        blocked_at TEXT NOT NULL,
        is_active INTEGER NOT NULL,
        reason TEXT,
        blocked_by TEXT NOT NULL,
        unblocked_at TEXT,
        unblocked_by TEXT
    )",
    "CREATE UNIQUE INDEX IF NOT EXISTS blocked_ips_one_active ON blocked_ips (ip) WHERE is_active = 1",
    "CREATE INDEX IF NOT EXISTS blocked_ips_ip_blocked_at ON blocked_ips (ip, blocked_at DESC)",
    "CREATE TABLE IF NOT EXISTS ip_reputation_cache (
        ip TEXT PRIMARY KEY,
        payload TEXT NOT NULL,
        cached_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ml_feature_cache (
        cache_key TEXT PRIMARY KEY,
        schema_hash TEXT NOT NULL,
        features TEXT NOT NULL,
        created_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS ml_predictions (
        id TEXT PRIMARY KEY,
        created_at TEXT NOT NULL,
        source_ip TEXT,
        log_source TEXT,
        event_type TEXT,
        threat_type_hint TEXT,
        severity_hint TEXT,
        anomaly_score REAL,
        predicted_label TEXT,
        confidence REAL,
        risk_score REAL,
        ml_available INTEGER NOT NULL,
        error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS ml_predictions_created_at ON ml_predictions (created_at DESC)",
    "CREATE INDEX IF NOT EXISTS ml_predictions_source_ip ON ml_predictions (source_ip, created_at DESC)",
    "CREATE TABLE IF NOT EXISTS ml_training_history (
        id TEXT PRIMARY KEY,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        status TEXT NOT NULL,
        requested TEXT NOT NULL,
        results TEXT,
        error TEXT
    )",
    "CREATE INDEX IF NOT EXISTS ml_training_started_at ON ml_training_history (started_at DESC)",
];

async fn apply_schema(pool: &DbPool) -> Result<(), StoreError> {
    for statement in SCHEMA {
        sqlx::query(statement).execute(pool).await?;
    }
    Ok(())
}
