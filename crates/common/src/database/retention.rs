//! Size-bounded retention for the event store.
//!
//! When the estimated store size exceeds the configured cap, the oldest
//! events are deleted in batches sized to free roughly `delete_size_mb` per
//! cycle, until the size is back at or below the cap.

use serde::Serialize;

use super::DbPool;
use crate::error::StoreError;

/// Fixed per-row overhead added to the raw line length when estimating size.
const DOC_OVERHEAD_BYTES: f64 = 180.0;

const MIN_BATCH: i64 = 100;
const MAX_BATCH: i64 = 10_000;

#[derive(Debug, Serialize)]
pub struct RetentionReport {
    pub deleted_docs: u64,
    pub size_before_bytes: u64,
    pub size_after_bytes: u64,
    pub max_size_mb: u64,
}

async fn estimated_size(pool: &DbPool) -> Result<(i64, f64, u64), StoreError> {
    let (count, avg_raw): (i64, f64) =
        sqlx::query_as("SELECT COUNT(*), COALESCE(AVG(LENGTH(raw_log)), 0.0) FROM events")
            .fetch_one(pool)
            .await?;
    let avg_doc = avg_raw + DOC_OVERHEAD_BYTES;
    let total = (count as f64 * avg_doc) as u64;
    Ok((count, avg_doc, total))
}

/// Enforce the retention policy once. Deletion happens oldest-first by
/// timestamp; the batch size is estimated from the average document size with
/// a 20% buffer and clamped to keep each cycle bounded.
pub async fn enforce_retention(
    pool: &DbPool,
    max_size_mb: u64,
    delete_size_mb: u64,
) -> Result<RetentionReport, StoreError> {
    let max_bytes = max_size_mb * 1024 * 1024;
    let delete_target_bytes = delete_size_mb * 1024 * 1024;

    let (_, _, size_before) = estimated_size(pool).await?;
    let mut current = size_before;
    let mut deleted_total: u64 = 0;

    while current > max_bytes {
        let excess = current - max_bytes;
        let target = excess.max(delete_target_bytes);

        let (_, avg_doc, _) = estimated_size(pool).await?;
        let estimated_docs = ((target as f64 / avg_doc.max(1.0)) * 1.2) as i64;
        let batch = estimated_docs.clamp(MIN_BATCH, MAX_BATCH);

        let result = sqlx::query(
            "DELETE FROM events WHERE id IN \
             (SELECT id FROM events ORDER BY timestamp ASC LIMIT ?)",
        )
        .bind(batch)
        .execute(pool)
        .await?;

        let deleted = result.rows_affected();
        deleted_total += deleted;
        if deleted == 0 {
            break;
        }

        let (_, _, size) = estimated_size(pool).await?;
        current = size;
    }

    Ok(RetentionReport {
        deleted_docs: deleted_total,
        size_before_bytes: size_before,
        size_after_bytes: current,
        max_size_mb,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::{init_memory_db, queries::insert_events};
    use crate::{Event, Severity, event_type};
    use chrono::{Duration, Utc};

    async fn seed(pool: &DbPool, count: usize) {
        let line = "x".repeat(1024);
        let events: Vec<Event> = (0..count)
            .map(|i| {
                Event::new(
                    Utc::now() - Duration::minutes(count as i64 - i as i64),
                    format!("10.0.{}.{}", i / 250, i % 250),
                    "syslog",
                    event_type::SYSLOG_ENTRY,
                    Severity::Low,
                    &line,
                )
            })
            .collect();
        insert_events(pool, &events).await.unwrap();
    }

    #[tokio::test]
    async fn test_retention_noop_under_cap() {
        let pool = init_memory_db().await.unwrap();
        seed(&pool, 10).await;
        let report = enforce_retention(&pool, 100, 1).await.unwrap();
        assert_eq!(report.deleted_docs, 0);
    }

    #[tokio::test]
    async fn test_retention_deletes_oldest_until_under_cap() {
        let pool = init_memory_db().await.unwrap();
        // ~1.2KB per doc * 2000 docs ≈ 2.4MB, cap at 1MB.
        seed(&pool, 2000).await;
        let report = enforce_retention(&pool, 1, 1).await.unwrap();
        assert!(report.deleted_docs > 0);
        assert!(report.size_after_bytes <= 1024 * 1024);

        // Oldest rows went first: the newest event must survive.
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM events")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert!(remaining > 0 && remaining < 2000);
    }
}
