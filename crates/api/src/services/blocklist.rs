//! Blocklist state over the store, fronting the firewall backend.
//!
//! At most one active record exists per IP (enforced by a partial unique
//! index); unblocking closes the active record in place so history is kept.
//! The keyed upsert doubles as the per-IP serialization point for firewall
//! mutation.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;

use firewall_common::database::DbPool;
use firewall_common::error::StoreError;
use firewall_common::store_time;

use crate::services::firewall::{FirewallBackend, FirewallError};

#[derive(Debug, Error)]
pub enum BlockError {
    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Serialize)]
pub struct BlockRecord {
    pub id: String,
    pub ip: String,
    pub blocked_at: DateTime<Utc>,
    pub is_active: bool,
    pub reason: Option<String>,
    pub blocked_by: String,
    pub unblocked_at: Option<DateTime<Utc>>,
    pub unblocked_by: Option<String>,
}

#[derive(sqlx::FromRow)]
struct BlockRow {
    id: String,
    ip: String,
    blocked_at: String,
    is_active: i64,
    reason: Option<String>,
    blocked_by: String,
    unblocked_at: Option<String>,
    unblocked_by: Option<String>,
}

impl TryFrom<BlockRow> for BlockRecord {
    type Error = StoreError;

    fn try_from(row: BlockRow) -> Result<Self, Self::Error> {
        Ok(BlockRecord {
            id: row.id,
            ip: row.ip,
            blocked_at: store_time::decode(&row.blocked_at)?,
            is_active: row.is_active != 0,
            reason: row.reason,
            blocked_by: row.blocked_by,
            unblocked_at: row.unblocked_at.as_deref().map(store_time::decode).transpose()?,
            unblocked_by: row.unblocked_by,
        })
    }
}

#[derive(Debug)]
pub struct BlockOutcome {
    pub ip: String,
    pub changed: bool,
    pub firewall_output: Option<String>,
}

pub struct BlocklistService {
    pool: DbPool,
    firewall: Arc<dyn FirewallBackend>,
}

impl BlocklistService {
    pub fn new(pool: DbPool, firewall: Arc<dyn FirewallBackend>) -> Self {
        BlocklistService { pool, firewall }
    }

    pub async fn is_blocked(&self, ip: &str) -> Result<bool, StoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM blocked_ips WHERE ip = ? AND is_active = 1")
                .bind(ip)
                .fetch_one(&self.pool)
                .await?;
        Ok(count > 0)
    }

    /// True while the IP sits inside the post-unblock cooldown window.
    pub async fn in_cooldown(&self, ip: &str, cooldown_hours: i64) -> Result<bool, StoreError> {
        let latest: Option<String> = sqlx::query_scalar(
            "SELECT unblocked_at FROM blocked_ips WHERE ip = ? AND unblocked_at IS NOT NULL \
             ORDER BY unblocked_at DESC LIMIT 1",
        )
        .bind(ip)
        .fetch_optional(&self.pool)
        .await?;

        let Some(raw) = latest else {
            return Ok(false);
        };
        let unblocked_at = store_time::decode(&raw)?;
        Ok(Utc::now() < unblocked_at + Duration::hours(cooldown_hours))
    }

    /// Deny traffic from the IP and record the block. Blocking an already
    /// active IP is a no-op success.
    pub async fn block_ip(
        &self,
        ip: &str,
        reason: Option<&str>,
        blocked_by: &str,
    ) -> Result<BlockOutcome, BlockError> {
        if self.is_blocked(ip).await? {
            tracing::debug!(ip, "block requested for already-active IP");
            return Ok(BlockOutcome {
                ip: ip.to_string(),
                changed: false,
                firewall_output: None,
            });
        }

        let outcome = self.firewall.deny(ip).await?;

        sqlx::query(
            "INSERT INTO blocked_ips (id, ip, blocked_at, is_active, reason, blocked_by) \
             VALUES (?, ?, ?, 1, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(ip)
        .bind(store_time::encode(&Utc::now()))
        .bind(reason)
        .bind(blocked_by)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        tracing::info!(ip, blocked_by, "IP blocked");
        Ok(BlockOutcome {
            ip: ip.to_string(),
            changed: true,
            firewall_output: Some(outcome.output),
        })
    }

    /// Remove the deny rule and close the active record. The record is
    /// updated even when the firewall rule was already gone.
    pub async fn unblock_ip(
        &self,
        ip: &str,
        unblocked_by: &str,
    ) -> Result<BlockOutcome, BlockError> {
        if !self.is_blocked(ip).await? {
            return Ok(BlockOutcome {
                ip: ip.to_string(),
                changed: false,
                firewall_output: None,
            });
        }

        let firewall_output = match self.firewall.allow(ip).await {
            Ok(outcome) => Some(outcome.output),
            Err(e) => {
                tracing::warn!(ip, error = %e, "firewall delete failed; closing record anyway");
                None
            }
        };

        sqlx::query(
            "UPDATE blocked_ips SET is_active = 0, unblocked_at = ?, unblocked_by = ? \
             WHERE ip = ? AND is_active = 1",
        )
        .bind(store_time::encode(&Utc::now()))
        .bind(unblocked_by)
        .bind(ip)
        .execute(&self.pool)
        .await
        .map_err(StoreError::from)?;

        tracing::info!(ip, unblocked_by, "IP unblocked");
        Ok(BlockOutcome {
            ip: ip.to_string(),
            changed: true,
            firewall_output,
        })
    }

    pub async fn list(&self, active_only: bool) -> Result<Vec<BlockRecord>, StoreError> {
        let sql = if active_only {
            "SELECT id, ip, blocked_at, is_active, reason, blocked_by, unblocked_at, unblocked_by \
             FROM blocked_ips WHERE is_active = 1 ORDER BY blocked_at DESC"
        } else {
            "SELECT id, ip, blocked_at, is_active, reason, blocked_by, unblocked_at, unblocked_by \
             FROM blocked_ips ORDER BY blocked_at DESC"
        };
        let rows: Vec<BlockRow> = sqlx::query_as(sql).fetch_all(&self.pool).await?;
        rows.into_iter().map(BlockRecord::try_from).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::firewall::NoopFirewall;
    use firewall_common::database::init_memory_db;

    async fn service() -> BlocklistService {
        let pool = init_memory_db().await.unwrap();
        BlocklistService::new(pool, Arc::new(NoopFirewall))
    }

    #[tokio::test]
    async fn test_block_then_unblock_lifecycle() {
        let service = service().await;
        assert!(!service.is_blocked("203.0.113.5").await.unwrap());

        let outcome = service
            .block_ip("203.0.113.5", Some("test"), "operator")
            .await
            .unwrap();
        assert!(outcome.changed);
        assert!(service.is_blocked("203.0.113.5").await.unwrap());

        let repeat = service
            .block_ip("203.0.113.5", Some("test"), "operator")
            .await
            .unwrap();
        assert!(!repeat.changed);

        let unblocked = service.unblock_ip("203.0.113.5", "operator").await.unwrap();
        assert!(unblocked.changed);
        assert!(!service.is_blocked("203.0.113.5").await.unwrap());

        // History retained with the unblock stamp.
        let history = service.list(false).await.unwrap();
        assert_eq!(history.len(), 1);
        assert!(history[0].unblocked_at.is_some());
        assert_eq!(history[0].unblocked_by.as_deref(), Some("operator"));
    }

    #[tokio::test]
    async fn test_unblock_without_block_is_noop() {
        let service = service().await;
        let outcome = service.unblock_ip("198.51.100.1", "operator").await.unwrap();
        assert!(!outcome.changed);
    }

    #[tokio::test]
    async fn test_cooldown_window() {
        let service = service().await;
        service.block_ip("203.0.113.6", None, "auto").await.unwrap();
        service.unblock_ip("203.0.113.6", "operator").await.unwrap();

        assert!(service.in_cooldown("203.0.113.6", 24).await.unwrap());
        assert!(!service.in_cooldown("203.0.113.6", 0).await.unwrap());
        assert!(!service.in_cooldown("203.0.113.99", 24).await.unwrap());
    }

    #[tokio::test]
    async fn test_reblock_creates_second_history_row() {
        let service = service().await;
        service.block_ip("203.0.113.7", None, "auto").await.unwrap();
        service.unblock_ip("203.0.113.7", "operator").await.unwrap();
        service.block_ip("203.0.113.7", None, "auto").await.unwrap();

        let history = service.list(false).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(service.list(true).await.unwrap().len(), 1);
    }
}
