//! Background alert monitor.
//!
//! Each tick materializes the 24h alert set through the cache, pushes every
//! alert through the notification pipeline, and hands blockable detections to
//! the auto-block actor. The worker is a catch-log-continue loop tied to
//! process lifetime.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use firewall_common::database::DbPool;
use firewall_common::error::StoreError;
use firewall_detectors::alert_cache::{
    DEFAULT_BUCKET_MINUTES, DEFAULT_LOOKBACK_SECONDS, get_or_compute_alerts,
};
use firewall_detectors::AlertDoc;

use crate::services::auto_block::{AttackMetrics, AutoBlockOutcome, AutoBlocker};
use crate::services::notification::{NotificationService, deduplication_key};

#[derive(Debug, Default)]
pub struct TickSummary {
    pub alerts_seen: usize,
    pub notifications_sent: usize,
    pub blocks_issued: usize,
}

pub struct AlertMonitor {
    pool: DbPool,
    notifications: Arc<NotificationService>,
    auto_blocker: Arc<AutoBlocker>,
    check_interval: Duration,
    processed: Mutex<HashSet<String>>,
}

impl AlertMonitor {
    pub fn new(
        pool: DbPool,
        notifications: Arc<NotificationService>,
        auto_blocker: Arc<AutoBlocker>,
        check_interval_seconds: u64,
    ) -> Self {
        AlertMonitor {
            pool,
            notifications,
            auto_blocker,
            check_interval: Duration::from_secs(check_interval_seconds),
            processed: Mutex::new(HashSet::new()),
        }
    }

    pub async fn run(self: Arc<Self>) {
        tracing::info!(interval = ?self.check_interval, "alert monitor started");
        let mut ticker = tokio::time::interval(self.check_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.tick().await {
                Ok(summary) => tracing::debug!(
                    alerts = summary.alerts_seen,
                    sent = summary.notifications_sent,
                    blocked = summary.blocks_issued,
                    "alert monitor tick complete"
                ),
                Err(e) => tracing::error!(error = %e, "alert monitor tick failed"),
            }
        }
    }

    /// One monitor pass. Public so tests can drive it without the loop.
    pub async fn tick(&self) -> Result<TickSummary, StoreError> {
        let (_, _, alerts) = get_or_compute_alerts(
            &self.pool,
            None,
            DEFAULT_LOOKBACK_SECONDS,
            DEFAULT_BUCKET_MINUTES,
        )
        .await?;

        let mut summary = TickSummary {
            alerts_seen: alerts.len(),
            ..Default::default()
        };

        for alert in &alerts {
            let key = deduplication_key(alert);
            {
                let processed = self.processed.lock().await;
                if processed.contains(&key) {
                    continue;
                }
            }

            match self.notifications.process_alert(alert).await {
                Ok(outcome) => {
                    if outcome.sent {
                        summary.notifications_sent += 1;
                        self.processed.lock().await.insert(key);
                    }

                    if let Err(e) = self
                        .maybe_auto_block(alert, outcome.ml.as_ref(), &mut summary)
                        .await
                    {
                        tracing::error!(
                            source_ip = %alert.source_ip,
                            error = %e,
                            "auto-block evaluation failed"
                        );
                    }
                }
                Err(e) => tracing::error!(
                    source_ip = %alert.source_ip,
                    error = %e,
                    "failed to process alert"
                ),
            }
        }

        Ok(summary)
    }

    async fn maybe_auto_block(
        &self,
        alert: &AlertDoc,
        ml: Option<&firewall_ml::MlResult>,
        summary: &mut TickSummary,
    ) -> Result<(), StoreError> {
        // Placeholder sources ("Multiple IPs") cannot be blocked.
        if alert.source_ip.parse::<std::net::IpAddr>().is_err() {
            return Ok(());
        }

        let metrics: AttackMetrics =
            serde_json::from_value(alert.details.clone()).unwrap_or_default();
        let metrics = AttackMetrics {
            first_seen: alert.first_seen,
            last_seen: alert.last_seen,
            ..metrics
        };

        let outcome = self
            .auto_blocker
            .evaluate_and_block(
                &alert.alert_type,
                alert.severity,
                &alert.source_ip,
                ml,
                Some(&metrics),
            )
            .await?;

        match outcome {
            AutoBlockOutcome::Blocked(result) if result.success => {
                summary.blocks_issued += 1;
            }
            AutoBlockOutcome::Blocked(result) => {
                tracing::warn!(ip = %result.ip, message = %result.message, "auto-block incomplete");
            }
            AutoBlockOutcome::Skipped { reason } => {
                tracing::debug!(ip = %alert.source_ip, reason = %reason, "auto-block skipped");
            }
        }
        Ok(())
    }
}
