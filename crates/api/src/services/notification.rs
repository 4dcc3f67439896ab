//! Alert notification pipeline.
//!
//! Gate order: enablement, deduplication, per-(IP, type) rate limit, severity
//! threshold, then the ML-informed send decision. A dispatched notification
//! is recorded under its deduplication key, which is what makes repeat
//! processing of the same alert a no-op.

use std::sync::Arc;

use chrono::{Duration, Utc};
use uuid::Uuid;

use firewall_common::database::DbPool;
use firewall_common::database::queries::latest_event_for_ip;
use firewall_common::error::StoreError;
use firewall_common::{Severity, store_time};
use firewall_detectors::AlertDoc;
use firewall_ml::{MlResult, MlService, ScoreContext};

use crate::config::NotificationSettings;
use crate::services::email::{AlertEmail, EmailService};

/// Stable deduplication key: sha256 over `alert_type|source_ip|bucket_end`.
pub fn deduplication_key(alert: &AlertDoc) -> String {
    let raw = format!(
        "{}|{}|{}",
        alert.alert_type,
        alert.source_ip,
        store_time::encode(&alert.bucket_end)
    );
    firewall_ml::artifacts::sha256_hex(&raw)
}

#[derive(Debug)]
pub struct NotificationOutcome {
    pub sent: bool,
    pub reason: String,
    pub ml: Option<MlResult>,
}

pub struct NotificationService {
    settings: NotificationSettings,
    email: Arc<EmailService>,
    ml: Arc<MlService>,
    pool: DbPool,
}

impl NotificationService {
    pub fn new(
        settings: NotificationSettings,
        email: Arc<EmailService>,
        ml: Arc<MlService>,
        pool: DbPool,
    ) -> Self {
        NotificationService {
            settings,
            email,
            ml,
            pool,
        }
    }

    /// Process one alert: apply the gates, score with ML, decide, dispatch,
    /// and record.
    pub async fn process_alert(&self, alert: &AlertDoc) -> Result<NotificationOutcome, StoreError> {
        if let Some(reason) = self.should_skip(alert).await? {
            tracing::debug!(
                alert_type = %alert.alert_type,
                source_ip = %alert.source_ip,
                reason = %reason,
                "notification skipped"
            );
            return Ok(NotificationOutcome {
                sent: false,
                reason,
                ml: None,
            });
        }

        let ml = self.score_alert(alert).await;
        let ml_risk = ml.risk_score;

        // CRITICAL always sends. HIGH sends unless ML is confident it is below
        // the risk threshold. MEDIUM/LOW send only on a high ML risk.
        let gated_reason = match alert.severity {
            Severity::Critical => None,
            Severity::High => match ml_risk {
                Some(risk) if risk < self.settings.ml_risk_threshold => Some(format!(
                    "ML risk score {risk:.1} below threshold {}",
                    self.settings.ml_risk_threshold
                )),
                _ => None,
            },
            Severity::Medium | Severity::Low => match ml_risk {
                Some(risk) if risk >= self.settings.ml_risk_threshold => None,
                Some(risk) => Some(format!(
                    "ML risk score {risk:.1} below threshold {}",
                    self.settings.ml_risk_threshold
                )),
                None => Some("ML risk unavailable for sub-HIGH alert".to_string()),
            },
        };
        if let Some(reason) = gated_reason {
            return Ok(NotificationOutcome {
                sent: false,
                reason,
                ml: Some(ml),
            });
        }

        let dedup_key = deduplication_key(alert);
        let sent = self
            .email
            .send_alert_email(&AlertEmail {
                alert_type: alert.alert_type.clone(),
                severity: alert.severity,
                source_ip: alert.source_ip.clone(),
                description: alert.description.clone(),
                ml_risk_score: ml.risk_score,
                ml_anomaly_score: ml.anomaly_score,
                ml_confidence: ml.confidence,
                count: Some(alert.count),
                first_seen: alert.first_seen,
                last_seen: alert.last_seen,
            })
            .await;

        if sent {
            self.record_notification(alert, &ml, &dedup_key).await?;
        }

        Ok(NotificationOutcome {
            sent,
            reason: if sent {
                "notification sent".to_string()
            } else {
                "failed to send email".to_string()
            },
            ml: Some(ml),
        })
    }

    /// The cheap gates that run before ML scoring. Returns a skip reason or
    /// `None` to proceed.
    async fn should_skip(&self, alert: &AlertDoc) -> Result<Option<String>, StoreError> {
        if !self.settings.email_enabled {
            return Ok(Some("email notifications disabled".to_string()));
        }

        let dedup_key = deduplication_key(alert);
        if self.notification_already_sent(&dedup_key).await? {
            return Ok(Some("notification already sent (deduplication)".to_string()));
        }

        if self.is_rate_limited(&alert.source_ip, &alert.alert_type).await? {
            return Ok(Some("rate limit exceeded".to_string()));
        }

        if alert.severity.sort_rank() > self.settings.severity_threshold.sort_rank() {
            return Ok(Some(format!(
                "severity {} below threshold {}",
                alert.severity, self.settings.severity_threshold
            )));
        }

        Ok(None)
    }

    async fn notification_already_sent(&self, dedup_key: &str) -> Result<bool, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM email_notifications WHERE deduplication_key = ?",
        )
        .bind(dedup_key)
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    async fn is_rate_limited(&self, source_ip: &str, alert_type: &str) -> Result<bool, StoreError> {
        let cutoff = Utc::now() - Duration::minutes(self.settings.rate_limit_minutes);
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM email_notifications \
             WHERE source_ip = ? AND alert_type = ? AND sent_at >= ?",
        )
        .bind(source_ip)
        .bind(alert_type)
        .bind(store_time::encode(&cutoff))
        .fetch_one(&self.pool)
        .await?;
        Ok(count > 0)
    }

    /// Score the alert using the most recent event for its IP as ML context.
    async fn score_alert(&self, alert: &AlertDoc) -> MlResult {
        let context_event = match latest_event_for_ip(&self.pool, &alert.source_ip).await {
            Ok(event) => event,
            Err(e) => {
                tracing::warn!(error = %e, "failed to load ML context event");
                None
            }
        };

        let ctx = match context_event {
            Some(event) => ScoreContext {
                source_ip: Some(alert.source_ip.clone()),
                threat_type_hint: Some(alert.alert_type.clone()),
                severity_hint: Some(alert.severity),
                timestamp: Some(event.timestamp),
                log_source: Some(event.log_source),
                event_type: Some(event.event_type),
                raw_log: Some(event.raw_log),
            },
            None => ScoreContext {
                source_ip: Some(alert.source_ip.clone()),
                threat_type_hint: Some(alert.alert_type.clone()),
                severity_hint: Some(alert.severity),
                timestamp: alert.last_seen,
                ..Default::default()
            },
        };

        self.ml.score(&self.pool, &ctx).await
    }

    async fn record_notification(
        &self,
        alert: &AlertDoc,
        ml: &MlResult,
        dedup_key: &str,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO email_notifications (id, alert_type, source_ip, severity, \
             ml_risk_score, ml_anomaly_score, ml_confidence, recipients, email_subject, \
             sent_at, deduplication_key) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&alert.alert_type)
        .bind(&alert.source_ip)
        .bind(alert.severity.as_str())
        .bind(ml.risk_score)
        .bind(ml.anomaly_score)
        .bind(ml.confidence)
        .bind(self.email.recipients().join(","))
        .bind(format!(
            "[ALERT] {} {} detected from {}",
            alert.severity, alert.alert_type, alert.source_ip
        ))
        .bind(store_time::encode(&Utc::now()))
        .bind(dedup_key)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
