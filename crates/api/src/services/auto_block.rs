//! Automatic IP blocking.
//!
//! Two predicates feed the decision: rule thresholds (severity tiers plus
//! per-attack counts) and ML scores. `require_ml_confirmation` switches the
//! combination from OR to AND. Already-blocked IPs and IPs inside the
//! post-unblock cooldown are skipped before either predicate runs.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;

use firewall_common::Severity;
use firewall_common::error::StoreError;
use firewall_ml::MlResult;

use crate::config::AutoBlockSettings;
use crate::services::blocklist::BlocklistService;
use crate::services::email::{AlertEmail, EmailService};

/// Labels the ML predicate treats as threats.
const THREAT_LABELS: [&str; 5] = ["BRUTE_FORCE", "DDOS", "PORT_SCAN", "MALICIOUS", "ATTACK"];

/// Attack counters extracted from a detection or a cached alert's details.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct AttackMetrics {
    pub total_attempts: Option<u64>,
    pub total_requests: Option<u64>,
    pub unique_ports_attempted: Option<u64>,
    #[serde(skip)]
    pub first_seen: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub last_seen: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub enum AutoBlockOutcome {
    Blocked(AutoBlockResult),
    Skipped { reason: String },
}

#[derive(Debug)]
pub struct AutoBlockResult {
    pub success: bool,
    pub ip: String,
    pub message: String,
    pub email_sent: bool,
    pub firewall_output: Option<String>,
}

pub struct AutoBlocker {
    settings: AutoBlockSettings,
    blocklist: Arc<BlocklistService>,
    email: Arc<EmailService>,
}

impl AutoBlocker {
    pub fn new(
        settings: AutoBlockSettings,
        blocklist: Arc<BlocklistService>,
        email: Arc<EmailService>,
    ) -> Self {
        AutoBlocker {
            settings,
            blocklist,
            email,
        }
    }

    /// Evaluate the policy and, if it fires, block the IP, record it, and
    /// send a notification.
    pub async fn evaluate_and_block(
        &self,
        threat_type: &str,
        severity: Severity,
        source_ip: &str,
        ml: Option<&MlResult>,
        metrics: Option<&AttackMetrics>,
    ) -> Result<AutoBlockOutcome, StoreError> {
        if !self.settings.enabled {
            return Ok(AutoBlockOutcome::Skipped {
                reason: "auto-blocking disabled".to_string(),
            });
        }

        if self.blocklist.is_blocked(source_ip).await? {
            return Ok(AutoBlockOutcome::Skipped {
                reason: "already blocked".to_string(),
            });
        }

        if self
            .blocklist
            .in_cooldown(source_ip, self.settings.cooldown_hours)
            .await?
        {
            return Ok(AutoBlockOutcome::Skipped {
                reason: "cooldown".to_string(),
            });
        }

        let (rules_hit, rules_reason) = self.rules_based_decision(threat_type, severity, metrics);
        let (ml_hit, ml_reason) = self.ml_based_decision(ml);

        let decision = if self.settings.require_ml_confirmation {
            if rules_hit && ml_hit {
                Some(format!("Rules: {rules_reason}; ML: {ml_reason}"))
            } else {
                None
            }
        } else if rules_hit {
            if ml_hit {
                Some(format!("Rules-based: {rules_reason}; ML confirmed: {ml_reason}"))
            } else {
                Some(format!("Rules-based: {rules_reason}"))
            }
        } else if ml_hit {
            Some(format!("ML-based: {ml_reason}"))
        } else {
            None
        };

        let Some(reason) = decision else {
            return Ok(AutoBlockOutcome::Skipped {
                reason: format!("thresholds not met. Rules: {rules_reason}; ML: {ml_reason}"),
            });
        };

        Ok(AutoBlockOutcome::Blocked(
            self.block(threat_type, severity, source_ip, &reason, ml, metrics)
                .await,
        ))
    }

    fn rules_based_decision(
        &self,
        threat_type: &str,
        severity: Severity,
        metrics: Option<&AttackMetrics>,
    ) -> (bool, String) {
        let tier_enabled = match severity {
            Severity::Critical => self.settings.block_critical,
            Severity::High => self.settings.block_high,
            Severity::Medium => self.settings.block_medium,
            Severity::Low => self.settings.block_low,
        };
        if tier_enabled {
            return (true, format!("{severity} severity {threat_type} detected"));
        }

        if let Some(metrics) = metrics {
            match threat_type {
                "BRUTE_FORCE" => {
                    let attempts = metrics.total_attempts.unwrap_or(0);
                    if attempts >= self.settings.brute_force_attempt_threshold {
                        return (
                            true,
                            format!(
                                "brute force: {attempts} attempts (threshold: {})",
                                self.settings.brute_force_attempt_threshold
                            ),
                        );
                    }
                }
                "DDOS" => {
                    let requests = metrics.total_requests.unwrap_or(0);
                    if requests >= self.settings.ddos_request_threshold {
                        return (
                            true,
                            format!(
                                "DDoS: {requests} requests (threshold: {})",
                                self.settings.ddos_request_threshold
                            ),
                        );
                    }
                }
                "PORT_SCAN" => {
                    let ports = metrics.unique_ports_attempted.unwrap_or(0);
                    if ports >= self.settings.port_scan_ports_threshold {
                        return (
                            true,
                            format!(
                                "port scan: {ports} ports (threshold: {})",
                                self.settings.port_scan_ports_threshold
                            ),
                        );
                    }
                }
                _ => {}
            }
        }

        (
            false,
            format!("rules thresholds not met (severity: {severity}, type: {threat_type})"),
        )
    }

    fn ml_based_decision(&self, ml: Option<&MlResult>) -> (bool, String) {
        let Some(ml) = ml else {
            return (false, "no ML data available".to_string());
        };
        if ml.risk_score.is_none() && ml.anomaly_score.is_none() {
            return (false, "no ML data available".to_string());
        }

        let mut reasons = Vec::new();
        let mut decision = false;

        if let Some(risk) = ml.risk_score {
            if risk >= self.settings.ml_risk_threshold {
                decision = true;
                reasons.push(format!("risk {risk:.1} >= {}", self.settings.ml_risk_threshold));
            } else {
                reasons.push(format!("risk {risk:.1} < {}", self.settings.ml_risk_threshold));
            }
        }

        if let Some(anomaly) = ml.anomaly_score {
            if anomaly >= self.settings.ml_anomaly_threshold {
                decision = true;
                reasons.push(format!(
                    "anomaly {anomaly:.3} >= {}",
                    self.settings.ml_anomaly_threshold
                ));
            } else {
                reasons.push(format!(
                    "anomaly {anomaly:.3} < {}",
                    self.settings.ml_anomaly_threshold
                ));
            }
        }

        if let Some(label) = &ml.predicted_label {
            if THREAT_LABELS.contains(&label.to_uppercase().as_str()) {
                if let Some(confidence) = ml.confidence {
                    if confidence >= self.settings.ml_confidence_threshold {
                        decision = true;
                        reasons.push(format!("label {label} (confidence {confidence:.2})"));
                    }
                }
            }
        }

        (decision, reasons.join("; "))
    }

    async fn block(
        &self,
        threat_type: &str,
        severity: Severity,
        source_ip: &str,
        reason: &str,
        ml: Option<&MlResult>,
        metrics: Option<&AttackMetrics>,
    ) -> AutoBlockResult {
        let block = match self
            .blocklist
            .block_ip(source_ip, Some(&format!("AUTO-BLOCK: {reason}")), "auto")
            .await
        {
            Ok(outcome) => outcome,
            Err(e) => {
                tracing::error!(ip = source_ip, error = %e, "auto-block failed");
                return AutoBlockResult {
                    success: false,
                    ip: source_ip.to_string(),
                    message: format!("failed to block IP: {e}"),
                    email_sent: false,
                    firewall_output: None,
                };
            }
        };

        let description = format!(
            "IP {source_ip} has been automatically blocked due to {} detection.\n\nBlocking reason: {reason}\n\nIf this is a false positive the IP can be unblocked from the dashboard.",
            threat_type.replace('_', " ").to_lowercase()
        );
        let email_sent = self
            .email
            .send_alert_email(&AlertEmail {
                alert_type: format!("AUTO_BLOCKED_{threat_type}"),
                severity,
                source_ip: source_ip.to_string(),
                description,
                ml_risk_score: ml.and_then(|m| m.risk_score),
                ml_anomaly_score: ml.and_then(|m| m.anomaly_score),
                ml_confidence: ml.and_then(|m| m.confidence),
                count: metrics.and_then(|m| {
                    m.total_attempts
                        .or(m.total_requests)
                        .or(m.unique_ports_attempted)
                        .map(|v| v as i64)
                }),
                first_seen: metrics.and_then(|m| m.first_seen),
                last_seen: metrics.and_then(|m| m.last_seen),
            })
            .await;

        tracing::info!(ip = source_ip, threat_type, %severity, email_sent, "IP auto-blocked");
        AutoBlockResult {
            success: true,
            ip: source_ip.to_string(),
            message: format!("IP {source_ip} automatically blocked due to {threat_type}"),
            email_sent,
            firewall_output: block.firewall_output,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::firewall::NoopFirewall;
    use firewall_common::database::init_memory_db;

    fn settings() -> AutoBlockSettings {
        AutoBlockSettings {
            enabled: true,
            block_critical: true,
            block_high: true,
            block_medium: false,
            block_low: false,
            ml_risk_threshold: 75.0,
            ml_anomaly_threshold: 0.7,
            ml_confidence_threshold: 0.7,
            require_ml_confirmation: false,
            brute_force_attempt_threshold: 20,
            ddos_request_threshold: 500,
            port_scan_ports_threshold: 25,
            cooldown_hours: 24,
        }
    }

    async fn blocker(settings: AutoBlockSettings) -> AutoBlocker {
        let pool = init_memory_db().await.unwrap();
        let blocklist = Arc::new(BlocklistService::new(pool, Arc::new(NoopFirewall)));
        AutoBlocker::new(settings, blocklist, Arc::new(EmailService::disabled()))
    }

    fn metrics(attempts: u64) -> AttackMetrics {
        AttackMetrics {
            total_attempts: Some(attempts),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_high_severity_triggers_block() {
        let blocker = blocker(settings()).await;
        let outcome = blocker
            .evaluate_and_block("BRUTE_FORCE", Severity::High, "203.0.113.5", None, Some(&metrics(25)))
            .await
            .unwrap();
        assert!(matches!(outcome, AutoBlockOutcome::Blocked(r) if r.success));
    }

    #[tokio::test]
    async fn test_attack_threshold_triggers_when_tier_disabled() {
        let mut s = settings();
        s.block_high = false;
        let blocker = blocker(s).await;
        let outcome = blocker
            .evaluate_and_block("BRUTE_FORCE", Severity::High, "203.0.113.5", None, Some(&metrics(25)))
            .await
            .unwrap();
        assert!(matches!(outcome, AutoBlockOutcome::Blocked(_)));

        let below = blocker
            .evaluate_and_block("BRUTE_FORCE", Severity::High, "203.0.113.6", None, Some(&metrics(10)))
            .await
            .unwrap();
        assert!(matches!(below, AutoBlockOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_repeat_block_is_skipped_then_cooldown_applies() {
        let blocker = blocker(settings()).await;
        let ip = "203.0.113.5";
        let m = metrics(25);

        let first = blocker
            .evaluate_and_block("BRUTE_FORCE", Severity::High, ip, None, Some(&m))
            .await
            .unwrap();
        assert!(matches!(first, AutoBlockOutcome::Blocked(_)));

        // Still active: skipped, not an error.
        let repeat = blocker
            .evaluate_and_block("BRUTE_FORCE", Severity::High, ip, None, Some(&m))
            .await
            .unwrap();
        assert!(matches!(repeat, AutoBlockOutcome::Skipped { ref reason } if reason == "already blocked"));

        // After unblock the cooldown window suppresses re-blocking.
        blocker.blocklist.unblock_ip(ip, "operator").await.unwrap();
        let cooled = blocker
            .evaluate_and_block("BRUTE_FORCE", Severity::High, ip, None, Some(&m))
            .await
            .unwrap();
        assert!(matches!(cooled, AutoBlockOutcome::Skipped { ref reason } if reason == "cooldown"));
    }

    #[tokio::test]
    async fn test_ml_predicate_alone_can_block() {
        let mut s = settings();
        s.block_high = false;
        s.block_critical = false;
        let blocker = blocker(s).await;

        let ml = MlResult {
            ml_enabled: true,
            ml_available: true,
            anomaly_score: Some(0.9),
            predicted_label: Some("NORMAL".to_string()),
            confidence: Some(0.5),
            risk_score: Some(40.0),
            reasoning: vec![],
            error: None,
        };
        let outcome = blocker
            .evaluate_and_block("BRUTE_FORCE", Severity::Medium, "198.51.100.9", Some(&ml), None)
            .await
            .unwrap();
        assert!(matches!(outcome, AutoBlockOutcome::Blocked(_)));
    }

    #[tokio::test]
    async fn test_require_ml_confirmation_needs_both() {
        let mut s = settings();
        s.require_ml_confirmation = true;
        let blocker = blocker(s).await;

        // Rules fire (HIGH tier) but no ML data: must skip.
        let outcome = blocker
            .evaluate_and_block("BRUTE_FORCE", Severity::High, "198.51.100.10", None, Some(&metrics(25)))
            .await
            .unwrap();
        assert!(matches!(outcome, AutoBlockOutcome::Skipped { .. }));
    }

    #[tokio::test]
    async fn test_disabled_actor_skips() {
        let mut s = settings();
        s.enabled = false;
        let blocker = blocker(s).await;
        let outcome = blocker
            .evaluate_and_block("BRUTE_FORCE", Severity::Critical, "198.51.100.11", None, None)
            .await
            .unwrap();
        assert!(matches!(outcome, AutoBlockOutcome::Skipped { .. }));
    }
}
