//! Alert email delivery.
//!
//! `Mailer` is the transport seam; the SMTP implementation rides on lettre's
//! async transport. `EmailService` owns recipients, enablement, and the alert
//! body templates.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use lettre::message::{Mailbox, MultiPart};
use lettre::transport::smtp::authentication::Credentials;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use thiserror::Error;

use firewall_common::Severity;

use crate::config::EmailSettings;

#[derive(Debug, Error)]
pub enum EmailError {
    #[error("email transport error: {0}")]
    Transport(String),

    #[error("invalid mailbox address: {0}")]
    Address(String),
}

/// Transport contract: deliver one message to each recipient.
#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send(
        &self,
        subject: &str,
        html: &str,
        text: &str,
        recipients: &[String],
    ) -> Result<(), EmailError>;
}

/// SMTP transport via lettre.
pub struct SmtpMailer {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpMailer {
    pub fn from_settings(settings: &EmailSettings) -> Result<Self, EmailError> {
        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::relay(&settings.smtp_host)
            .map_err(|e| EmailError::Transport(e.to_string()))?
            .port(settings.smtp_port);
        if !settings.smtp_username.is_empty() {
            builder = builder.credentials(Credentials::new(
                settings.smtp_username.clone(),
                settings.smtp_password.clone(),
            ));
        }

        let from = settings
            .from_address
            .parse::<Mailbox>()
            .map_err(|e| EmailError::Address(e.to_string()))?;

        Ok(SmtpMailer {
            transport: builder.build(),
            from,
        })
    }
}

#[async_trait]
impl Mailer for SmtpMailer {
    async fn send(
        &self,
        subject: &str,
        html: &str,
        text: &str,
        recipients: &[String],
    ) -> Result<(), EmailError> {
        for recipient in recipients {
            let to = recipient
                .parse::<Mailbox>()
                .map_err(|e| EmailError::Address(e.to_string()))?;
            let message = Message::builder()
                .from(self.from.clone())
                .to(to)
                .subject(subject)
                .multipart(MultiPart::alternative_plain_html(
                    text.to_string(),
                    html.to_string(),
                ))
                .map_err(|e| EmailError::Transport(e.to_string()))?;
            self.transport
                .send(message)
                .await
                .map_err(|e| EmailError::Transport(e.to_string()))?;
        }
        Ok(())
    }
}

/// Alert context rendered into the notification email.
#[derive(Debug, Clone)]
pub struct AlertEmail {
    pub alert_type: String,
    pub severity: Severity,
    pub source_ip: String,
    pub description: String,
    pub ml_risk_score: Option<f64>,
    pub ml_anomaly_score: Option<f64>,
    pub ml_confidence: Option<f64>,
    pub count: Option<i64>,
    pub first_seen: Option<DateTime<Utc>>,
    pub last_seen: Option<DateTime<Utc>>,
}

pub fn subject_for(alert: &AlertEmail) -> String {
    format!(
        "[ALERT] {} {} detected from {}",
        alert.severity, alert.alert_type, alert.source_ip
    )
}

fn html_body(alert: &AlertEmail) -> String {
    let mut rows = vec![
        format!("<tr><td>Alert type</td><td>{}</td></tr>", alert.alert_type),
        format!("<tr><td>Severity</td><td>{}</td></tr>", alert.severity),
        format!("<tr><td>Source IP</td><td>{}</td></tr>", alert.source_ip),
    ];
    if let Some(count) = alert.count {
        rows.push(format!("<tr><td>Event count</td><td>{count}</td></tr>"));
    }
    if let Some(first) = alert.first_seen {
        rows.push(format!("<tr><td>First seen</td><td>{}</td></tr>", first.to_rfc3339()));
    }
    if let Some(last) = alert.last_seen {
        rows.push(format!("<tr><td>Last seen</td><td>{}</td></tr>", last.to_rfc3339()));
    }
    if let Some(risk) = alert.ml_risk_score {
        rows.push(format!("<tr><td>ML risk score</td><td>{risk:.1}</td></tr>"));
    }
    if let Some(anomaly) = alert.ml_anomaly_score {
        rows.push(format!("<tr><td>ML anomaly score</td><td>{anomaly:.3}</td></tr>"));
    }
    if let Some(confidence) = alert.ml_confidence {
        rows.push(format!("<tr><td>ML confidence</td><td>{confidence:.2}</td></tr>"));
    }

    format!(
        "<html><body><h2>Security alert: {}</h2><p>{}</p><table border=\"1\" cellpadding=\"4\">{}</table></body></html>",
        alert.alert_type,
        html_escape(&alert.description),
        rows.join("")
    )
}

fn text_body(alert: &AlertEmail) -> String {
    let mut lines = vec![
        format!("Security alert: {}", alert.alert_type),
        String::new(),
        alert.description.clone(),
        String::new(),
        format!("Severity:  {}", alert.severity),
        format!("Source IP: {}", alert.source_ip),
    ];
    if let Some(count) = alert.count {
        lines.push(format!("Events:    {count}"));
    }
    if let Some(first) = alert.first_seen {
        lines.push(format!("First seen: {}", first.to_rfc3339()));
    }
    if let Some(last) = alert.last_seen {
        lines.push(format!("Last seen:  {}", last.to_rfc3339()));
    }
    if let Some(risk) = alert.ml_risk_score {
        lines.push(format!("ML risk score: {risk:.1}"));
    }
    lines.join("\n")
}

fn html_escape(input: &str) -> String {
    input
        .replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
}

/// Alert email front-end carrying enablement and the recipient list.
pub struct EmailService {
    enabled: bool,
    recipients: Vec<String>,
    mailer: Option<Arc<dyn Mailer>>,
}

impl EmailService {
    pub fn new(enabled: bool, recipients: Vec<String>, mailer: Option<Arc<dyn Mailer>>) -> Self {
        EmailService {
            enabled,
            recipients,
            mailer,
        }
    }

    pub fn disabled() -> Self {
        EmailService {
            enabled: false,
            recipients: Vec::new(),
            mailer: None,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled && self.mailer.is_some() && !self.recipients.is_empty()
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    /// Render and dispatch one alert email. Returns whether the dispatch
    /// succeeded; failures are logged, never propagated.
    pub async fn send_alert_email(&self, alert: &AlertEmail) -> bool {
        if !self.enabled {
            return false;
        }
        let Some(mailer) = &self.mailer else {
            tracing::warn!("email enabled but no transport configured");
            return false;
        };
        if self.recipients.is_empty() {
            tracing::warn!("no email recipients configured; skipping send");
            return false;
        }

        let subject = subject_for(alert);
        let html = html_body(alert);
        let text = text_body(alert);
        match mailer.send(&subject, &html, &text, &self.recipients).await {
            Ok(()) => {
                tracing::info!(alert_type = %alert.alert_type, source_ip = %alert.source_ip, "alert email sent");
                true
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to send alert email");
                false
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Records sends instead of delivering them.
    #[derive(Default)]
    pub struct RecordingMailer {
        pub sent: Mutex<Vec<(String, Vec<String>)>>,
        pub fail: std::sync::atomic::AtomicBool,
    }

    #[async_trait]
    impl Mailer for RecordingMailer {
        async fn send(
            &self,
            subject: &str,
            _html: &str,
            _text: &str,
            recipients: &[String],
        ) -> Result<(), EmailError> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                return Err(EmailError::Transport("forced failure".to_string()));
            }
            self.sent
                .lock()
                .unwrap()
                .push((subject.to_string(), recipients.to_vec()));
            Ok(())
        }
    }
}
