//! Service configuration loaded from environment variables.
//!
//! A `.env` file is honored when present. Every setting has a default so the
//! service starts in a development environment with no configuration at all.

use std::env;
use std::path::PathBuf;

use thiserror::Error;

use firewall_common::Severity;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {var}")]
    Invalid { var: String, value: String },
}

fn env_or(var: &str, default: &str) -> String {
    env::var(var).unwrap_or_else(|_| default.to_string())
}

fn env_bool(var: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => match raw.to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::Invalid {
                var: var.to_string(),
                value: raw,
            }),
        },
    }
}

fn env_parse<T: std::str::FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::Invalid {
            var: var.to_string(),
            value: raw,
        }),
    }
}

fn env_severity(var: &str, default: Severity) -> Result<Severity, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => Severity::parse(&raw).ok_or(ConfigError::Invalid {
            var: var.to_string(),
            value: raw,
        }),
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitSettings {
    pub requests: u32,
    pub window_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct RetentionSettings {
    pub enabled: bool,
    pub max_size_mb: u64,
    pub delete_size_mb: u64,
    pub interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct NotificationSettings {
    pub email_enabled: bool,
    pub severity_threshold: Severity,
    pub ml_risk_threshold: f64,
    pub rate_limit_minutes: i64,
    pub check_interval_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct EmailSettings {
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
    pub from_address: String,
    pub recipients: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AutoBlockSettings {
    pub enabled: bool,
    pub block_critical: bool,
    pub block_high: bool,
    pub block_medium: bool,
    pub block_low: bool,
    pub ml_risk_threshold: f64,
    pub ml_anomaly_threshold: f64,
    pub ml_confidence_threshold: f64,
    pub require_ml_confirmation: bool,
    pub brute_force_attempt_threshold: u64,
    pub ddos_request_threshold: u64,
    pub port_scan_ports_threshold: u64,
    pub cooldown_hours: i64,
}

#[derive(Debug, Clone)]
pub struct FirewallSettings {
    /// Privileged helper invocation, e.g. `sudo -n ufw`. Split on whitespace
    /// and executed as argv, never through a shell.
    pub command: Vec<String>,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone)]
pub struct MlSettings {
    pub enabled: bool,
    pub models_dir: PathBuf,
    pub store_predictions: bool,
    pub cache_features: bool,
    pub feature_cache_ttl_hours: i64,
    pub auto_retrain: bool,
    pub auto_retrain_interval_hours: u64,
}

/// A locally tailed log file.
#[derive(Debug, Clone)]
pub struct LiveSource {
    pub name: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_url: String,
    pub ingestion_api_key: String,
    pub rate_limit: RateLimitSettings,
    pub retention: RetentionSettings,
    pub notifications: NotificationSettings,
    pub email: EmailSettings,
    pub auto_block: AutoBlockSettings,
    pub firewall: FirewallSettings,
    pub ml: MlSettings,
    pub reputation_api_key: Option<String>,
    pub live_sources: Vec<LiveSource>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenv::dotenv().ok();

        let recipients = env_or("EMAIL_RECIPIENTS", "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let command: Vec<String> = env_or("FIREWALL_COMMAND", "sudo -n ufw")
            .split_whitespace()
            .map(str::to_string)
            .collect();

        let live_sources = parse_live_sources(&env_or("LIVE_LOG_SOURCES", ""))?;

        Ok(AppConfig {
            bind_addr: env_or("SERVER_BIND", "0.0.0.0:8000"),
            database_url: env_or("DATABASE_URL", "sqlite://firewall_analyzer.db"),
            ingestion_api_key: env_or("INGESTION_API_KEY", "default-api-key-change-in-production"),
            rate_limit: RateLimitSettings {
                requests: env_parse("RATE_LIMIT_REQUESTS", 100)?,
                window_seconds: env_parse("RATE_LIMIT_WINDOW", 60)?,
            },
            retention: RetentionSettings {
                enabled: env_bool("LOG_RETENTION_ENABLED", true)?,
                max_size_mb: env_parse("LOG_RETENTION_MAX_MB", 480)?,
                delete_size_mb: env_parse("LOG_RETENTION_DELETE_SIZE_MB", 5)?,
                interval_seconds: env_parse("LOG_RETENTION_INTERVAL_SECONDS", 300)?,
            },
            notifications: NotificationSettings {
                email_enabled: env_bool("EMAIL_ENABLED", false)?,
                severity_threshold: env_severity("NOTIFICATION_SEVERITY_THRESHOLD", Severity::High)?,
                ml_risk_threshold: env_parse("NOTIFICATION_ML_RISK_THRESHOLD", 70.0)?,
                rate_limit_minutes: env_parse("NOTIFICATION_RATE_LIMIT_MINUTES", 15)?,
                check_interval_seconds: env_parse("ALERT_CHECK_INTERVAL_SECONDS", 120)?,
            },
            email: EmailSettings {
                smtp_host: env_or("SMTP_HOST", "localhost"),
                smtp_port: env_parse("SMTP_PORT", 587)?,
                smtp_username: env_or("SMTP_USERNAME", ""),
                smtp_password: env_or("SMTP_PASSWORD", ""),
                from_address: env_or("EMAIL_FROM", "alerts@firewall-analyzer.local"),
                recipients,
            },
            auto_block: AutoBlockSettings {
                enabled: env_bool("AUTO_IP_BLOCKING_ENABLED", true)?,
                block_critical: env_bool("AUTO_BLOCK_CRITICAL", true)?,
                block_high: env_bool("AUTO_BLOCK_HIGH", true)?,
                block_medium: env_bool("AUTO_BLOCK_MEDIUM", false)?,
                block_low: env_bool("AUTO_BLOCK_LOW", false)?,
                ml_risk_threshold: env_parse("AUTO_BLOCK_ML_RISK_THRESHOLD", 75.0)?,
                ml_anomaly_threshold: env_parse("AUTO_BLOCK_ML_ANOMALY_THRESHOLD", 0.7)?,
                ml_confidence_threshold: env_parse("AUTO_BLOCK_ML_CONFIDENCE_THRESHOLD", 0.7)?,
                require_ml_confirmation: env_bool("AUTO_BLOCK_REQUIRE_ML", false)?,
                brute_force_attempt_threshold: env_parse("AUTO_BLOCK_BRUTE_FORCE_THRESHOLD", 20)?,
                ddos_request_threshold: env_parse("AUTO_BLOCK_DDOS_THRESHOLD", 500)?,
                port_scan_ports_threshold: env_parse("AUTO_BLOCK_PORT_SCAN_THRESHOLD", 25)?,
                cooldown_hours: env_parse("AUTO_BLOCK_COOLDOWN_HOURS", 24)?,
            },
            firewall: FirewallSettings {
                command,
                timeout_seconds: env_parse("FIREWALL_TIMEOUT_SECONDS", 15)?,
            },
            ml: MlSettings {
                enabled: env_bool("ML_ENABLED", true)?,
                models_dir: PathBuf::from(env_or("ML_MODELS_DIR", "ml_models")),
                store_predictions: env_bool("ML_STORE_PREDICTIONS", true)?,
                cache_features: env_bool("ML_CACHE_FEATURES", true)?,
                feature_cache_ttl_hours: env_parse("ML_FEATURE_CACHE_TTL_HOURS", 24)?,
                auto_retrain: env_bool("ML_AUTO_RETRAIN", false)?,
                auto_retrain_interval_hours: env_parse("ML_AUTO_RETRAIN_INTERVAL_HOURS", 168)?,
            },
            reputation_api_key: env::var("VIRUS_TOTAL_API_KEY").ok().filter(|k| !k.is_empty()),
            live_sources,
        })
    }
}

/// Parse `name=path,name=path` source declarations.
fn parse_live_sources(raw: &str) -> Result<Vec<LiveSource>, ConfigError> {
    let mut sources = Vec::new();
    for part in raw.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let Some((name, path)) = part.split_once('=') else {
            return Err(ConfigError::Invalid {
                var: "LIVE_LOG_SOURCES".to_string(),
                value: part.to_string(),
            });
        };
        sources.push(LiveSource {
            name: name.trim().to_string(),
            path: PathBuf::from(path.trim()),
        });
    }
    Ok(sources)
}
