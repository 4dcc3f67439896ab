//! End-to-end pipeline scenarios: ingestion through detection, alert
//! materialization, notification gating, and auto-blocking, against an
//! in-memory store with mock transport and firewall backends.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use axum::Router;
use axum::body::Body;
use axum::http::{Request, StatusCode, header};
use chrono::{DateTime, Duration, Timelike, Utc};
use tower::util::ServiceExt;

use firewall_api::config::{
    AppConfig, AutoBlockSettings, EmailSettings, FirewallSettings, MlSettings,
    NotificationSettings, RateLimitSettings, RetentionSettings,
};
use firewall_api::middleware::RateLimiter;
use firewall_api::routes::build_router;
use firewall_api::services::alert_monitor::AlertMonitor;
use firewall_api::services::auto_block::AutoBlocker;
use firewall_api::services::blocklist::BlocklistService;
use firewall_api::services::broadcaster::RawLogBroadcaster;
use firewall_api::services::email::{EmailError, EmailService, Mailer};
use firewall_api::services::firewall::{CommandOutcome, FirewallBackend, FirewallError};
use firewall_api::services::hot_cache::HotLogCache;
use firewall_api::services::notification::NotificationService;
use firewall_api::state::AppState;
use firewall_common::database::{DbPool, init_memory_db};
use firewall_common::{Severity, store_time};
use firewall_detectors::ReputationService;
use firewall_detectors::alert_cache::AlertDoc;
use firewall_ml::artifacts::write_json;
use firewall_ml::model::{AnomalyModel, Calibration, FeatureScaler};
use firewall_ml::features::{FEATURE_NAMES, schema_hash};
use firewall_ml::versioning::{ANOMALY_DETECTOR_FILE, FEATURE_SCALER_FILE};
use firewall_ml::{MlService, MlServiceConfig};

const API_KEY: &str = "test-ingest-key";

/// Mailer that records dispatches instead of sending them.
#[derive(Default)]
struct RecordingMailer {
    sent: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl Mailer for RecordingMailer {
    async fn send(
        &self,
        subject: &str,
        _html: &str,
        _text: &str,
        _recipients: &[String],
    ) -> Result<(), EmailError> {
        self.sent.lock().unwrap().push(subject.to_string());
        Ok(())
    }
}

/// Firewall backend that records denied IPs.
#[derive(Default)]
struct RecordingFirewall {
    denied: Mutex<Vec<String>>,
}

#[async_trait::async_trait]
impl FirewallBackend for RecordingFirewall {
    async fn deny(&self, ip: &str) -> Result<CommandOutcome, FirewallError> {
        self.denied.lock().unwrap().push(ip.to_string());
        Ok(CommandOutcome { changed: true, output: "Rule added".to_string() })
    }

    async fn allow(&self, _ip: &str) -> Result<CommandOutcome, FirewallError> {
        Ok(CommandOutcome { changed: true, output: "Rule deleted".to_string() })
    }
}

fn test_config(models_dir: PathBuf) -> AppConfig {
    AppConfig {
        bind_addr: "127.0.0.1:0".to_string(),
        database_url: "sqlite::memory:".to_string(),
        ingestion_api_key: API_KEY.to_string(),
        rate_limit: RateLimitSettings { requests: 100, window_seconds: 60 },
        retention: RetentionSettings {
            enabled: false,
            max_size_mb: 480,
            delete_size_mb: 5,
            interval_seconds: 300,
        },
        notifications: NotificationSettings {
            email_enabled: true,
            severity_threshold: Severity::High,
            ml_risk_threshold: 70.0,
            rate_limit_minutes: 15,
            check_interval_seconds: 120,
        },
        email: EmailSettings {
            smtp_host: "localhost".to_string(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
            from_address: "alerts@example.com".to_string(),
            recipients: vec!["ops@example.com".to_string()],
        },
        auto_block: AutoBlockSettings {
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
        },
        firewall: FirewallSettings {
            command: vec!["true".to_string()],
            timeout_seconds: 15,
        },
        ml: MlSettings {
            enabled: false,
            models_dir,
            store_predictions: false,
            cache_features: false,
            feature_cache_ttl_hours: 24,
            auto_retrain: false,
            auto_retrain_interval_hours: 168,
        },
        reputation_api_key: None,
        live_sources: Vec::new(),
    }
}

struct Harness {
    pool: DbPool,
    router: Router,
    state: AppState,
    mailer: Arc<RecordingMailer>,
    firewall: Arc<RecordingFirewall>,
}

async fn harness(models_dir: PathBuf, ml_enabled: bool) -> Harness {
    let pool = init_memory_db().await.unwrap();
    let mut config = test_config(models_dir);
    config.ml.enabled = ml_enabled;

    let ml = Arc::new(MlService::new(MlServiceConfig {
        enabled: config.ml.enabled,
        models_dir: config.ml.models_dir.clone(),
        store_predictions: config.ml.store_predictions,
        cache_features: config.ml.cache_features,
        feature_cache_ttl_hours: config.ml.feature_cache_ttl_hours,
    }));

    let mailer = Arc::new(RecordingMailer::default());
    let email = Arc::new(EmailService::new(
        config.notifications.email_enabled,
        config.email.recipients.clone(),
        Some(mailer.clone() as Arc<dyn Mailer>),
    ));

    let firewall = Arc::new(RecordingFirewall::default());
    let blocklist = Arc::new(BlocklistService::new(
        pool.clone(),
        firewall.clone() as Arc<dyn FirewallBackend>,
    ));
    let auto_blocker = Arc::new(AutoBlocker::new(
        config.auto_block.clone(),
        Arc::clone(&blocklist),
        Arc::clone(&email),
    ));
    let notifications = Arc::new(NotificationService::new(
        config.notifications.clone(),
        Arc::clone(&email),
        Arc::clone(&ml),
        pool.clone(),
    ));

    let config = Arc::new(config);
    let state = AppState {
        pool: pool.clone(),
        config: Arc::clone(&config),
        rate_limiter: Arc::new(RateLimiter::new(
            config.rate_limit.requests,
            config.rate_limit.window_seconds,
        )),
        broadcaster: Arc::new(RawLogBroadcaster::new()),
        hot_cache: Arc::new(HotLogCache::with_defaults()),
        ml,
        reputation: Arc::new(ReputationService::new(None)),
        email,
        blocklist,
        auto_blocker,
        notifications,
    };

    Harness {
        pool,
        router: build_router(state.clone()),
        state,
        mailer,
        firewall,
    }
}

fn syslog_stamp(at: DateTime<Utc>) -> String {
    at.format("%b %d %H:%M:%S").to_string()
}

async fn ingest(router: &Router, key: &str, logs: &[String], source: Option<&str>) -> (StatusCode, serde_json::Value) {
    let body = serde_json::json!({ "logs": logs, "log_source": source });
    let response = router
        .clone()
        .oneshot(
            Request::post("/api/logs/ingest")
                .header("X-API-Key", key)
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!({}));
    (status, value)
}

async fn get_json(router: &Router, uri: &str) -> (StatusCode, serde_json::Value) {
    let response = router
        .clone()
        .oneshot(Request::get(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::json!({}));
    (status, value)
}

/// Timestamps for test lines stay well inside the detector's default 24h
/// window while avoiding "now" so window math is deterministic.
fn base_time() -> DateTime<Utc> {
    (Utc::now() - Duration::hours(2)).with_nanosecond(0).unwrap()
}

#[tokio::test]
async fn test_ingest_auth_contract() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;
    let lines = vec!["Jan 10 09:00:00 host sshd[1]: Failed password for admin from 203.0.113.1 port 22 ssh2".to_string()];

    // Missing key.
    let response = h
        .router
        .clone()
        .oneshot(
            Request::post("/api/logs/ingest")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::json!({ "logs": lines }).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong key.
    let (status, _) = ingest(&h.router, "wrong-key", &lines, None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    // Empty batch.
    let (status, _) = ingest(&h.router, API_KEY, &[], None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Oversized batch.
    let oversized: Vec<String> = (0..1001).map(|i| format!("line {i}")).collect();
    let (status, _) = ingest(&h.router, API_KEY, &oversized, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Valid batch with partial success.
    let mixed = vec![lines[0].clone(), "unparsable garbage".to_string()];
    let (status, body) = ingest(&h.router, API_KEY, &mixed, Some("auth.log")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["ingested_count"], 1);
    assert_eq!(body["failed_count"], 1);
    assert_eq!(body["total_received"], 2);
}

#[tokio::test]
async fn test_ingest_rate_limit() {
    let dir = tempfile::tempdir().unwrap();
    let mut h = harness(dir.path().to_path_buf(), false).await;
    // Rebuild the router with a tiny rate limit.
    h.state.rate_limiter = Arc::new(RateLimiter::new(2, 60));
    let router = build_router(h.state.clone());

    let lines = vec!["Jan 10 09:00:00 host sshd[1]: Failed password for admin from 203.0.113.1 port 22 ssh2".to_string()];
    for _ in 0..2 {
        let (status, _) = ingest(&router, API_KEY, &lines, Some("auth.log")).await;
        assert_eq!(status, StatusCode::OK);
    }
    let (status, _) = ingest(&router, API_KEY, &lines, Some("auth.log")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
}

#[tokio::test]
async fn test_scenario_brute_force() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    // 25 failed logins spaced 30s apart, all within 14 minutes.
    let t0 = base_time();
    let lines: Vec<String> = (0..25)
        .map(|i| {
            format!(
                "{} host sshd[77]: Failed password for admin from 192.168.1.100 port {} ssh2",
                syslog_stamp(t0 + Duration::seconds(30 * i)),
                40000 + i
            )
        })
        .collect();
    let (status, body) = ingest(&h.router, API_KEY, &lines, Some("auth.log")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ingested_count"], 25);

    let (status, body) = get_json(
        &h.router,
        "/api/threats/brute-force?threshold=5&time_window_minutes=15",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    let detection = &body["detections"][0];
    assert_eq!(detection["source_ip"], "192.168.1.100");
    assert_eq!(detection["total_attempts"], 25);
    assert_eq!(detection["severity"], "HIGH");
    let windows = detection["attack_windows"].as_array().unwrap();
    assert!(!windows.is_empty());
    assert!(windows.iter().all(|w| w["attempt_count"].as_u64().unwrap() >= 5));
}

#[tokio::test]
async fn test_scenario_single_ip_flood() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    // 120 UFW lines within 59 seconds, recent enough for the flood
    // detector's default one-hour window.
    let t0 = (Utc::now() - Duration::minutes(30)).with_nanosecond(0).unwrap();
    let lines: Vec<String> = (0..120)
        .map(|i| {
            format!(
                "{} host kernel: [UFW BLOCK] IN=eth0 OUT= SRC=192.168.1.300 DST=10.0.0.2 PROTO=TCP SPT=4000 DPT=80",
                syslog_stamp(t0 + Duration::seconds(i / 2)),
            )
        })
        .collect();
    let (status, body) = ingest(&h.router, API_KEY, &lines, Some("ufw.log")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ingested_count"], 120);

    let (status, body) = get_json(
        &h.router,
        "/api/threats/ddos?single_ip_threshold=100&time_window_seconds=60",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    let detection = &body["detections"][0];
    assert_eq!(detection["attack_type"], "SINGLE_IP_FLOOD");
    assert_eq!(detection["source_ip"], "192.168.1.300");
    assert_eq!(detection["total_requests"], 120);
    assert!(detection["peak_request_rate"].as_f64().unwrap() >= 100.0);
    assert!(Severity::parse(detection["severity"].as_str().unwrap()).is_some());
}

#[tokio::test]
async fn test_scenario_port_scan() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    // 30 probes to 30 distinct ports over 9 minutes.
    let t0 = base_time();
    let lines: Vec<String> = (0..30)
        .map(|i| {
            format!(
                "{} host kernel: [99.1] IN=eth0 OUT= SRC=10.0.0.7 DST=10.0.0.2 PROTO=TCP SPT=55555 DPT={} SYN",
                syslog_stamp(t0 + Duration::seconds(18 * i)),
                2000 + i
            )
        })
        .collect();
    let (status, body) = ingest(&h.router, API_KEY, &lines, Some("iptables")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ingested_count"], 30);

    let (status, body) = get_json(
        &h.router,
        "/api/threats/port-scan?unique_ports_threshold=10&time_window_minutes=10&min_total_attempts=20",
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    let detection = &body["detections"][0];
    assert_eq!(detection["source_ip"], "10.0.0.7");
    assert_eq!(detection["unique_ports_attempted"], 30);
    assert_eq!(detection["severity"], "HIGH");
}

#[tokio::test]
async fn test_scenario_alert_bucket_reuse() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    let t0 = base_time();
    let lines: Vec<String> = (0..8)
        .map(|i| {
            format!(
                "{} host sshd[5]: Failed password for root from 203.0.113.77 port 22 ssh2",
                syslog_stamp(t0 + Duration::seconds(20 * i)),
            )
        })
        .collect();
    ingest(&h.router, API_KEY, &lines, Some("auth.log")).await;

    let (_, first) = get_json(&h.router, "/api/alerts").await;
    assert_eq!(first["count"], 1);

    // Second call inside the freshness window: same set by key, identical
    // computed_at (no detector work happened).
    let (_, second) = get_json(&h.router, "/api/alerts").await;
    assert_eq!(first["alerts"], second["alerts"]);
}

#[tokio::test]
async fn test_csv_export_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    let t0 = base_time();
    let lines: Vec<String> = (0..25)
        .map(|i| {
            format!(
                "{} host sshd[77]: Failed password for admin from 192.168.1.100 port 401{} ssh2",
                syslog_stamp(t0 + Duration::seconds(30 * i)),
                i % 10
            )
        })
        .collect();
    ingest(&h.router, API_KEY, &lines, Some("auth.log")).await;

    let response = h
        .router
        .clone()
        .oneshot(
            Request::get("/api/threats/brute-force?format=csv")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    assert!(bytes.starts_with(b"\xef\xbb\xbf"));

    let text = String::from_utf8(bytes[3..].to_vec()).unwrap();
    let mut reader = csv::Reader::from_reader(text.as_bytes());
    let record = reader.records().next().unwrap().unwrap();
    assert_eq!(&record[0], "192.168.1.100");
    assert_eq!(&record[1], "25");
    assert_eq!(&record[6], "HIGH");
}

fn make_alert(severity: Severity, source_ip: &str, bucket_end: DateTime<Utc>) -> AlertDoc {
    let now = Utc::now();
    AlertDoc {
        bucket_end,
        lookback_seconds: 86_400,
        alert_type: "BRUTE_FORCE".to_string(),
        source_ip: source_ip.to_string(),
        severity,
        first_seen: Some(now - Duration::minutes(10)),
        last_seen: Some(now),
        count: 25,
        description: "Brute force attack: 25 failed login attempts".to_string(),
        details: serde_json::json!({"total_attempts": 25}),
        computed_at: now,
    }
}

/// Write ML artifacts whose anomaly calibration pins the anomaly score, which
/// pins the risk score for a hinted BRUTE_FORCE alert.
fn write_pinned_anomaly_models(dir: &std::path::Path, anomaly: f64) {
    let n = FEATURE_NAMES.len();
    let scaler = FeatureScaler {
        schema_hash: schema_hash(),
        features: FEATURE_NAMES.iter().map(|s| s.to_string()).collect(),
        mean: vec![0.0; n],
        std: vec![1.0; n],
    };
    write_json(&dir.join(FEATURE_SCALER_FILE), &scaler).unwrap();

    // Raw scores for any input land well above zero; the calibration below
    // maps everything to 0.0 or to 1.0.
    let calibration = if anomaly >= 0.5 {
        Calibration { q_low: -2.0, q_high: -1.0 }
    } else {
        Calibration { q_low: 1.0e9, q_high: 2.0e9 }
    };
    write_json(
        &dir.join(ANOMALY_DETECTOR_FILE),
        &AnomalyModel { weights: vec![1.0; n], bias: 0.0, calibration },
    )
    .unwrap();
}

#[tokio::test]
async fn test_scenario_notification_gating() {
    let dir = tempfile::tempdir().unwrap();

    // Low anomaly: risk = 25.2 for a MEDIUM brute-force alert, below 70.
    write_pinned_anomaly_models(dir.path(), 0.0);
    let h = harness(dir.path().to_path_buf(), true).await;
    let mut settings = h.state.config.notifications.clone();
    settings.severity_threshold = Severity::Medium;
    let notifications = NotificationService::new(
        settings,
        Arc::new(EmailService::new(
            true,
            vec!["ops@example.com".to_string()],
            Some(h.mailer.clone() as Arc<dyn Mailer>),
        )),
        Arc::clone(&h.state.ml),
        h.pool.clone(),
    );

    let bucket_a = Utc::now() - Duration::minutes(5);
    let alert = make_alert(Severity::Medium, "203.0.113.40", bucket_a);
    let outcome = notifications.process_alert(&alert).await.unwrap();
    assert!(!outcome.sent);
    assert!(outcome.reason.contains("below threshold"));
    assert!(h.mailer.sent.lock().unwrap().is_empty());

    // Raise the anomaly calibration so risk = 80.2: the same alert now sends.
    write_pinned_anomaly_models(dir.path(), 1.0);
    h.state.ml.initialize(true);
    let outcome = notifications.process_alert(&alert).await.unwrap();
    assert!(outcome.sent, "expected send, got: {}", outcome.reason);
    assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);

    // Re-processing the identical alert is suppressed by deduplication.
    let outcome = notifications.process_alert(&alert).await.unwrap();
    assert!(!outcome.sent);
    assert!(outcome.reason.contains("deduplication"));

    // A new bucket for the same (ip, type) within 15 minutes hits the rate limit.
    let alert_b = make_alert(Severity::Medium, "203.0.113.40", bucket_a + Duration::minutes(5));
    let outcome = notifications.process_alert(&alert_b).await.unwrap();
    assert!(!outcome.sent);
    assert!(outcome.reason.contains("rate limit"));
    assert_eq!(h.mailer.sent.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_scenario_monitor_notifies_and_auto_blocks() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    // A HIGH brute-force detection: 25 attempts over 12 minutes.
    let t0 = base_time();
    let lines: Vec<String> = (0..25)
        .map(|i| {
            format!(
                "{} host sshd[9]: Failed password for admin from 203.0.113.5 port 4242 ssh2",
                syslog_stamp(t0 + Duration::seconds(30 * i)),
            )
        })
        .collect();
    ingest(&h.router, API_KEY, &lines, Some("auth.log")).await;

    let monitor = AlertMonitor::new(
        h.pool.clone(),
        Arc::clone(&h.state.notifications),
        Arc::clone(&h.state.auto_blocker),
        120,
    );

    let summary = monitor.tick().await.unwrap();
    assert_eq!(summary.alerts_seen, 1);
    // HIGH + ML unavailable: notification sent; HIGH tier: auto-blocked.
    assert_eq!(summary.notifications_sent, 1);
    assert_eq!(summary.blocks_issued, 1);
    assert!(h.state.blocklist.is_blocked("203.0.113.5").await.unwrap());
    assert_eq!(h.firewall.denied.lock().unwrap().as_slice(), ["203.0.113.5"]);
    // Block notification email plus the alert notification email.
    assert_eq!(h.mailer.sent.lock().unwrap().len(), 2);

    // A second tick is fully idempotent: dedup suppresses the notification
    // and the active block suppresses the actor.
    let summary = monitor.tick().await.unwrap();
    assert_eq!(summary.notifications_sent, 0);
    assert_eq!(summary.blocks_issued, 0);
    assert_eq!(h.mailer.sent.lock().unwrap().len(), 2);
    assert_eq!(h.firewall.denied.lock().unwrap().len(), 1);

    // Notification record carries the dedup key exactly once.
    let recorded: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM email_notifications")
        .fetch_one(&h.pool)
        .await
        .unwrap();
    assert_eq!(recorded, 1);
}

#[tokio::test]
async fn test_dashboard_summary_shape() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    let t0 = base_time();
    let lines: Vec<String> = (0..25)
        .map(|i| {
            format!(
                "{} host sshd[9]: Failed password for admin from 198.51.100.30 port 4242 ssh2",
                syslog_stamp(t0 + Duration::seconds(30 * i)),
            )
        })
        .collect();
    ingest(&h.router, API_KEY, &lines, Some("auth.log")).await;

    let (status, body) = get_json(&h.router, "/api/dashboard/summary").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["system_health"]["db_status"], "healthy");
    assert_eq!(body["system_health"]["logs_24h"], 25);
    assert!(body["system_health"]["last_log_timestamp"].is_string());
    assert_eq!(body["top_source_ips"][0]["ip"], "198.51.100.30");
    assert_eq!(body["top_destination_ports"][0]["port"], 22);
    assert_eq!(body["threat_counts_by_type"]["SSH_FAILED_LOGIN"], 25);
    assert_eq!(body["threat_counts_by_severity"]["HIGH"], 25);
    assert!(!body["hourly_event_counts"].as_object().unwrap().is_empty());
    // The HIGH brute-force alert appears among active alerts.
    assert_eq!(body["active_alerts"][0]["alert_type"], "BRUTE_FORCE");
}

#[tokio::test]
async fn test_blocking_routes() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    let response = h
        .router
        .clone()
        .oneshot(
            Request::post("/api/blocking/block")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(
                    serde_json::json!({"ip": "203.0.113.9", "reason": "manual test"}).to_string(),
                ))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let (_, list) = get_json(&h.router, "/api/blocking/list").await;
    assert_eq!(list["count"], 1);
    assert_eq!(list["blocked"][0]["ip"], "203.0.113.9");
    assert_eq!(list["blocked"][0]["blocked_by"], "manual");

    // Invalid address is rejected at the boundary.
    let response = h
        .router
        .clone()
        .oneshot(
            Request::post("/api/blocking/block")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::json!({"ip": "not-an-ip"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);

    let response = h
        .router
        .clone()
        .oneshot(
            Request::post("/api/blocking/unblock")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(serde_json::json!({"ip": "203.0.113.9"}).to_string()))
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let (_, list) = get_json(&h.router, "/api/blocking/list").await;
    assert_eq!(list["count"], 0);
}

#[tokio::test]
async fn test_live_cache_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    firewall_api::services::tailer::process_live_line(
        &h.pool,
        &h.state.broadcaster,
        &h.state.hot_cache,
        "auth",
        "Jan 10 09:00:00 host sshd[1]: Failed password for admin from 203.0.113.1 port 22 ssh2",
    )
    .await;

    let (status, body) = get_json(&h.router, "/api/live/cache?source=auth").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["count"], 1);
    assert!(body["lines"][0].as_str().unwrap().contains("Failed password"));

    let (_, all) = get_json(&h.router, "/api/live/cache").await;
    assert_eq!(all["source"], "all");
    assert_eq!(all["count"], 1);
}

#[tokio::test]
async fn test_store_timestamps_round_trip_through_api() {
    // Export-then-parse style check: what goes in through the parser comes
    // back out with identical field values.
    let dir = tempfile::tempdir().unwrap();
    let h = harness(dir.path().to_path_buf(), false).await;

    let t0 = base_time();
    let line = format!(
        "{} host sshd[1]: Failed password for invalid user oracle from 203.0.113.88 port 51515 ssh2",
        syslog_stamp(t0)
    );
    ingest(&h.router, API_KEY, &[line.clone()], Some("auth.log")).await;

    let event = firewall_common::database::queries::latest_event_for_ip(&h.pool, "203.0.113.88")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.username.as_deref(), Some("oracle"));
    assert_eq!(event.destination_port, Some(22));
    assert_eq!(event.raw_log, line);
    assert_eq!(store_time::decode(&store_time::encode(&event.timestamp)).unwrap(), event.timestamp);
}
