use std::net::SocketAddr;
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use firewall_api::config::AppConfig;
use firewall_api::routes::build_router;
use firewall_api::services::alert_monitor::AlertMonitor;
use firewall_api::services::auto_block::AutoBlocker;
use firewall_api::services::blocklist::BlocklistService;
use firewall_api::services::broadcaster::RawLogBroadcaster;
use firewall_api::services::email::{EmailService, Mailer, SmtpMailer};
use firewall_api::services::firewall::UfwFirewall;
use firewall_api::services::hot_cache::HotLogCache;
use firewall_api::services::notification::NotificationService;
use firewall_api::services::tailer::spawn_tailers;
use firewall_api::services::workers::{spawn_auto_retrain_worker, spawn_retention_worker};
use firewall_api::middleware::RateLimiter;
use firewall_api::state::AppState;
use firewall_common::database::init_db;
use firewall_detectors::ReputationService;
use firewall_ml::{MlService, MlServiceConfig};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Arc::new(AppConfig::from_env()?);

    tracing::info!(database = %config.database_url, "starting firewall analyzer API");
    let pool = init_db(&config.database_url).await?;

    let ml = Arc::new(MlService::new(MlServiceConfig {
        enabled: config.ml.enabled,
        models_dir: config.ml.models_dir.clone(),
        store_predictions: config.ml.store_predictions,
        cache_features: config.ml.cache_features,
        feature_cache_ttl_hours: config.ml.feature_cache_ttl_hours,
    }));
    ml.initialize(false);

    let mailer: Option<Arc<dyn Mailer>> = if config.notifications.email_enabled {
        match SmtpMailer::from_settings(&config.email) {
            Ok(mailer) => Some(Arc::new(mailer)),
            Err(e) => {
                tracing::error!(error = %e, "failed to configure SMTP transport; email disabled");
                None
            }
        }
    } else {
        None
    };
    let email = Arc::new(EmailService::new(
        config.notifications.email_enabled,
        config.email.recipients.clone(),
        mailer,
    ));

    let firewall = Arc::new(UfwFirewall::from_settings(&config.firewall));
    let blocklist = Arc::new(BlocklistService::new(pool.clone(), firewall));
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

    let state = AppState {
        pool: pool.clone(),
        config: Arc::clone(&config),
        rate_limiter: Arc::new(RateLimiter::new(
            config.rate_limit.requests,
            config.rate_limit.window_seconds,
        )),
        broadcaster: Arc::new(RawLogBroadcaster::new()),
        hot_cache: Arc::new(HotLogCache::with_defaults()),
        ml: Arc::clone(&ml),
        reputation: Arc::new(ReputationService::new(config.reputation_api_key.clone())),
        email,
        blocklist,
        auto_blocker: Arc::clone(&auto_blocker),
        notifications: Arc::clone(&notifications),
    };

    // Background activities: tailers, retention, alert monitor, auto-retrain.
    spawn_tailers(&pool, &state.broadcaster, &state.hot_cache, &config.live_sources);
    spawn_retention_worker(
        pool.clone(),
        config.retention.clone(),
        config.ml.feature_cache_ttl_hours,
    );
    spawn_auto_retrain_worker(pool.clone(), Arc::clone(&ml), config.ml.clone());
    let monitor = Arc::new(AlertMonitor::new(
        pool.clone(),
        notifications,
        auto_blocker,
        config.notifications.check_interval_seconds,
    ));
    tokio::spawn(Arc::clone(&monitor).run());

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!(addr = %config.bind_addr, "listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}
