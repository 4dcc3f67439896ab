//! Shared application state assembled at startup and handed to every route.

use std::sync::Arc;

use firewall_common::database::DbPool;
use firewall_detectors::ReputationService;
use firewall_ml::MlService;

use crate::config::AppConfig;
use crate::middleware::RateLimiter;
use crate::services::auto_block::AutoBlocker;
use crate::services::blocklist::BlocklistService;
use crate::services::broadcaster::RawLogBroadcaster;
use crate::services::email::EmailService;
use crate::services::hot_cache::HotLogCache;
use crate::services::notification::NotificationService;

#[derive(Clone)]
pub struct AppState {
    pub pool: DbPool,
    pub config: Arc<AppConfig>,
    pub rate_limiter: Arc<RateLimiter>,
    pub broadcaster: Arc<RawLogBroadcaster>,
    pub hot_cache: Arc<HotLogCache>,
    pub ml: Arc<MlService>,
    pub reputation: Arc<ReputationService>,
    pub email: Arc<EmailService>,
    pub blocklist: Arc<BlocklistService>,
    pub auto_blocker: Arc<AutoBlocker>,
    pub notifications: Arc<NotificationService>,
}
