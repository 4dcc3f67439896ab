//! Periodic background workers: retention enforcement and auto-retrain.
//!
//! Both are self-healing loops: every failure is logged and the loop keeps
//! running until process exit.

use std::sync::Arc;
use std::time::Duration;

use firewall_common::database::DbPool;
use firewall_common::database::retention::enforce_retention;
use firewall_ml::storage::{finish_training_run, prune_feature_cache, start_training_run};
use firewall_ml::{MlService, run_retrain};

use crate::config::{MlSettings, RetentionSettings};

pub fn spawn_retention_worker(
    pool: DbPool,
    settings: RetentionSettings,
    feature_cache_ttl_hours: i64,
) {
    if !settings.enabled {
        return;
    }
    tokio::spawn(async move {
        tracing::info!(
            max_size_mb = settings.max_size_mb,
            interval = settings.interval_seconds,
            "retention worker started"
        );

        // One pass shortly after startup, then the periodic cycle.
        run_retention_once(&pool, &settings, feature_cache_ttl_hours).await;
        let mut ticker = tokio::time::interval(Duration::from_secs(settings.interval_seconds));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            run_retention_once(&pool, &settings, feature_cache_ttl_hours).await;
        }
    });
}

async fn run_retention_once(
    pool: &DbPool,
    settings: &RetentionSettings,
    feature_cache_ttl_hours: i64,
) {
    match enforce_retention(pool, settings.max_size_mb, settings.delete_size_mb).await {
        Ok(report) if report.deleted_docs > 0 => {
            tracing::info!(
                deleted = report.deleted_docs,
                before_bytes = report.size_before_bytes,
                after_bytes = report.size_after_bytes,
                "retention pass trimmed the event store"
            );
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "retention pass failed"),
    }

    match prune_feature_cache(pool, feature_cache_ttl_hours).await {
        Ok(evicted) if evicted > 0 => {
            tracing::debug!(evicted, "expired feature cache rows evicted");
        }
        Ok(_) => {}
        Err(e) => tracing::error!(error = %e, "feature cache eviction failed"),
    }
}

pub fn spawn_auto_retrain_worker(pool: DbPool, ml: Arc<MlService>, settings: MlSettings) {
    if !settings.auto_retrain {
        return;
    }
    let interval = Duration::from_secs(settings.auto_retrain_interval_hours.max(1) * 3600);
    tokio::spawn(async move {
        tracing::info!(interval_hours = settings.auto_retrain_interval_hours, "auto-retrain worker started");
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            ticker.tick().await;

            let requested = serde_json::json!({
                "train_anomaly": true,
                "train_classifier": true,
                "trigger": "auto",
            });
            let run_id = match start_training_run(&pool, &requested).await {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!(error = %e, "failed to open training run");
                    continue;
                }
            };

            match run_retrain(&pool, &ml, true, true, &run_id).await {
                Ok(outcome) => {
                    let results = serde_json::json!({
                        "pre_version": outcome.pre_version,
                        "post_version": outcome.post_version,
                        "results": outcome.results,
                    });
                    if let Err(e) =
                        finish_training_run(&pool, &run_id, "completed", Some(&results), None).await
                    {
                        tracing::error!(error = %e, "failed to close training run");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "auto-retrain failed");
                    if let Err(record_err) =
                        finish_training_run(&pool, &run_id, "failed", None, Some(&e.to_string())).await
                    {
                        tracing::error!(error = %record_err, "failed to record training failure");
                    }
                }
            }
        }
    });
}
