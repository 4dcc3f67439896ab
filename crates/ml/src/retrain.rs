//! Retraining pipeline shared by the API route and the auto-retrain worker.
//!
//! Order matters: the live models are force-reloaded before the pre-snapshot
//! so the snapshot matches live inference state, then again after training so
//! inference picks up the new artifacts before they are snapshotted as the
//! active version.

use serde::Serialize;

use firewall_common::database::DbPool;

use crate::error::MlError;
use crate::service::MlService;
use crate::training::{train_anomaly_model, train_classifier_model};
use crate::versioning::snapshot_current_models;

#[derive(Debug, Serialize)]
pub struct RetrainOutcome {
    pub pre_version: String,
    pub post_version: String,
    pub results: serde_json::Value,
}

pub async fn run_retrain(
    pool: &DbPool,
    service: &MlService,
    train_anomaly: bool,
    train_classifier: bool,
    run_id: &str,
) -> Result<RetrainOutcome, MlError> {
    service.initialize(true);

    let pre_version = snapshot_current_models(
        service.models_dir(),
        "pre_retrain_snapshot",
        Some(run_id),
        false,
    )?;

    let mut results = serde_json::Map::new();
    if train_anomaly {
        let metrics = train_anomaly_model(pool, service.models_dir()).await?;
        results.insert("anomaly".to_string(), metrics);
    }
    if train_classifier {
        let metrics = train_classifier_model(pool, service.models_dir()).await?;
        results.insert("classifier".to_string(), metrics);
    }

    service.initialize(true);

    let post_version = snapshot_current_models(
        service.models_dir(),
        "post_retrain_snapshot",
        Some(run_id),
        true,
    )?;

    Ok(RetrainOutcome {
        pre_version,
        post_version,
        results: serde_json::Value::Object(results),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{MlServiceConfig, ScoreContext};
    use crate::versioning::{get_active_version, list_versions, rollback_to_version};
    use chrono::{Duration, Utc};
    use firewall_common::database::init_memory_db;
    use firewall_common::database::queries::insert_events;
    use firewall_common::{Event, Severity, event_type};

    async fn seed(pool: &firewall_common::database::DbPool) {
        let now = Utc::now();
        let mut events = Vec::new();
        for i in 0..40 {
            let mut e = Event::new(
                now - Duration::minutes(i),
                format!("10.9.0.{}", i % 8 + 1),
                "auth.log",
                event_type::SSH_FAILED_LOGIN,
                Severity::High,
                &format!("Failed password for admin from 10.9.0.{} port 22 ssh2", i % 8 + 1),
            );
            e.username = Some("admin".to_string());
            events.push(e);
        }
        insert_events(pool, &events).await.unwrap();
    }

    #[tokio::test]
    async fn test_retrain_produces_pre_and_post_versions() {
        let pool = init_memory_db().await.unwrap();
        seed(&pool).await;
        let dir = tempfile::tempdir().unwrap();
        let service = MlService::new(MlServiceConfig {
            models_dir: dir.path().to_path_buf(),
            store_predictions: false,
            ..Default::default()
        });

        let outcome = run_retrain(&pool, &service, true, true, "run-1").await.unwrap();
        assert_ne!(outcome.pre_version, outcome.post_version);
        assert_eq!(
            get_active_version(dir.path()).as_deref(),
            Some(outcome.post_version.as_str())
        );
        assert_eq!(list_versions(dir.path(), 10).unwrap().len(), 2);

        // Inference is live after retraining.
        let result = service
            .score(
                &pool,
                &ScoreContext {
                    log_source: Some("auth.log".to_string()),
                    event_type: Some("SSH_FAILED_LOGIN".to_string()),
                    raw_log: Some("Failed password for admin from 10.9.0.1 port 22 ssh2".to_string()),
                    severity_hint: Some(Severity::High),
                    ..Default::default()
                },
            )
            .await;
        assert!(result.ml_available);
    }

    #[tokio::test]
    async fn test_rollback_restores_identical_inference() {
        let pool = init_memory_db().await.unwrap();
        seed(&pool).await;
        let dir = tempfile::tempdir().unwrap();
        let service = MlService::new(MlServiceConfig {
            models_dir: dir.path().to_path_buf(),
            store_predictions: false,
            cache_features: false,
            ..Default::default()
        });

        let first = run_retrain(&pool, &service, true, true, "run-1").await.unwrap();
        let ctx = ScoreContext {
            log_source: Some("auth.log".to_string()),
            event_type: Some("SSH_FAILED_LOGIN".to_string()),
            timestamp: Some(Utc::now()),
            raw_log: Some("Failed password for admin from 10.9.0.1 port 22 ssh2".to_string()),
            severity_hint: Some(Severity::High),
            ..Default::default()
        };
        let original = service.score(&pool, &ctx).await;

        // Change the training distribution and retrain: outputs may move.
        let now = Utc::now();
        let noise: Vec<Event> = (0..40)
            .map(|i| {
                Event::new(
                    now - Duration::seconds(i),
                    "172.16.0.1",
                    "syslog",
                    event_type::SYSLOG_ENTRY,
                    Severity::Low,
                    &"padding ".repeat(i as usize % 7 + 1),
                )
            })
            .collect();
        insert_events(&pool, &noise).await.unwrap();
        run_retrain(&pool, &service, true, true, "run-2").await.unwrap();

        // Roll back to the first post-retrain version and reload.
        rollback_to_version(dir.path(), &first.post_version).unwrap();
        service.initialize(true);
        let restored = service.score(&pool, &ctx).await;

        assert_eq!(original.anomaly_score, restored.anomaly_score);
        assert_eq!(original.predicted_label, restored.predicted_label);
        assert_eq!(original.confidence, restored.confidence);
        assert_eq!(original.risk_score, restored.risk_score);
    }
}
