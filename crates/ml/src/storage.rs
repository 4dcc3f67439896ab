//! ML persistence: the feature cache, the prediction log, and training
//! history.
//!
//! Feature cache keys are SHA-256 digests of the canonical JSON input, stable
//! across process restarts. Rows also carry the feature schema hash; a row
//! written under a different schema is treated as a miss and recomputed.

use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use firewall_common::database::DbPool;
use firewall_common::error::StoreError;
use firewall_common::store_time;

use crate::features::{FEATURE_SCHEMA_VERSION, MlInput};
use crate::artifacts::sha256_hex;

/// Deterministic cache key for one scoring input.
pub fn make_cache_key(input: &MlInput) -> String {
    let payload = serde_json::json!({"v": FEATURE_SCHEMA_VERSION, "ml_input": input});
    sha256_hex(&payload.to_string())
}

/// Fetch a cached feature row. Expired rows and rows written under a
/// different feature schema are misses.
pub async fn cache_get_features(
    pool: &DbPool,
    cache_key: &str,
    schema_hash: &str,
    ttl_hours: i64,
) -> Result<Option<BTreeMap<String, f64>>, StoreError> {
    let row: Option<(String, String, String)> = sqlx::query_as(
        "SELECT schema_hash, features, created_at FROM ml_feature_cache WHERE cache_key = ?",
    )
    .bind(cache_key)
    .fetch_optional(pool)
    .await?;

    let Some((stored_schema, features, created_at)) = row else {
        return Ok(None);
    };
    if stored_schema != schema_hash {
        return Ok(None);
    }
    let created_at: DateTime<Utc> = store_time::decode(&created_at)?;
    if Utc::now() - created_at > Duration::hours(ttl_hours) {
        return Ok(None);
    }
    Ok(Some(serde_json::from_str(&features)?))
}

pub async fn cache_set_features(
    pool: &DbPool,
    cache_key: &str,
    schema_hash: &str,
    features: &BTreeMap<String, f64>,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO ml_feature_cache (cache_key, schema_hash, features, created_at) \
         VALUES (?, ?, ?, ?) \
         ON CONFLICT (cache_key) DO UPDATE SET schema_hash = excluded.schema_hash, \
         features = excluded.features, created_at = excluded.created_at",
    )
    .bind(cache_key)
    .bind(schema_hash)
    .bind(serde_json::to_string(features)?)
    .bind(store_time::encode(&Utc::now()))
    .execute(pool)
    .await?;
    Ok(())
}

/// Evict feature cache rows older than the TTL.
pub async fn prune_feature_cache(pool: &DbPool, ttl_hours: i64) -> Result<u64, StoreError> {
    let threshold = Utc::now() - Duration::hours(ttl_hours);
    let result = sqlx::query("DELETE FROM ml_feature_cache WHERE created_at < ?")
        .bind(store_time::encode(&threshold))
        .execute(pool)
        .await?;
    Ok(result.rows_affected())
}

/// One scoring call's inputs and outputs, persisted for audit.
#[derive(Debug, Clone)]
pub struct PredictionRecord {
    pub source_ip: Option<String>,
    pub log_source: Option<String>,
    pub event_type: Option<String>,
    pub threat_type_hint: Option<String>,
    pub severity_hint: Option<String>,
    pub anomaly_score: Option<f64>,
    pub predicted_label: Option<String>,
    pub confidence: Option<f64>,
    pub risk_score: Option<f64>,
    pub ml_available: bool,
    pub error: Option<String>,
}

pub async fn store_prediction(pool: &DbPool, record: &PredictionRecord) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT INTO ml_predictions (id, created_at, source_ip, log_source, event_type, \
         threat_type_hint, severity_hint, anomaly_score, predicted_label, confidence, \
         risk_score, ml_available, error) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4().to_string())
    .bind(store_time::encode(&Utc::now()))
    .bind(&record.source_ip)
    .bind(&record.log_source)
    .bind(&record.event_type)
    .bind(&record.threat_type_hint)
    .bind(&record.severity_hint)
    .bind(record.anomaly_score)
    .bind(&record.predicted_label)
    .bind(record.confidence)
    .bind(record.risk_score)
    .bind(record.ml_available as i64)
    .bind(&record.error)
    .execute(pool)
    .await?;
    Ok(())
}

/// Open a training-history row; returns its id.
pub async fn start_training_run(
    pool: &DbPool,
    requested: &serde_json::Value,
) -> Result<String, StoreError> {
    let id = Uuid::new_v4().to_string();
    sqlx::query(
        "INSERT INTO ml_training_history (id, started_at, status, requested) VALUES (?, ?, ?, ?)",
    )
    .bind(&id)
    .bind(store_time::encode(&Utc::now()))
    .bind("running")
    .bind(requested.to_string())
    .execute(pool)
    .await?;
    Ok(id)
}

pub async fn finish_training_run(
    pool: &DbPool,
    run_id: &str,
    status: &str,
    results: Option<&serde_json::Value>,
    error: Option<&str>,
) -> Result<(), StoreError> {
    sqlx::query(
        "UPDATE ml_training_history SET finished_at = ?, status = ?, results = ?, error = ? \
         WHERE id = ?",
    )
    .bind(store_time::encode(&Utc::now()))
    .bind(status)
    .bind(results.map(|r| r.to_string()))
    .bind(error)
    .bind(run_id)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{extract_features, schema_hash};
    use firewall_common::database::init_memory_db;

    fn input() -> MlInput {
        MlInput::new(None, Some("auth.log"), Some("SSH_FAILED_LOGIN"), Some("Failed password"))
    }

    #[test]
    fn test_cache_key_is_deterministic() {
        let a = make_cache_key(&input());
        let b = make_cache_key(&input());
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let other = MlInput::new(None, Some("ufw.log"), Some("UFW_TRAFFIC"), Some("x"));
        assert_ne!(a, make_cache_key(&other));
    }

    #[tokio::test]
    async fn test_feature_cache_round_trip() {
        let pool = init_memory_db().await.unwrap();
        let key = make_cache_key(&input());
        let schema = schema_hash();
        let features = extract_features(&input());

        assert!(cache_get_features(&pool, &key, &schema, 24).await.unwrap().is_none());
        cache_set_features(&pool, &key, &schema, &features).await.unwrap();
        let cached = cache_get_features(&pool, &key, &schema, 24).await.unwrap().unwrap();
        assert_eq!(cached, features);
    }

    #[tokio::test]
    async fn test_schema_mismatch_is_a_miss() {
        let pool = init_memory_db().await.unwrap();
        let key = make_cache_key(&input());
        let features = extract_features(&input());
        cache_set_features(&pool, &key, "stale-schema", &features).await.unwrap();
        assert!(
            cache_get_features(&pool, &key, &schema_hash(), 24)
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_prune_feature_cache() {
        let pool = init_memory_db().await.unwrap();
        let key = make_cache_key(&input());
        let features = extract_features(&input());
        cache_set_features(&pool, &key, &schema_hash(), &features).await.unwrap();

        sqlx::query("UPDATE ml_feature_cache SET created_at = ?")
            .bind(store_time::encode(&(Utc::now() - Duration::hours(30))))
            .execute(&pool)
            .await
            .unwrap();
        assert_eq!(prune_feature_cache(&pool, 24).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_training_history_lifecycle() {
        let pool = init_memory_db().await.unwrap();
        let run_id = start_training_run(&pool, &serde_json::json!({"train_anomaly": true}))
            .await
            .unwrap();
        finish_training_run(&pool, &run_id, "completed", Some(&serde_json::json!({"ok": true})), None)
            .await
            .unwrap();

        let (status, finished): (String, Option<String>) = sqlx::query_as(
            "SELECT status, finished_at FROM ml_training_history WHERE id = ?",
        )
        .bind(&run_id)
        .fetch_one(&pool)
        .await
        .unwrap();
        assert_eq!(status, "completed");
        assert!(finished.is_some());
    }
}
