//! The ML scoring service.
//!
//! `score` never fails: any internal error degrades to a rule-based fallback
//! result marked `ml_available = false`. The loaded artifact bundle lives
//! behind a swap-on-reload handle so concurrent scorers always see a
//! consistent set.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use firewall_common::Severity;
use firewall_common::database::DbPool;

use crate::error::MlError;
use crate::features::{MlInput, extract_features, schema_hash};
use crate::model::{LoadedModels, clip01, load_models};
use crate::storage::{
    PredictionRecord, cache_get_features, cache_set_features, make_cache_key, store_prediction,
};

#[derive(Debug, Clone)]
pub struct MlServiceConfig {
    pub enabled: bool,
    pub models_dir: PathBuf,
    pub store_predictions: bool,
    pub cache_features: bool,
    pub feature_cache_ttl_hours: i64,
}

impl Default for MlServiceConfig {
    fn default() -> Self {
        MlServiceConfig {
            enabled: true,
            models_dir: PathBuf::from("ml_models"),
            store_predictions: true,
            cache_features: true,
            feature_cache_ttl_hours: 24,
        }
    }
}

/// Scoring input: a representative log line plus rule-based hints.
#[derive(Debug, Clone, Default)]
pub struct ScoreContext {
    pub source_ip: Option<String>,
    pub threat_type_hint: Option<String>,
    pub severity_hint: Option<Severity>,
    pub timestamp: Option<DateTime<Utc>>,
    pub log_source: Option<String>,
    pub event_type: Option<String>,
    pub raw_log: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MlResult {
    pub ml_enabled: bool,
    pub ml_available: bool,
    pub anomaly_score: Option<f64>,
    pub predicted_label: Option<String>,
    pub confidence: Option<f64>,
    /// 0-100 combined risk.
    pub risk_score: Option<f64>,
    pub reasoning: Vec<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MlStatus {
    pub enabled: bool,
    pub available: bool,
    pub initialized: bool,
    pub last_error: Option<String>,
    pub models_dir: String,
    pub active_version: Option<String>,
    pub artifacts: Vec<String>,
}

pub struct MlService {
    config: MlServiceConfig,
    models: RwLock<Option<Arc<LoadedModels>>>,
    last_error: RwLock<Option<String>>,
    initialized: AtomicBool,
}

impl MlService {
    pub fn new(config: MlServiceConfig) -> Self {
        MlService {
            config,
            models: RwLock::new(None),
            last_error: RwLock::new(None),
            initialized: AtomicBool::new(false),
        }
    }

    pub fn models_dir(&self) -> &Path {
        &self.config.models_dir
    }

    /// Load (or reload) the artifact bundle. Returns whether models are
    /// available afterwards. Never panics; load failures are recorded and the
    /// service degrades to rule-based scoring.
    pub fn initialize(&self, force_reload: bool) -> bool {
        if !self.config.enabled {
            self.initialized.store(true, Ordering::SeqCst);
            return false;
        }
        if self.initialized.load(Ordering::SeqCst) && !force_reload {
            return self.models.read().expect("models lock").is_some();
        }

        match load_models(&self.config.models_dir) {
            Ok(bundle) => {
                *self.models.write().expect("models lock") = Some(Arc::new(bundle));
                *self.last_error.write().expect("error lock") = None;
                self.initialized.store(true, Ordering::SeqCst);
                tracing::info!(dir = %self.config.models_dir.display(), "ML models loaded");
                true
            }
            Err(e) => {
                *self.models.write().expect("models lock") = None;
                *self.last_error.write().expect("error lock") = Some(e.to_string());
                self.initialized.store(true, Ordering::SeqCst);
                tracing::warn!(error = %e, "ML models unavailable; falling back to rules");
                false
            }
        }
    }

    fn current_models(&self) -> Option<Arc<LoadedModels>> {
        self.models.read().expect("models lock").clone()
    }

    pub fn status(&self) -> MlStatus {
        if !self.initialized.load(Ordering::SeqCst) {
            self.initialize(false);
        }
        let last_error = self.last_error.read().expect("error lock").clone();
        let artifacts = std::fs::read_dir(&self.config.models_dir)
            .map(|entries| {
                let mut names: Vec<String> = entries
                    .filter_map(|e| e.ok())
                    .filter(|e| e.path().is_file())
                    .filter_map(|e| e.file_name().into_string().ok())
                    .collect();
                names.sort();
                names
            })
            .unwrap_or_default();

        MlStatus {
            enabled: self.config.enabled,
            available: self.config.enabled && last_error.is_none() && self.current_models().is_some(),
            initialized: self.initialized.load(Ordering::SeqCst),
            last_error,
            models_dir: self.config.models_dir.display().to_string(),
            active_version: crate::versioning::get_active_version(&self.config.models_dir),
            artifacts,
        }
    }

    /// Score a single representative log line. Always returns a result.
    pub async fn score(&self, pool: &DbPool, ctx: &ScoreContext) -> MlResult {
        if !self.config.enabled {
            return MlResult {
                ml_enabled: false,
                ml_available: false,
                anomaly_score: None,
                predicted_label: None,
                confidence: None,
                risk_score: None,
                reasoning: vec!["ML disabled via configuration".to_string()],
                error: None,
            };
        }

        if !self.initialized.load(Ordering::SeqCst) {
            self.initialize(false);
        }

        let result = match self.current_models() {
            Some(models) => match self.try_score(pool, &models, ctx).await {
                Ok(result) => result,
                Err(e) => fallback_result(ctx, Some(e.to_string())),
            },
            None => {
                let error = self.last_error.read().expect("error lock").clone();
                fallback_result(ctx, error)
            }
        };

        if self.config.store_predictions {
            let record = PredictionRecord {
                source_ip: ctx.source_ip.clone(),
                log_source: ctx.log_source.clone(),
                event_type: ctx.event_type.clone(),
                threat_type_hint: ctx.threat_type_hint.clone(),
                severity_hint: ctx.severity_hint.map(|s| s.as_str().to_string()),
                anomaly_score: result.anomaly_score,
                predicted_label: result.predicted_label.clone(),
                confidence: result.confidence,
                risk_score: result.risk_score,
                ml_available: result.ml_available,
                error: result.error.clone(),
            };
            if let Err(e) = store_prediction(pool, &record).await {
                tracing::debug!(error = %e, "failed to persist prediction record");
            }
        }

        result
    }

    async fn try_score(
        &self,
        pool: &DbPool,
        models: &LoadedModels,
        ctx: &ScoreContext,
    ) -> Result<MlResult, MlError> {
        let mut reasoning = Vec::new();

        let input = MlInput::new(
            ctx.timestamp,
            ctx.log_source.as_deref(),
            ctx.event_type.as_deref(),
            ctx.raw_log.as_deref(),
        );
        let features = self.feature_row(pool, &input).await;
        let scaled = models.scaler.transform(&features)?;

        let anomaly_score = models.anomaly.as_ref().map(|m| m.anomaly_score(&scaled));
        if let Some(score) = anomaly_score {
            reasoning.push(format!("ml.anomaly_score={score:.3}"));
        }

        // The classifier is only trained on auth-like traffic.
        let is_auth_like = ctx
            .log_source
            .as_deref()
            .map(|s| s.to_lowercase().contains("auth"))
            .unwrap_or(false)
            || ctx
                .event_type
                .as_deref()
                .map(|e| e.starts_with("SSH_"))
                .unwrap_or(false);

        let mut predicted_label = None;
        let mut confidence = None;
        if is_auth_like {
            if let Some(classifier) = &models.classifier {
                if let Some((label, proba)) = classifier.predict(&scaled) {
                    reasoning.push(format!("ml.class={label} conf={proba:.3}"));
                    predicted_label = Some(label);
                    confidence = Some(proba);
                }
            }
        }

        // Classifier unavailable or not applicable: fall back to the hint or
        // infer a label from the event type.
        if predicted_label.is_none() {
            let (label, seed) = infer_label(ctx);
            reasoning.push(format!("rule.label={label} conf_seed={seed:.2}"));
            predicted_label = Some(label);
            confidence = Some(seed);
        }

        let label = predicted_label.clone().unwrap_or_default();
        let a = anomaly_score.map(clip01).unwrap_or(0.0);
        let c = confidence
            .map(clip01)
            .unwrap_or_else(|| severity_to_confidence(ctx.severity_hint));
        let risk = 100.0 * clip01(0.55 * a + 0.45 * c * label_weight(&label));
        reasoning.push(format!("ml.risk_score={risk:.1}"));

        Ok(MlResult {
            ml_enabled: true,
            ml_available: true,
            anomaly_score,
            predicted_label,
            confidence,
            risk_score: Some(risk),
            reasoning,
            error: None,
        })
    }

    /// Cached feature row, computed on miss. Cache failures never fail the
    /// scoring call.
    async fn feature_row(
        &self,
        pool: &DbPool,
        input: &MlInput,
    ) -> std::collections::BTreeMap<String, f64> {
        if !self.config.cache_features {
            return extract_features(input);
        }

        let key = make_cache_key(input);
        let schema = schema_hash();
        match cache_get_features(pool, &key, &schema, self.config.feature_cache_ttl_hours).await {
            Ok(Some(cached)) => return cached,
            Ok(None) => {}
            Err(e) => tracing::debug!(error = %e, "feature cache read failed"),
        }

        let features = extract_features(input);
        if let Err(e) = cache_set_features(pool, &key, &schema, &features).await {
            tracing::debug!(error = %e, "feature cache write failed");
        }
        features
    }
}

/// Infer a label and a confidence seed from hints when the classifier does
/// not apply: the rule-based threat type first, then event-type substrings,
/// then the severity hint.
pub(crate) fn infer_label(ctx: &ScoreContext) -> (String, f64) {
    let seed = severity_to_confidence(ctx.severity_hint);

    if let Some(hint) = &ctx.threat_type_hint {
        return (hint.clone(), seed);
    }

    if let Some(event_type) = &ctx.event_type {
        let upper = event_type.to_uppercase();
        let label = if upper.contains("BRUTE_FORCE") || upper.contains("SSH_FAILED") {
            "BRUTE_FORCE"
        } else if upper.contains("DDOS") || upper.contains("FLOOD") {
            "DDOS"
        } else if upper.contains("PORT_SCAN") || upper.contains("SCAN") {
            "PORT_SCAN"
        } else if upper.contains("SQL") || upper.contains("INJECTION") {
            "SQL_INJECTION"
        } else if upper.contains("SUSPICIOUS") {
            "SUSPICIOUS"
        } else if upper.contains("SSH_SUCCESS") || upper.contains("LOGIN_SUCCESS") {
            "NORMAL"
        } else if matches!(ctx.severity_hint, Some(Severity::Critical) | Some(Severity::High)) {
            "SUSPICIOUS"
        } else {
            "NORMAL"
        };
        return (label.to_string(), seed);
    }

    let label = if matches!(ctx.severity_hint, Some(Severity::Critical) | Some(Severity::High)) {
        "SUSPICIOUS"
    } else {
        "NORMAL"
    };
    (label.to_string(), seed)
}

pub fn severity_to_confidence(severity: Option<Severity>) -> f64 {
    match severity {
        Some(Severity::Critical) => 0.95,
        Some(Severity::High) => 0.85,
        Some(Severity::Medium) => 0.70,
        Some(Severity::Low) => 0.55,
        None => 0.50,
    }
}

pub fn label_weight(label: &str) -> f64 {
    match label.to_uppercase().as_str() {
        "NORMAL" => 0.10,
        "SUSPICIOUS" => 0.60,
        "BRUTE_FORCE" => 0.80,
        "DDOS" | "PORT_SCAN" => 0.90,
        _ => 0.50,
    }
}

/// Degraded result with a hint-derived risk estimate.
fn fallback_result(ctx: &ScoreContext, error: Option<String>) -> MlResult {
    let mut reasoning = vec!["ML unavailable; falling back to rules".to_string()];
    if let Some(e) = &error {
        reasoning.push(format!("ml.error={e}"));
    }

    let mut predicted_label = None;
    let mut confidence = None;
    let mut risk = None;

    if ctx.threat_type_hint.is_some() || ctx.severity_hint.is_some() {
        let label = ctx.threat_type_hint.clone();
        let conf = severity_to_confidence(ctx.severity_hint);
        let weight = label.as_deref().map(label_weight).unwrap_or(0.50);
        let fallback = 100.0 * clip01(0.45 * conf * weight);
        reasoning.push(format!("fallback.risk_score={fallback:.1}"));
        predicted_label = label;
        confidence = Some(conf);
        risk = Some(fallback);
    }

    MlResult {
        ml_enabled: true,
        ml_available: false,
        anomaly_score: None,
        predicted_label,
        confidence,
        risk_score: risk,
        reasoning,
        error,
    }
}

/// Step rule-based severity down one rank when ML is confident the event is
/// normal. Applied by detectors that opt into ML adjustment; never downgrades
/// past `LOW`.
pub fn adjust_severity_with_ml(severity: Severity, result: &MlResult) -> Severity {
    let confident_normal = result.ml_available
        && result.predicted_label.as_deref() == Some("NORMAL")
        && result.confidence.unwrap_or(0.0) >= 0.80
        && result.anomaly_score.unwrap_or(1.0) <= 0.30;
    if confident_normal {
        severity.step_down()
    } else {
        severity
    }
}
