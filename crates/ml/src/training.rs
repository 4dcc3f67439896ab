//! Model training over recent store events.
//!
//! The scaler is fitted once and kept stable across retrains (the feature
//! schema is fixed); the anomaly detector and classifier are refitted from
//! the most recent events each run.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::Utc;

use firewall_common::database::DbPool;
use firewall_common::database::queries::recent_events;
use firewall_common::{Event, Severity};

use crate::artifacts::write_json;
use crate::error::MlError;
use crate::features::{FEATURE_NAMES, MlInput, extract_features, schema_hash};
use crate::model::{AnomalyModel, Calibration, ClassifierModel, FeatureScaler, LabelEncoder};
use crate::service::{ScoreContext, severity_to_confidence};
use crate::versioning::{
    ANOMALY_DETECTOR_FILE, ANOMALY_METRICS_FILE, CLASSIFIER_METRICS_FILE, FEATURE_SCALER_FILE,
    LABEL_ENCODER_FILE, MODEL_METADATA_FILE, THREAT_CLASSIFIER_FILE,
};

const MIN_TRAINING_EVENTS: usize = 20;
const TRAINING_EVENT_LIMIT: u32 = 5000;

fn event_feature_row(event: &Event) -> BTreeMap<String, f64> {
    let input = MlInput::new(
        Some(event.timestamp),
        Some(&event.log_source),
        Some(&event.event_type),
        Some(&event.raw_log),
    );
    extract_features(&input)
}

/// Label an event for classifier training from its rule-assigned type.
fn training_label(event: &Event) -> String {
    let ctx = ScoreContext {
        event_type: Some(event.event_type.clone()),
        severity_hint: Some(event.severity),
        ..Default::default()
    };
    crate::service::infer_label(&ctx).0
}

fn fit_scaler(rows: &[BTreeMap<String, f64>]) -> FeatureScaler {
    let names: Vec<String> = FEATURE_NAMES.iter().map(|s| s.to_string()).collect();
    let n = rows.len().max(1) as f64;

    let mut mean = vec![0.0; names.len()];
    for row in rows {
        for (i, name) in names.iter().enumerate() {
            mean[i] += row.get(name).copied().unwrap_or(0.0);
        }
    }
    for m in &mut mean {
        *m /= n;
    }

    let mut variance = vec![0.0; names.len()];
    for row in rows {
        for (i, name) in names.iter().enumerate() {
            let d = row.get(name).copied().unwrap_or(0.0) - mean[i];
            variance[i] += d * d;
        }
    }
    let std = variance.into_iter().map(|v| (v / n).sqrt()).collect();

    FeatureScaler {
        schema_hash: schema_hash(),
        features: names,
        mean,
        std,
    }
}

/// Load the existing scaler if present (keeping the trained schema stable),
/// otherwise fit and persist a new one.
fn load_or_fit_scaler(
    models_dir: &Path,
    rows: &[BTreeMap<String, f64>],
) -> Result<FeatureScaler, MlError> {
    let path = models_dir.join(FEATURE_SCALER_FILE);
    if path.exists() {
        return crate::artifacts::read_json(&path);
    }
    let scaler = fit_scaler(rows);
    write_json(&path, &scaler)?;
    Ok(scaler)
}

fn percentile(sorted: &[f64], q: f64) -> f64 {
    if sorted.is_empty() {
        return 0.0;
    }
    let pos = q * (sorted.len() - 1) as f64;
    let lower = pos.floor() as usize;
    let upper = pos.ceil() as usize;
    if lower == upper {
        sorted[lower]
    } else {
        let frac = pos - lower as f64;
        sorted[lower] * (1.0 - frac) + sorted[upper] * frac
    }
}

fn write_metadata(models_dir: &Path) -> Result<(), MlError> {
    let metadata = serde_json::json!({
        "updated_at_utc": Utc::now().to_rfc3339(),
        "feature_schema_hash": schema_hash(),
        "feature_names": FEATURE_NAMES,
    });
    write_json(&models_dir.join(MODEL_METADATA_FILE), &metadata)
}

async fn training_rows(pool: &DbPool) -> Result<Vec<Event>, MlError> {
    let events = recent_events(pool, TRAINING_EVENT_LIMIT).await?;
    if events.len() < MIN_TRAINING_EVENTS {
        return Err(MlError::NotEnoughData {
            needed: MIN_TRAINING_EVENTS,
            got: events.len(),
        });
    }
    Ok(events)
}

/// Train the anomaly detector and write its artifacts. Returns the metrics
/// document.
pub async fn train_anomaly_model(
    pool: &DbPool,
    models_dir: &Path,
) -> Result<serde_json::Value, MlError> {
    let events = training_rows(pool).await?;
    let rows: Vec<BTreeMap<String, f64>> = events.iter().map(event_feature_row).collect();
    let scaler = load_or_fit_scaler(models_dir, &rows)?;

    let model_unscored = AnomalyModel {
        weights: vec![1.0; scaler.features.len()],
        bias: 0.0,
        calibration: Calibration { q_low: 0.0, q_high: 1.0 },
    };

    let mut raws = Vec::with_capacity(rows.len());
    for row in &rows {
        let scaled = scaler.transform(row)?;
        raws.push(model_unscored.raw_score(&scaled));
    }
    raws.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

    let calibration = Calibration {
        q_low: percentile(&raws, 0.05),
        q_high: percentile(&raws, 0.95),
    };
    let model = AnomalyModel {
        weights: vec![1.0; scaler.features.len()],
        bias: 0.0,
        calibration,
    };
    write_json(&models_dir.join(ANOMALY_DETECTOR_FILE), &model)?;

    let metrics = serde_json::json!({
        "trained_at_utc": Utc::now().to_rfc3339(),
        "samples": rows.len(),
        "q_low": calibration.q_low,
        "q_high": calibration.q_high,
        "mean_raw_score": raws.iter().sum::<f64>() / raws.len() as f64,
    });
    write_json(&models_dir.join(ANOMALY_METRICS_FILE), &metrics)?;
    write_metadata(models_dir)?;
    tracing::info!(samples = rows.len(), "anomaly detector trained");
    Ok(metrics)
}

/// Train the threat classifier and write its artifacts. Returns the metrics
/// document.
pub async fn train_classifier_model(
    pool: &DbPool,
    models_dir: &Path,
) -> Result<serde_json::Value, MlError> {
    let events = training_rows(pool).await?;
    let rows: Vec<BTreeMap<String, f64>> = events.iter().map(event_feature_row).collect();
    let scaler = load_or_fit_scaler(models_dir, &rows)?;

    let mut by_label: BTreeMap<String, Vec<Vec<f64>>> = BTreeMap::new();
    for (event, row) in events.iter().zip(rows.iter()) {
        let scaled = scaler.transform(row)?;
        by_label.entry(training_label(event)).or_default().push(scaled);
    }

    let classes: Vec<String> = by_label.keys().cloned().collect();
    let centroids: Vec<Vec<f64>> = by_label
        .values()
        .map(|vectors| {
            let dims = vectors[0].len();
            let mut centroid = vec![0.0; dims];
            for vector in vectors {
                for (c, v) in centroid.iter_mut().zip(vector.iter()) {
                    *c += v;
                }
            }
            for c in &mut centroid {
                *c /= vectors.len() as f64;
            }
            centroid
        })
        .collect();

    let model = ClassifierModel {
        classes: classes.clone(),
        centroids,
    };

    // Self-accuracy on the training set: how often the nearest centroid is
    // the event's own label.
    let mut correct = 0usize;
    let mut total = 0usize;
    for (event, row) in events.iter().zip(rows.iter()) {
        let scaled = scaler.transform(row)?;
        if let Some((label, _)) = model.predict(&scaled) {
            if label == training_label(event) {
                correct += 1;
            }
        }
        total += 1;
    }

    write_json(&models_dir.join(THREAT_CLASSIFIER_FILE), &model)?;
    write_json(
        &models_dir.join(LABEL_ENCODER_FILE),
        &LabelEncoder { classes: classes.clone() },
    )?;

    let per_class: BTreeMap<&String, usize> =
        by_label.iter().map(|(label, v)| (label, v.len())).collect();
    let metrics = serde_json::json!({
        "trained_at_utc": Utc::now().to_rfc3339(),
        "samples": total,
        "classes": classes,
        "per_class_counts": per_class,
        "training_accuracy": if total > 0 { correct as f64 / total as f64 } else { 0.0 },
        "confidence_floor": severity_to_confidence(Some(Severity::Low)),
    });
    write_json(&models_dir.join(CLASSIFIER_METRICS_FILE), &metrics)?;
    write_metadata(models_dir)?;
    tracing::info!(samples = total, classes = classes.len(), "threat classifier trained");
    Ok(metrics)
}
