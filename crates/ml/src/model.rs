//! Model artifact types and inference math.
//!
//! Artifacts are JSON documents on disk. A loaded bundle is immutable;
//! reloads build a fresh bundle and swap the handle, so readers always see a
//! consistent artifact set.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::MlError;
use crate::versioning::{
    ANOMALY_DETECTOR_FILE, FEATURE_SCALER_FILE, LABEL_ENCODER_FILE, THREAT_CLASSIFIER_FILE,
};
use crate::artifacts::read_json;

pub fn clip01(x: f64) -> f64 {
    x.clamp(0.0, 1.0)
}

/// Standard scaler over the trained feature schema.
///
/// `transform` consumes exactly `features` in order: extra keys in the input
/// row are ignored, a missing key is an error. A feature the model was not
/// trained with can therefore never reach the downstream models.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeatureScaler {
    pub schema_hash: String,
    pub features: Vec<String>,
    pub mean: Vec<f64>,
    pub std: Vec<f64>,
}

impl FeatureScaler {
    pub fn transform(&self, row: &BTreeMap<String, f64>) -> Result<Vec<f64>, MlError> {
        self.features
            .iter()
            .enumerate()
            .map(|(i, name)| {
                let x = row
                    .get(name)
                    .copied()
                    .ok_or_else(|| MlError::MissingFeature(name.clone()))?;
                let sd = if self.std[i].abs() < 1e-12 { 1.0 } else { self.std[i] };
                Ok((x - self.mean[i]) / sd)
            })
            .collect()
    }
}

/// Percentile calibration for mapping raw anomaly scores into `[0, 1]`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Calibration {
    pub q_low: f64,
    pub q_high: f64,
}

pub fn raw_to_unit_interval(raw: f64, calibration: &Calibration) -> f64 {
    let span = calibration.q_high - calibration.q_low;
    if span.abs() < 1e-12 {
        return if raw >= calibration.q_high { 1.0 } else { 0.0 };
    }
    clip01((raw - calibration.q_low) / span)
}

/// Robust z-score anomaly detector: the raw score is the weighted mean
/// absolute deviation in scaled space, calibrated by training-set percentiles.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnomalyModel {
    pub weights: Vec<f64>,
    pub bias: f64,
    pub calibration: Calibration,
}

impl AnomalyModel {
    pub fn raw_score(&self, scaled: &[f64]) -> f64 {
        if scaled.is_empty() {
            return self.bias;
        }
        let sum: f64 = scaled
            .iter()
            .zip(self.weights.iter().chain(std::iter::repeat(&1.0)))
            .map(|(z, w)| z.abs() * w)
            .sum();
        sum / scaled.len() as f64 + self.bias
    }

    pub fn anomaly_score(&self, scaled: &[f64]) -> f64 {
        raw_to_unit_interval(self.raw_score(scaled), &self.calibration)
    }
}

/// Nearest-centroid classifier with a softmax over negative distances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClassifierModel {
    pub classes: Vec<String>,
    pub centroids: Vec<Vec<f64>>,
}

impl ClassifierModel {
    pub fn predict_proba(&self, scaled: &[f64]) -> Vec<f64> {
        let distances: Vec<f64> = self
            .centroids
            .iter()
            .map(|c| euclidean(scaled, c))
            .collect();
        softmax_neg(&distances)
    }

    /// Predicted label with its probability, `None` for an empty model.
    pub fn predict(&self, scaled: &[f64]) -> Option<(String, f64)> {
        let proba = self.predict_proba(scaled);
        let (idx, best) = proba
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap_or(std::cmp::Ordering::Equal))?;
        Some((self.classes.get(idx)?.clone(), *best))
    }
}

fn euclidean(a: &[f64], b: &[f64]) -> f64 {
    a.iter()
        .zip(b.iter())
        .map(|(x, y)| (x - y) * (x - y))
        .sum::<f64>()
        .sqrt()
}

fn softmax_neg(distances: &[f64]) -> Vec<f64> {
    if distances.is_empty() {
        return Vec::new();
    }
    let min = distances.iter().cloned().fold(f64::MAX, f64::min);
    let exps: Vec<f64> = distances.iter().map(|d| (-(d - min)).exp()).collect();
    let sum: f64 = exps.iter().sum();
    exps.into_iter().map(|e| e / sum).collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

/// A consistent set of loaded artifacts.
#[derive(Debug, Clone)]
pub struct LoadedModels {
    pub scaler: FeatureScaler,
    pub anomaly: Option<AnomalyModel>,
    pub classifier: Option<ClassifierModel>,
    pub label_encoder: Option<LabelEncoder>,
}

/// Load the artifact set from the models directory. The scaler is required;
/// the other artifacts are optional.
pub fn load_models(models_dir: &Path) -> Result<LoadedModels, MlError> {
    let scaler_path = models_dir.join(FEATURE_SCALER_FILE);
    if !scaler_path.exists() {
        return Err(MlError::ArtifactMissing(FEATURE_SCALER_FILE.to_string()));
    }
    let scaler: FeatureScaler = read_json(&scaler_path)?;

    let anomaly_path = models_dir.join(ANOMALY_DETECTOR_FILE);
    let anomaly = if anomaly_path.exists() {
        Some(read_json(&anomaly_path)?)
    } else {
        None
    };

    let classifier_path = models_dir.join(THREAT_CLASSIFIER_FILE);
    let classifier = if classifier_path.exists() {
        Some(read_json(&classifier_path)?)
    } else {
        None
    };

    let encoder_path = models_dir.join(LABEL_ENCODER_FILE);
    let label_encoder = if encoder_path.exists() {
        Some(read_json(&encoder_path)?)
    } else {
        None
    };

    Ok(LoadedModels {
        scaler,
        anomaly,
        classifier,
        label_encoder,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scaler() -> FeatureScaler {
        FeatureScaler {
            schema_hash: "test".to_string(),
            features: vec!["a".to_string(), "b".to_string()],
            mean: vec![10.0, 0.0],
            std: vec![2.0, 1.0],
        }
    }

    #[test]
    fn test_scaler_transform() {
        let mut row = BTreeMap::new();
        row.insert("a".to_string(), 14.0);
        row.insert("b".to_string(), -1.0);
        // Extra features are stripped, never passed downstream.
        row.insert("legacy_feature".to_string(), 99.0);
        let scaled = scaler().transform(&row).unwrap();
        assert_eq!(scaled, vec![2.0, -1.0]);
    }

    #[test]
    fn test_scaler_missing_feature_errors() {
        let mut row = BTreeMap::new();
        row.insert("a".to_string(), 14.0);
        let err = scaler().transform(&row).unwrap_err();
        assert!(matches!(err, MlError::MissingFeature(name) if name == "b"));
    }

    #[test]
    fn test_scaler_zero_std_guard() {
        let s = FeatureScaler {
            schema_hash: "t".to_string(),
            features: vec!["a".to_string()],
            mean: vec![5.0],
            std: vec![0.0],
        };
        let mut row = BTreeMap::new();
        row.insert("a".to_string(), 7.0);
        assert_eq!(s.transform(&row).unwrap(), vec![2.0]);
    }

    #[test]
    fn test_anomaly_calibration_clips() {
        let model = AnomalyModel {
            weights: vec![1.0],
            bias: 0.0,
            calibration: Calibration { q_low: 0.5, q_high: 2.5 },
        };
        assert_eq!(model.anomaly_score(&[0.0]), 0.0);
        assert_eq!(model.anomaly_score(&[10.0]), 1.0);
        let mid = model.anomaly_score(&[1.5]);
        assert!(mid > 0.0 && mid < 1.0);
    }

    #[test]
    fn test_classifier_prefers_nearest_centroid() {
        let model = ClassifierModel {
            classes: vec!["NORMAL".to_string(), "BRUTE_FORCE".to_string()],
            centroids: vec![vec![0.0, 0.0], vec![5.0, 5.0]],
        };
        let (label, confidence) = model.predict(&[4.8, 5.1]).unwrap();
        assert_eq!(label, "BRUTE_FORCE");
        assert!(confidence > 0.5);

        let proba = model.predict_proba(&[4.8, 5.1]);
        assert!((proba.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_load_models_requires_scaler() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_models(dir.path()).unwrap_err();
        assert!(matches!(err, MlError::ArtifactMissing(_)));
    }
}
