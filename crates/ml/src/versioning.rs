//! Model artifact versioning: snapshots, the active-version pointer, and
//! rollback.
//!
//! Each snapshot is a subdirectory of `versions/` named with a UTC timestamp
//! and carries `snapshot_metadata.json` with a SHA-256 per artifact.

use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::Serialize;

use crate::artifacts::{read_json, sha256_file, write_json};
use crate::error::MlError;

pub const ANOMALY_DETECTOR_FILE: &str = "anomaly_detector.json";
pub const THREAT_CLASSIFIER_FILE: &str = "threat_classifier.json";
pub const FEATURE_SCALER_FILE: &str = "feature_scaler.json";
pub const LABEL_ENCODER_FILE: &str = "label_encoder.json";
pub const ANOMALY_METRICS_FILE: &str = "anomaly_metrics.json";
pub const CLASSIFIER_METRICS_FILE: &str = "classifier_metrics.json";
pub const MODEL_METADATA_FILE: &str = "model_metadata.json";

pub const ACTIVE_VERSION_FILE: &str = "ACTIVE_VERSION.txt";
pub const VERSIONS_DIR: &str = "versions";

const SNAPSHOT_METADATA_FILE: &str = "snapshot_metadata.json";

/// The full artifact set a snapshot covers.
pub const ARTIFACTS: [&str; 7] = [
    ANOMALY_DETECTOR_FILE,
    THREAT_CLASSIFIER_FILE,
    FEATURE_SCALER_FILE,
    LABEL_ENCODER_FILE,
    ANOMALY_METRICS_FILE,
    CLASSIFIER_METRICS_FILE,
    MODEL_METADATA_FILE,
];

fn version_id_now() -> String {
    Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string()
}

fn versions_dir(models_dir: &Path) -> PathBuf {
    models_dir.join(VERSIONS_DIR)
}

pub fn get_active_version(models_dir: &Path) -> Option<String> {
    let pointer = models_dir.join(ACTIVE_VERSION_FILE);
    let raw = fs::read_to_string(pointer).ok()?;
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

pub fn set_active_version(models_dir: &Path, version_id: &str) -> Result<(), MlError> {
    fs::create_dir_all(models_dir)?;
    fs::write(
        models_dir.join(ACTIVE_VERSION_FILE),
        format!("{}\n", version_id.trim()),
    )?;
    Ok(())
}

#[derive(Debug, Serialize)]
pub struct VersionInfo {
    pub version_id: String,
    pub path: String,
    pub metadata: serde_json::Value,
}

/// List snapshot versions, newest first.
pub fn list_versions(models_dir: &Path, limit: usize) -> Result<Vec<VersionInfo>, MlError> {
    let dir = versions_dir(models_dir);
    if !dir.exists() {
        return Ok(Vec::new());
    }

    let mut names: Vec<String> = fs::read_dir(&dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.path().is_dir())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .collect();
    names.sort_by(|a, b| b.cmp(a));

    let mut versions = Vec::new();
    for name in names.into_iter().take(limit) {
        let path = dir.join(&name);
        let metadata = read_json(&path.join(SNAPSHOT_METADATA_FILE))
            .unwrap_or_else(|_| serde_json::json!({}));
        versions.push(VersionInfo {
            version_id: name,
            path: path.display().to_string(),
            metadata,
        });
    }
    Ok(versions)
}

/// Copy the current artifacts into a new version directory. Returns the
/// version id. Missing artifacts are recorded, not fatal.
pub fn snapshot_current_models(
    models_dir: &Path,
    reason: &str,
    run_id: Option<&str>,
    mark_active: bool,
) -> Result<String, MlError> {
    // Timestamp ids can collide when two snapshots land in the same second
    // (a retrain takes both of its snapshots back to back); disambiguate.
    let mut version_id = version_id_now();
    let mut dest = versions_dir(models_dir).join(&version_id);
    let mut counter = 1;
    while dest.exists() {
        counter += 1;
        version_id = format!("{}_{counter}", version_id_now());
        dest = versions_dir(models_dir).join(&version_id);
    }
    fs::create_dir_all(&dest)?;

    let mut copied = Vec::new();
    let mut missing = Vec::new();
    let mut hashes = serde_json::Map::new();

    for name in ARTIFACTS {
        let source = models_dir.join(name);
        if source.exists() {
            fs::copy(&source, dest.join(name))?;
            copied.push(name.to_string());
            hashes.insert(
                name.to_string(),
                serde_json::Value::String(sha256_file(&source)?),
            );
        } else {
            missing.push(name.to_string());
            hashes.insert(name.to_string(), serde_json::Value::Null);
        }
    }

    let metadata = serde_json::json!({
        "snapshot_at_utc": Utc::now().to_rfc3339(),
        "reason": reason,
        "run_id": run_id,
        "active_before": get_active_version(models_dir),
        "copied": copied,
        "missing": missing,
        "sha256": hashes,
        "activated": mark_active,
    });
    write_json(&dest.join(SNAPSHOT_METADATA_FILE), &metadata)?;

    if mark_active {
        set_active_version(models_dir, &version_id)?;
    }
    Ok(version_id)
}

/// Restore every artifact from a version back into the models directory and
/// mark that version active. The next model load sees the restored set.
pub fn rollback_to_version(models_dir: &Path, version_id: &str) -> Result<(), MlError> {
    let source = versions_dir(models_dir).join(version_id);
    if !source.is_dir() {
        return Err(MlError::VersionNotFound(version_id.to_string()));
    }

    fs::create_dir_all(models_dir)?;
    for name in ARTIFACTS {
        let candidate = source.join(name);
        if candidate.exists() {
            fs::copy(&candidate, models_dir.join(name))?;
        }
    }

    set_active_version(models_dir, version_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_artifact(dir: &Path, name: &str, content: &str) {
        fs::create_dir_all(dir).unwrap();
        fs::write(dir.join(name), content).unwrap();
    }

    #[test]
    fn test_active_version_pointer() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(get_active_version(dir.path()), None);
        set_active_version(dir.path(), "2025-01-01_00-00-00").unwrap();
        assert_eq!(
            get_active_version(dir.path()).as_deref(),
            Some("2025-01-01_00-00-00")
        );
    }

    #[test]
    fn test_snapshot_records_hashes_and_missing() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), FEATURE_SCALER_FILE, "{\"features\":[]}");

        let version = snapshot_current_models(dir.path(), "test", Some("run-1"), true).unwrap();
        assert_eq!(get_active_version(dir.path()).as_deref(), Some(version.as_str()));

        let versions = list_versions(dir.path(), 10).unwrap();
        assert_eq!(versions.len(), 1);
        let meta = &versions[0].metadata;
        assert_eq!(meta["reason"], "test");
        assert_eq!(meta["run_id"], "run-1");
        assert!(meta["copied"].as_array().unwrap().len() == 1);
        assert!(meta["missing"].as_array().unwrap().len() == ARTIFACTS.len() - 1);
        assert!(meta["sha256"][FEATURE_SCALER_FILE].is_string());
    }

    #[test]
    fn test_rollback_restores_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        write_artifact(dir.path(), FEATURE_SCALER_FILE, "original");
        let version = snapshot_current_models(dir.path(), "pre", None, false).unwrap();

        // Overwrite the live artifact, then roll back.
        write_artifact(dir.path(), FEATURE_SCALER_FILE, "modified");
        rollback_to_version(dir.path(), &version).unwrap();

        let restored = fs::read_to_string(dir.path().join(FEATURE_SCALER_FILE)).unwrap();
        assert_eq!(restored, "original");
        assert_eq!(get_active_version(dir.path()).as_deref(), Some(version.as_str()));
    }

    #[test]
    fn test_rollback_unknown_version_errors() {
        let dir = tempfile::tempdir().unwrap();
        let err = rollback_to_version(dir.path(), "nope").unwrap_err();
        assert!(matches!(err, MlError::VersionNotFound(_)));
    }
}
