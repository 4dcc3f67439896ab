//! Error types for the ML engine.

use thiserror::Error;

use firewall_common::error::StoreError;

#[derive(Debug, Error)]
pub enum MlError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("artifact serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("model artifact missing: {0}")]
    ArtifactMissing(String),

    #[error("feature '{0}' missing from input row")]
    MissingFeature(String),

    #[error("not enough training data: need {needed}, got {got}")]
    NotEnoughData { needed: usize, got: usize },

    #[error("model version not found: {0}")]
    VersionNotFound(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}
