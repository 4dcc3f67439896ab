//! Model lifecycle endpoints: status, retrain, version listing, rollback.

use axum::Json;
use axum::extract::State;
use serde::{Deserialize, Serialize};

use firewall_ml::storage::{finish_training_run, start_training_run};
use firewall_ml::versioning::{VersionInfo, list_versions, rollback_to_version};
use firewall_ml::{MlError, run_retrain};

use crate::error::ApiError;
use crate::state::AppState;

pub async fn status(State(state): State<AppState>) -> Json<firewall_ml::service::MlStatus> {
    Json(state.ml.status())
}

#[derive(Debug, Deserialize)]
pub struct RetrainRequest {
    #[serde(default = "default_true")]
    pub train_anomaly: bool,
    #[serde(default = "default_true")]
    pub train_classifier: bool,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct RetrainResponse {
    pub run_id: String,
    pub pre_version: String,
    pub post_version: String,
    pub results: serde_json::Value,
}

pub async fn retrain(
    State(state): State<AppState>,
    Json(request): Json<RetrainRequest>,
) -> Result<Json<RetrainResponse>, ApiError> {
    if !request.train_anomaly && !request.train_classifier {
        return Err(ApiError::BadRequest(
            "at least one of train_anomaly/train_classifier must be set".to_string(),
        ));
    }

    let requested = serde_json::json!({
        "train_anomaly": request.train_anomaly,
        "train_classifier": request.train_classifier,
        "trigger": "api",
    });
    let run_id = start_training_run(&state.pool, &requested).await?;

    match run_retrain(
        &state.pool,
        &state.ml,
        request.train_anomaly,
        request.train_classifier,
        &run_id,
    )
    .await
    {
        Ok(outcome) => {
            let results = serde_json::json!({
                "pre_version": outcome.pre_version,
                "post_version": outcome.post_version,
                "results": outcome.results,
            });
            finish_training_run(&state.pool, &run_id, "completed", Some(&results), None).await?;
            Ok(Json(RetrainResponse {
                run_id,
                pre_version: outcome.pre_version,
                post_version: outcome.post_version,
                results: outcome.results,
            }))
        }
        Err(e) => {
            finish_training_run(&state.pool, &run_id, "failed", None, Some(&e.to_string())).await?;
            match e {
                MlError::NotEnoughData { needed, got } => Err(ApiError::BadRequest(format!(
                    "not enough training data: need {needed}, got {got}"
                ))),
                other => Err(ApiError::Ml(other)),
            }
        }
    }
}

#[derive(Debug, Serialize)]
pub struct VersionsResponse {
    pub active_version: Option<String>,
    pub versions: Vec<VersionInfo>,
}

pub async fn versions(State(state): State<AppState>) -> Result<Json<VersionsResponse>, ApiError> {
    let versions = list_versions(state.ml.models_dir(), 50)?;
    Ok(Json(VersionsResponse {
        active_version: firewall_ml::versioning::get_active_version(state.ml.models_dir()),
        versions,
    }))
}

#[derive(Debug, Deserialize)]
pub struct RollbackRequest {
    pub version_id: String,
}

#[derive(Debug, Serialize)]
pub struct RollbackResponse {
    pub success: bool,
    pub active_version: String,
    pub ml_available: bool,
}

pub async fn rollback(
    State(state): State<AppState>,
    Json(request): Json<RollbackRequest>,
) -> Result<Json<RollbackResponse>, ApiError> {
    match rollback_to_version(state.ml.models_dir(), &request.version_id) {
        Ok(()) => {
            let available = state.ml.initialize(true);
            Ok(Json(RollbackResponse {
                success: true,
                active_version: request.version_id,
                ml_available: available,
            }))
        }
        Err(MlError::VersionNotFound(_)) => Err(ApiError::NotFound),
        Err(e) => Err(ApiError::Ml(e)),
    }
}
