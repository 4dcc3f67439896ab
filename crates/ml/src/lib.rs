// ML scoring engine
// Feature extraction, calibrated anomaly scoring, threat classification,
// model artifact versioning, and retraining over the event store.

pub mod artifacts;
pub mod error;
pub mod features;
pub mod model;
pub mod retrain;
pub mod service;
pub mod storage;
pub mod training;
pub mod versioning;

pub use error::MlError;
pub use features::MlInput;
pub use model::{LoadedModels, load_models};
pub use retrain::run_retrain;
pub use service::{MlResult, MlService, MlServiceConfig, ScoreContext, adjust_severity_with_ml};
