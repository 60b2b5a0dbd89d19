use std::path::PathBuf;

use thiserror::Error;

use crate::models::ModelKind;

type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// One of the three models could not be initialized.
#[derive(Error, Debug)]
#[error(
    "failed to load {model} model from {}: {source}. Check that the model files exist and are readable",
    path.display()
)]
pub struct ModelLoadError {
    pub model: ModelKind,
    pub path: PathBuf,
    #[source]
    pub source: BoxError,
}

impl ModelLoadError {
    pub fn new(model: ModelKind, path: impl Into<PathBuf>, source: impl Into<BoxError>) -> Self {
        Self {
            model,
            path: path.into(),
            source: source.into(),
        }
    }
}

#[derive(Error, Debug)]
pub enum CameraAccessError {
    #[error("camera access denied: {0}")]
    PermissionDenied(String),
    #[error("camera unavailable: {0}")]
    DeviceUnavailable(String),
}

/// Failure of a single detection tick.
#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("frame capture failed: {0}")]
    Capture(String),
    #[error("model inference failed: {0}")]
    Model(String),
    #[error("inference task aborted: {0}")]
    Aborted(#[from] tokio::task::JoinError),
}

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    ModelLoad(#[from] ModelLoadError),
    #[error(transparent)]
    CameraAccess(#[from] CameraAccessError),
    #[error("inference failed {0} times in a row")]
    InferenceStalled(u32),
}

#[derive(Error, Debug)]
pub enum ErrorWrapper {
    #[error("Zenoh error {0:?}")]
    ZenohError(#[from] zenoh::Error),
}
