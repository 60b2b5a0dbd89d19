//! Model loading.
//!
//! Each model lives under the base directory as a weights manifest plus one or
//! more shard files. [`ModelService`] loads all three concurrently and hands out
//! shared [`ModelSet`] handles; a second `init` is a no-op while loaded.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info};

use crate::detection::DetectionResult;
use crate::error::ModelLoadError;
use crate::frame::Frame;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModelKind {
    FaceDetector,
    ExpressionClassifier,
    AgeGenderEstimator,
}

impl ModelKind {
    pub const ALL: [ModelKind; 3] = [
        ModelKind::FaceDetector,
        ModelKind::ExpressionClassifier,
        ModelKind::AgeGenderEstimator,
    ];

    pub fn stem(self) -> &'static str {
        match self {
            ModelKind::FaceDetector => "tiny_face_detector_model",
            ModelKind::ExpressionClassifier => "face_expression_model",
            ModelKind::AgeGenderEstimator => "age_gender_model",
        }
    }

    pub fn manifest_name(self) -> String {
        format!("{}-weights_manifest.json", self.stem())
    }

    pub fn label(self) -> &'static str {
        match self {
            ModelKind::FaceDetector => "face detector",
            ModelKind::ExpressionClassifier => "expression classifier",
            ModelKind::AgeGenderEstimator => "age/gender estimator",
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelFormat {
    Onnx,
    Cascade,
}

fn default_scale() -> f64 {
    1.0 / 255.0
}

fn default_threshold() -> f32 {
    0.5
}

/// Contents of `<stem>-weights_manifest.json`.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ModelManifest {
    pub format: ModelFormat,
    /// Shard files relative to the manifest, concatenated in order.
    pub weights: Vec<String>,
    pub input_width: u32,
    pub input_height: u32,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub mean: [f64; 3],
    #[serde(default = "default_scale")]
    pub scale: f64,
    #[serde(default)]
    pub swap_rb: bool,
    #[serde(default)]
    pub grayscale: bool,
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

/// A manifest with its shard paths resolved and checked.
#[derive(Debug, Clone)]
pub struct ModelArtifact {
    pub kind: ModelKind,
    pub manifest: ModelManifest,
    pub shards: Vec<PathBuf>,
}

impl ModelArtifact {
    /// Read every shard and concatenate them into one buffer.
    pub fn read_weights(&self) -> std::io::Result<Vec<u8>> {
        let mut buffer = Vec::new();
        for shard in &self.shards {
            buffer.extend(std::fs::read(shard)?);
        }
        Ok(buffer)
    }
}

/// Something that can turn model artifacts into runnable models and run them.
///
/// Both methods block; callers run them on the blocking pool.
pub trait InferenceBackend: Send + Sync + 'static {
    type Model: Send + Sync + 'static;

    fn load(&self, artifact: &ModelArtifact) -> anyhow::Result<Self::Model>;

    fn analyze(
        &self,
        models: &ModelSet<Self::Model>,
        frame: &Frame,
    ) -> anyhow::Result<DetectionResult>;
}

pub struct ModelSet<M> {
    pub detector: M,
    pub expressions: M,
    pub age_gender: M,
}

pub struct ModelService<B: InferenceBackend> {
    backend: Arc<B>,
    base_dir: PathBuf,
    loaded: Mutex<Option<Arc<ModelSet<B::Model>>>>,
}

impl<B: InferenceBackend> ModelService<B> {
    pub fn new(backend: B, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            backend: Arc::new(backend),
            base_dir: base_dir.into(),
            loaded: Mutex::new(None),
        }
    }

    pub fn backend(&self) -> Arc<B> {
        self.backend.clone()
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Load all three models, or return the already loaded set.
    ///
    /// Concurrent callers wait on the same load. A failure leaves the service
    /// unloaded so a later call starts over.
    pub async fn init(&self) -> Result<Arc<ModelSet<B::Model>>, ModelLoadError> {
        let mut loaded = self.loaded.lock().await;
        if let Some(models) = loaded.as_ref() {
            debug!("models already loaded");
            return Ok(models.clone());
        }

        info!(base_dir = %self.base_dir.display(), "loading models");
        let (detector, expressions, age_gender) = tokio::try_join!(
            load_model(&self.backend, &self.base_dir, ModelKind::FaceDetector),
            load_model(&self.backend, &self.base_dir, ModelKind::ExpressionClassifier),
            load_model(&self.backend, &self.base_dir, ModelKind::AgeGenderEstimator),
        )
        .map_err(|err| {
            error!(model = %err.model, "model load failed: {}", err);
            err
        })?;

        let models = Arc::new(ModelSet {
            detector,
            expressions,
            age_gender,
        });
        *loaded = Some(models.clone());
        info!("models loaded");
        Ok(models)
    }

    pub async fn is_loaded(&self) -> bool {
        self.loaded.lock().await.is_some()
    }

    /// Drop the service's handle. Pipelines still holding a set keep it alive
    /// until they stop.
    pub async fn teardown(&self) {
        if self.loaded.lock().await.take().is_some() {
            info!("models released");
        }
    }
}

async fn load_model<B: InferenceBackend>(
    backend: &Arc<B>,
    base_dir: &Path,
    kind: ModelKind,
) -> Result<B::Model, ModelLoadError> {
    let artifact = resolve_artifact(base_dir, kind).await?;
    debug!(model = %kind, shards = artifact.shards.len(), "initializing model");

    let backend = backend.clone();
    let dir = base_dir.to_path_buf();
    tokio::task::spawn_blocking(move || backend.load(&artifact))
        .await
        .map_err(|err| ModelLoadError::new(kind, &dir, err))?
        .map_err(|err| ModelLoadError::new(kind, dir, err))
}

async fn resolve_artifact(
    base_dir: &Path,
    kind: ModelKind,
) -> Result<ModelArtifact, ModelLoadError> {
    let manifest_path = base_dir.join(kind.manifest_name());
    let raw = tokio::fs::read(&manifest_path)
        .await
        .map_err(|err| ModelLoadError::new(kind, &manifest_path, err))?;
    let manifest: ModelManifest = serde_json::from_slice(&raw)
        .map_err(|err| ModelLoadError::new(kind, &manifest_path, err))?;

    if manifest.weights.is_empty() {
        return Err(ModelLoadError::new(
            kind,
            &manifest_path,
            "manifest lists no weight shards",
        ));
    }

    let mut shards = Vec::with_capacity(manifest.weights.len());
    for shard in &manifest.weights {
        let path = base_dir.join(shard);
        tokio::fs::metadata(&path)
            .await
            .map_err(|err| ModelLoadError::new(kind, &path, err))?;
        shards.push(path);
    }

    Ok(ModelArtifact {
        kind,
        manifest,
        shards,
    })
}
