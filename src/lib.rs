pub mod camera;
pub mod config;
pub mod detection;
pub mod dnn;
pub mod error;
pub mod frame;
pub mod geometry;
pub mod models;
pub mod overlay;
pub mod pipeline;
pub mod publisher;

pub use camera::{
    CameraBackend, CameraConstraints, FacingMode, MediaAcquirer, MediaSession, OpenCvCamera,
    VideoStream,
};
pub use config::PipelineConfig;
pub use detection::{DetectionResult, Expressions, FaceAnalysis, Gender};
pub use dnn::DnnBackend;
pub use error::{CameraAccessError, ErrorWrapper, InferenceError, ModelLoadError, PipelineError};
pub use frame::Frame;
pub use geometry::{BoundingBox, DisplayGeometry};
pub use models::{InferenceBackend, ModelArtifact, ModelKind, ModelManifest, ModelService, ModelSet};
pub use overlay::{MatCanvas, OverlayRenderer, OverlaySurface};
pub use pipeline::{DetectionPipeline, FailureKind, PipelineState};
pub use publisher::{AgeReading, ExpressionStress, ResultPublisher, StressProjection};

/// Key expression the readings are published on.
pub const READINGS_KEY: &str = "bio-age/visual/reading";

/// Key expression snapshots are published on, JPEG encoded.
pub const SNAPSHOT_KEY: &str = "bio-age/visual/snapshot";

pub fn jpeg_to_mat(data: &[u8]) -> anyhow::Result<opencv::core::Mat> {
    let buffer = opencv::core::Vector::<u8>::from_slice(data);
    Ok(opencv::imgcodecs::imdecode(
        &buffer,
        opencv::imgcodecs::IMREAD_COLOR,
    )?)
}

pub fn setup_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

pub fn build_zenoh_config(
    listen: &[zenoh_config::EndPoint],
    connect: &[zenoh_config::EndPoint],
) -> zenoh::config::Config {
    let mut zenoh_config = zenoh::config::Config::default();
    if !listen.is_empty() {
        zenoh_config.listen.endpoints = listen.to_vec();
        tracing::info!(
            "Configured listening endpoints {:?}",
            zenoh_config.listen.endpoints
        );
    }
    if !connect.is_empty() {
        zenoh_config.connect.endpoints = connect.to_vec();
        tracing::info!(
            "Configured connect endpoints {:?}",
            zenoh_config.connect.endpoints
        );
    }
    zenoh_config
}
