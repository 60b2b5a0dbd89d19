use std::time::Duration;

use crate::camera::CameraConstraints;

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_millis(100);
pub const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 3;
pub const DEFAULT_PLAYBACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub tick_interval: Duration,
    /// Inference failures in a row before the pipeline gives up.
    pub max_consecutive_failures: u32,
    pub playback_timeout: Duration,
    pub camera: CameraConstraints,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            tick_interval: DEFAULT_TICK_INTERVAL,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            playback_timeout: DEFAULT_PLAYBACK_TIMEOUT,
            camera: CameraConstraints::default(),
        }
    }
}
