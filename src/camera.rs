//! Camera acquisition.
//!
//! A [`MediaSession`] owns one open stream. Releasing it stops every track and
//! is idempotent; the last handle going away releases it too, so a session
//! can't outlive an error path. [`MediaAcquirer`] keeps at most one session
//! alive and releases the previous one before opening another.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::Duration;

use opencv::core::Mat;
use opencv::prelude::*;
use opencv::videoio;
use tracing::{debug, info, warn};

use crate::error::{CameraAccessError, InferenceError};
use crate::frame::Frame;
use crate::geometry::DisplayGeometry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FacingMode {
    #[default]
    User,
    Environment,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConstraints {
    /// Device index or `/dev/videoN` path.
    pub device: String,
    pub facing: FacingMode,
    pub width: Option<u32>,
    pub height: Option<u32>,
    pub audio: bool,
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self {
            device: "0".to_string(),
            facing: FacingMode::User,
            width: Some(640),
            height: Some(480),
            audio: false,
        }
    }
}

pub trait VideoStream: Send + 'static {
    /// Next frame, or `None` when the device has nothing yet.
    fn read_frame(&mut self) -> Result<Option<Frame>, InferenceError>;

    /// Stop every track of the stream.
    fn stop(&mut self);

    fn active_tracks(&self) -> usize;
}

pub trait CameraBackend: Send + Sync + 'static {
    type Stream: VideoStream;

    /// Blocks while the platform opens the device.
    fn open(&self, constraints: &CameraConstraints) -> Result<Self::Stream, CameraAccessError>;
}

struct SessionInner<S: VideoStream> {
    id: u64,
    released: AtomicBool,
    stream: Mutex<Option<S>>,
    geometry: Mutex<Option<DisplayGeometry>>,
}

impl<S: VideoStream> SessionInner<S> {
    fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    /// Never waits on a read in progress. When one holds the stream, the
    /// reader stops it as soon as the read returns.
    fn release(&self) {
        self.released.store(true, Ordering::SeqCst);
        match self.stream.try_lock() {
            Ok(mut guard) => self.stop(guard.take()),
            Err(TryLockError::Poisoned(poisoned)) => self.stop(poisoned.into_inner().take()),
            Err(TryLockError::WouldBlock) => {
                debug!(session = self.id, "camera busy reading, release deferred");
            }
        }
    }

    fn stop_now(&self) {
        let stream = match self.stream.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        self.stop(stream);
    }

    fn stop(&self, stream: Option<S>) {
        if let Some(mut stream) = stream {
            stream.stop();
            info!(session = self.id, "camera session released");
        }
    }
}

impl<S: VideoStream> Drop for SessionInner<S> {
    fn drop(&mut self) {
        self.stop_now();
    }
}

/// An acquired camera stream bound to its video sink.
pub struct MediaSession<S: VideoStream> {
    inner: Arc<SessionInner<S>>,
}

impl<S: VideoStream> Clone for MediaSession<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<S: VideoStream> MediaSession<S> {
    fn new(id: u64, stream: S) -> Self {
        Self {
            inner: Arc::new(SessionInner {
                id,
                released: AtomicBool::new(false),
                stream: Mutex::new(Some(stream)),
                geometry: Mutex::new(None),
            }),
        }
    }

    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Blocking read of the current frame.
    pub fn grab(&self) -> Result<Option<Frame>, InferenceError> {
        if self.inner.is_released() {
            return Err(released());
        }
        let frame = {
            let mut guard = self
                .inner
                .stream
                .lock()
                .map_err(|_| InferenceError::Capture("camera stream lock poisoned".to_string()))?;
            let stream = guard.as_mut().ok_or_else(released)?;
            stream.read_frame()
        };
        if self.inner.is_released() {
            self.inner.stop_now();
            return Err(released());
        }

        let frame = frame?;
        if let Some(frame) = &frame {
            if let Ok(mut geometry) = self.inner.geometry.lock() {
                *geometry = Some(frame.geometry());
            }
        }
        Ok(frame)
    }

    /// Native resolution of the last frame read, once playback started.
    pub fn geometry(&self) -> Option<DisplayGeometry> {
        self.inner.geometry.lock().ok().and_then(|g| *g)
    }

    /// Wait until the stream delivers its first frame and return its geometry.
    pub async fn await_playback(
        &self,
        timeout: Duration,
    ) -> Result<DisplayGeometry, CameraAccessError> {
        let session = self.clone();
        let wait = async move {
            loop {
                let probe = session.clone();
                let frame = tokio::task::spawn_blocking(move || probe.grab())
                    .await
                    .map_err(|err| CameraAccessError::DeviceUnavailable(err.to_string()))?
                    .map_err(|err| CameraAccessError::DeviceUnavailable(err.to_string()))?;
                match frame {
                    Some(frame) if !frame.geometry().is_empty() => {
                        return Ok::<_, CameraAccessError>(frame.geometry())
                    }
                    _ => tokio::time::sleep(Duration::from_millis(20)).await,
                }
            }
        };
        let geometry = tokio::time::timeout(timeout, wait).await.map_err(|_| {
            CameraAccessError::DeviceUnavailable(format!(
                "no video frames within {:?}",
                timeout
            ))
        })??;
        info!(session = self.id(), %geometry, "video playing");
        Ok(geometry)
    }

    pub fn release(&self) {
        self.inner.release();
    }

    pub fn is_released(&self) -> bool {
        self.active_tracks() == 0
    }

    pub fn active_tracks(&self) -> usize {
        if self.inner.is_released() {
            return 0;
        }
        match self.inner.stream.try_lock() {
            Ok(guard) => guard.as_ref().map_or(0, |s| s.active_tracks()),
            // a read holds the stream, so it is still playing
            Err(TryLockError::WouldBlock) => 1,
            Err(TryLockError::Poisoned(_)) => 0,
        }
    }
}

fn released() -> InferenceError {
    InferenceError::Capture("camera session was released".to_string())
}

/// Hands out camera sessions, one at a time.
pub struct MediaAcquirer<C: CameraBackend> {
    backend: Arc<C>,
    session: Option<MediaSession<C::Stream>>,
    next_id: AtomicU64,
}

impl<C: CameraBackend> MediaAcquirer<C> {
    pub fn new(backend: C) -> Self {
        Self {
            backend: Arc::new(backend),
            session: None,
            next_id: AtomicU64::new(1),
        }
    }

    /// Open the camera. Any session this acquirer handed out before is
    /// released first.
    pub async fn acquire_camera(
        &mut self,
        constraints: &CameraConstraints,
    ) -> Result<MediaSession<C::Stream>, CameraAccessError> {
        self.release();

        if constraints.audio {
            return Err(CameraAccessError::DeviceUnavailable(
                "audio capture is not supported".to_string(),
            ));
        }

        let backend = self.backend.clone();
        let request = constraints.clone();
        let stream = tokio::task::spawn_blocking(move || backend.open(&request))
            .await
            .map_err(|err| CameraAccessError::DeviceUnavailable(err.to_string()))??;

        let session = MediaSession::new(self.next_id.fetch_add(1, Ordering::Relaxed), stream);
        info!(session = session.id(), device = %constraints.device, "camera session acquired");
        self.session = Some(session.clone());
        Ok(session)
    }

    pub fn release(&mut self) {
        if let Some(session) = self.session.take() {
            session.release();
        }
    }

    pub fn session(&self) -> Option<&MediaSession<C::Stream>> {
        self.session.as_ref()
    }

    pub fn active_tracks(&self) -> usize {
        self.session.as_ref().map_or(0, |s| s.active_tracks())
    }
}

impl<C: CameraBackend> Drop for MediaAcquirer<C> {
    fn drop(&mut self) {
        self.release();
    }
}

/// Local camera through `opencv::videoio`.
#[derive(Debug, Default, Clone, Copy)]
pub struct OpenCvCamera;

pub struct OpenCvStream {
    capture: videoio::VideoCapture,
    open: bool,
}

impl CameraBackend for OpenCvCamera {
    type Stream = OpenCvStream;

    fn open(&self, constraints: &CameraConstraints) -> Result<OpenCvStream, CameraAccessError> {
        if constraints.facing == FacingMode::Environment {
            warn!("facing mode can't be selected on this platform, using the requested device");
        }
        let index = parse_device_index(&constraints.device).ok_or_else(|| {
            CameraAccessError::DeviceUnavailable(format!(
                "unrecognized camera device {}",
                constraints.device
            ))
        })?;
        check_device_permission(index)?;

        let mut capture = videoio::VideoCapture::new(index, videoio::CAP_ANY)
            .map_err(|err| CameraAccessError::DeviceUnavailable(err.to_string()))?;
        let opened = videoio::VideoCapture::is_opened(&capture)
            .map_err(|err| CameraAccessError::DeviceUnavailable(err.to_string()))?;
        if !opened {
            return Err(CameraAccessError::DeviceUnavailable(format!(
                "unable to open camera #{index}"
            )));
        }

        if let Some(width) = constraints.width {
            let _ = capture.set(videoio::CAP_PROP_FRAME_WIDTH, width as f64);
        }
        if let Some(height) = constraints.height {
            let _ = capture.set(videoio::CAP_PROP_FRAME_HEIGHT, height as f64);
        }
        debug!(index, "opened camera");

        Ok(OpenCvStream {
            capture,
            open: true,
        })
    }
}

impl VideoStream for OpenCvStream {
    fn read_frame(&mut self) -> Result<Option<Frame>, InferenceError> {
        let mut frame = Mat::default();
        self.capture
            .read(&mut frame)
            .map_err(|err| InferenceError::Capture(err.to_string()))?;
        let size = frame
            .size()
            .map_err(|err| InferenceError::Capture(err.to_string()))?;
        if size.width == 0 {
            return Ok(None);
        }
        Frame::from_mat(&frame)
            .map(Some)
            .map_err(|err| InferenceError::Capture(err.to_string()))
    }

    fn stop(&mut self) {
        if !self.open {
            return;
        }
        if let Err(err) = self.capture.release() {
            warn!("failed to release camera: {}", err);
        }
        self.open = false;
    }

    fn active_tracks(&self) -> usize {
        usize::from(self.open)
    }
}

impl Drop for OpenCvStream {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Accepts `2` or `/dev/video2`.
pub fn parse_device_index(device: &str) -> Option<i32> {
    if let Ok(index) = device.parse::<i32>() {
        return Some(index);
    }
    device
        .strip_prefix("/dev/video")
        .filter(|rest| !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()))
        .and_then(|rest| rest.parse().ok())
}

/// OpenCV reports every failure the same way, so look at the device node
/// first to tell a denied permission apart from a missing camera.
fn check_device_permission(index: i32) -> Result<(), CameraAccessError> {
    let node = format!("/dev/video{index}");
    if !Path::new(&node).exists() {
        return Ok(());
    }
    match std::fs::OpenOptions::new().read(true).open(&node) {
        Ok(_) => Ok(()),
        Err(err) if err.kind() == std::io::ErrorKind::PermissionDenied => Err(
            CameraAccessError::PermissionDenied(format!("{node}: {err}")),
        ),
        Err(_) => Ok(()),
    }
}
