//! The live detection loop.
//!
//! `Idle -> ModelsLoading -> AwaitingPlayback -> Running -> Idle`, with any
//! load or camera error landing in `Failed` until the next [`DetectionPipeline::start`].
//!
//! While running, a scheduler task ticks at a fixed interval. A tick is
//! dropped when the previous one is still in flight. Results that arrive
//! after the pipeline was stopped are thrown away before they reach the
//! canvas or the publisher.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::camera::{CameraBackend, MediaAcquirer, MediaSession, VideoStream};
use crate::config::PipelineConfig;
use crate::detection::DetectionResult;
use crate::error::{InferenceError, PipelineError};
use crate::frame::Frame;
use crate::geometry::DisplayGeometry;
use crate::models::{InferenceBackend, ModelService, ModelSet};
use crate::overlay::{OverlayRenderer, OverlaySurface};
use crate::publisher::{AgeReading, ResultPublisher};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    ModelLoad,
    CameraAccess,
    Inference,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Idle,
    ModelsLoading,
    AwaitingPlayback,
    Running,
    Failed(FailureKind),
}

impl PipelineState {
    pub fn is_failed(&self) -> bool {
        matches!(self, PipelineState::Failed(_))
    }
}

struct View<S> {
    surface: S,
    renderer: OverlayRenderer,
    geometry: DisplayGeometry,
    consecutive_failures: u32,
}

/// State shared between the pipeline handle and its tick tasks.
struct Shared<S> {
    state: watch::Sender<PipelineState>,
    publisher: ResultPublisher,
    frames: watch::Sender<Option<Arc<Frame>>>,
    view: Mutex<View<S>>,
}

impl<S: OverlaySurface> Shared<S> {
    fn view(&self) -> MutexGuard<'_, View<S>> {
        match self.view.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn set_state(&self, state: PipelineState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!(?previous, ?state, "pipeline state changed");
        }
    }

    /// Wipe everything a running pipeline put on screen.
    fn blank(&self, view: &mut View<S>) {
        self.publisher.clear();
        self.frames.send_replace(None);
        let geometry = view.geometry;
        if let Err(err) = view.renderer.render(&mut view.surface, geometry, None) {
            warn!("failed to clear overlay: {:#}", err);
        }
    }
}

struct Scheduler {
    token: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct DetectionPipeline<B, C, S>
where
    B: InferenceBackend,
    C: CameraBackend,
    S: OverlaySurface,
{
    config: PipelineConfig,
    models: Arc<ModelService<B>>,
    acquirer: MediaAcquirer<C>,
    shared: Arc<Shared<S>>,
    scheduler: Option<Scheduler>,
}

impl<B, C, S> DetectionPipeline<B, C, S>
where
    B: InferenceBackend,
    C: CameraBackend,
    S: OverlaySurface,
{
    pub fn new(
        config: PipelineConfig,
        models: Arc<ModelService<B>>,
        camera: C,
        surface: S,
        publisher: ResultPublisher,
    ) -> Self {
        let (state, _) = watch::channel(PipelineState::Idle);
        let (frames, _) = watch::channel(None);
        let geometry = surface.dimensions();
        Self {
            config,
            models,
            acquirer: MediaAcquirer::new(camera),
            shared: Arc::new(Shared {
                state,
                publisher,
                frames,
                view: Mutex::new(View {
                    surface,
                    renderer: OverlayRenderer::default(),
                    geometry,
                    consecutive_failures: 0,
                }),
            }),
            scheduler: None,
        }
    }

    pub fn state(&self) -> PipelineState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<PipelineState> {
        self.shared.state.subscribe()
    }

    pub fn subscribe_readings(&self) -> watch::Receiver<AgeReading> {
        self.shared.publisher.subscribe()
    }

    pub fn latest_reading(&self) -> AgeReading {
        self.shared.publisher.latest()
    }

    /// Most recent frame that went through the models.
    pub fn subscribe_frames(&self) -> watch::Receiver<Option<Arc<Frame>>> {
        self.shared.frames.subscribe()
    }

    pub fn with_surface<R>(&self, f: impl FnOnce(&S) -> R) -> R {
        f(&self.shared.view().surface)
    }

    pub fn geometry(&self) -> DisplayGeometry {
        self.shared.view().geometry
    }

    pub fn active_tracks(&self) -> usize {
        self.acquirer.active_tracks()
    }

    /// Whether a scheduler task may still fire ticks.
    pub fn has_pending_ticks(&self) -> bool {
        self.scheduler
            .as_ref()
            .is_some_and(|s| !s.token.is_cancelled() && !s.handle.is_finished())
    }

    /// Load models, open the camera, wait for playback, then start ticking.
    ///
    /// Restarting an already running pipeline stops it first.
    pub async fn start(&mut self) -> Result<(), PipelineError> {
        self.stop();
        self.shared.set_state(PipelineState::ModelsLoading);

        let models = match self.models.init().await {
            Ok(models) => models,
            Err(err) => {
                error!("{}", err);
                self.shared.set_state(PipelineState::Failed(FailureKind::ModelLoad));
                return Err(err.into());
            }
        };

        self.shared.set_state(PipelineState::AwaitingPlayback);
        let session = match self.acquirer.acquire_camera(&self.config.camera).await {
            Ok(session) => session,
            Err(err) => {
                error!("{}", err);
                self.shared.set_state(PipelineState::Failed(FailureKind::CameraAccess));
                return Err(err.into());
            }
        };
        let geometry = match session.await_playback(self.config.playback_timeout).await {
            Ok(geometry) => geometry,
            Err(err) => {
                error!("{}", err);
                self.acquirer.release();
                self.shared.set_state(PipelineState::Failed(FailureKind::CameraAccess));
                return Err(err.into());
            }
        };

        {
            let mut view = self.shared.view();
            view.geometry = geometry;
            view.consecutive_failures = 0;
            if let Err(err) = view.surface.resize(geometry) {
                warn!("failed to size overlay: {:#}", err);
            }
        }

        let token = CancellationToken::new();
        let ticker = Ticker {
            shared: self.shared.clone(),
            backend: self.models.backend(),
            models,
            session,
            token: token.clone(),
            max_failures: self.config.max_consecutive_failures.max(1),
        };
        let handle = tokio::spawn(ticker.run(self.config.tick_interval));
        self.scheduler = Some(Scheduler { token, handle });

        self.shared.set_state(PipelineState::Running);
        info!(%geometry, interval = ?self.config.tick_interval, "detection running");
        Ok(())
    }

    /// Cancel ticking, release the camera and clear what was shown.
    ///
    /// Safe to call in any state and any number of times. A failed pipeline
    /// stays `Failed` until it is started again.
    pub fn stop(&mut self) {
        if let Some(scheduler) = self.scheduler.take() {
            scheduler.token.cancel();
            scheduler.handle.abort();
            debug!("detection ticks cancelled");
        }
        self.acquirer.release();

        {
            let mut view = self.shared.view();
            view.consecutive_failures = 0;
            self.shared.blank(&mut view);
        }

        if !self.state().is_failed() {
            self.shared.set_state(PipelineState::Idle);
        }
    }
}

impl<B, C, S> Drop for DetectionPipeline<B, C, S>
where
    B: InferenceBackend,
    C: CameraBackend,
    S: OverlaySurface,
{
    fn drop(&mut self) {
        self.stop();
    }
}

/// The scheduler task and everything a tick needs.
struct Ticker<B: InferenceBackend, St: VideoStream, S> {
    shared: Arc<Shared<S>>,
    backend: Arc<B>,
    models: Arc<ModelSet<B::Model>>,
    session: MediaSession<St>,
    token: CancellationToken,
    max_failures: u32,
}

impl<B, St, S> Clone for Ticker<B, St, S>
where
    B: InferenceBackend,
    St: VideoStream,
{
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
            backend: self.backend.clone(),
            models: self.models.clone(),
            session: self.session.clone(),
            token: self.token.clone(),
            max_failures: self.max_failures,
        }
    }
}

type TickOutcome = Result<Option<(Frame, DetectionResult)>, InferenceError>;

impl<B, St, S> Ticker<B, St, S>
where
    B: InferenceBackend,
    St: VideoStream,
    S: OverlaySurface,
{
    async fn run(self, period: Duration) {
        let mut interval = time::interval(period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let in_flight = Arc::new(AtomicBool::new(false));

        loop {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => break,
                _ = interval.tick() => {}
            }

            if in_flight.swap(true, Ordering::AcqRel) {
                trace!("previous tick still running, skipping");
                continue;
            }

            let tick = self.clone();
            let in_flight = in_flight.clone();
            tokio::spawn(async move {
                let outcome = tick.infer().await;
                tick.complete(outcome);
                in_flight.store(false, Ordering::Release);
            });
        }
        debug!("scheduler stopped");
    }

    async fn infer(&self) -> TickOutcome {
        let session = self.session.clone();
        let backend = self.backend.clone();
        let models = self.models.clone();
        tokio::task::spawn_blocking(move || -> TickOutcome {
            let Some(frame) = session.grab()? else {
                return Ok(None);
            };
            let result = backend
                .analyze(&models, &frame)
                .map_err(|err| InferenceError::Model(format!("{:#}", err)))?;
            Ok(Some((frame, result)))
        })
        .await?
    }

    fn complete(&self, outcome: TickOutcome) {
        let mut view = self.shared.view();
        if self.token.is_cancelled() {
            trace!("discarding result of cancelled tick");
            return;
        }

        match outcome {
            Ok(None) => {}
            Ok(Some((frame, result))) => {
                view.consecutive_failures = 0;

                let frame_geometry = frame.geometry();
                if frame_geometry != view.geometry {
                    info!(from = %view.geometry, to = %frame_geometry, "video resolution changed");
                    view.geometry = frame_geometry;
                }
                let geometry = view.geometry;
                let result = result.rescaled(geometry);

                let View {
                    surface, renderer, ..
                } = &mut *view;
                if let Err(err) = renderer.render(surface, geometry, Some(&result)) {
                    warn!("overlay render failed: {:#}", err);
                }
                self.shared.publisher.publish(result.primary());
                self.shared.frames.send_replace(Some(Arc::new(frame)));
            }
            Err(err) => {
                view.consecutive_failures += 1;
                let failures = view.consecutive_failures;
                warn!(failures, "detection tick failed: {}", err);

                if failures >= self.max_failures {
                    error!("{}", PipelineError::InferenceStalled(failures));
                    self.token.cancel();
                    self.session.release();
                    self.shared.blank(&mut view);
                    self.shared
                        .set_state(PipelineState::Failed(FailureKind::Inference));
                }
            }
        }
    }
}
