use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bio_age_vision::{
    AgeReading, BoundingBox, CameraAccessError, CameraBackend, CameraConstraints,
    DetectionPipeline, DetectionResult, DisplayGeometry, Expressions, FaceAnalysis, FailureKind,
    Frame, InferenceBackend, InferenceError, ModelArtifact, ModelKind, ModelService, ModelSet,
    OverlaySurface, PipelineConfig, PipelineError, PipelineState, ResultPublisher, VideoStream,
};
use tempfile::TempDir;
use tokio::sync::watch;

const MODEL_INPUT: DisplayGeometry = DisplayGeometry {
    width: 100,
    height: 100,
};

#[derive(Debug, Clone)]
enum Step {
    Face { age: f32, sad: f32 },
    NoFace,
    Fail,
}

#[derive(Default)]
struct Counters {
    loads: AtomicUsize,
    analyses: AtomicUsize,
    running: AtomicUsize,
    max_running: AtomicUsize,
}

struct ScriptedBackend {
    script: Mutex<VecDeque<Step>>,
    /// Step used once the script runs out.
    fallback: Step,
    delay: Duration,
    fail_load: bool,
    counters: Arc<Counters>,
}

impl ScriptedBackend {
    fn new(steps: impl IntoIterator<Item = Step>) -> Self {
        Self {
            script: Mutex::new(steps.into_iter().collect()),
            fallback: Step::NoFace,
            delay: Duration::ZERO,
            fail_load: false,
            counters: Arc::new(Counters::default()),
        }
    }
}

impl InferenceBackend for ScriptedBackend {
    type Model = ModelKind;

    fn load(&self, artifact: &ModelArtifact) -> anyhow::Result<ModelKind> {
        self.counters.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_load && artifact.kind == ModelKind::AgeGenderEstimator {
            anyhow::bail!("bad shard");
        }
        Ok(artifact.kind)
    }

    fn analyze(&self, models: &ModelSet<ModelKind>, _: &Frame) -> anyhow::Result<DetectionResult> {
        assert_eq!(models.detector, ModelKind::FaceDetector);
        self.counters.analyses.fetch_add(1, Ordering::SeqCst);
        let running = self.counters.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.counters.max_running.fetch_max(running, Ordering::SeqCst);
        std::thread::sleep(self.delay);
        self.counters.running.fetch_sub(1, Ordering::SeqCst);

        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        match step {
            Step::Face { age, sad } => Ok(DetectionResult {
                input_size: MODEL_INPUT,
                faces: vec![FaceAnalysis {
                    bbox: BoundingBox::new(10.0, 10.0, 50.0, 50.0),
                    score: 0.95,
                    age,
                    gender: None,
                    expressions: [("sad", sad), ("neutral", 1.0 - sad)].into_iter().collect(),
                }],
            }),
            Step::NoFace => Ok(DetectionResult::empty(MODEL_INPUT)),
            Step::Fail => anyhow::bail!("inference exploded"),
        }
    }
}

#[derive(Clone)]
struct FakeCamera {
    open_streams: Arc<AtomicUsize>,
    opens: Arc<AtomicUsize>,
    resolution: Arc<Mutex<DisplayGeometry>>,
    deny: bool,
    /// Opens fine but never delivers a frame.
    silent: bool,
}

impl FakeCamera {
    fn new() -> Self {
        Self {
            open_streams: Arc::new(AtomicUsize::new(0)),
            opens: Arc::new(AtomicUsize::new(0)),
            resolution: Arc::new(Mutex::new(DisplayGeometry::new(640, 480))),
            deny: false,
            silent: false,
        }
    }
}

struct FakeStream {
    camera: FakeCamera,
    stopped: bool,
}

impl VideoStream for FakeStream {
    fn read_frame(&mut self) -> Result<Option<Frame>, InferenceError> {
        if self.camera.silent {
            return Ok(None);
        }
        let resolution = *self.camera.resolution.lock().unwrap();
        Ok(Some(Frame::blank(resolution.width, resolution.height)))
    }

    fn stop(&mut self) {
        if !self.stopped {
            self.stopped = true;
            self.camera.open_streams.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn active_tracks(&self) -> usize {
        usize::from(!self.stopped)
    }
}

impl CameraBackend for FakeCamera {
    type Stream = FakeStream;

    fn open(&self, _: &CameraConstraints) -> Result<FakeStream, CameraAccessError> {
        if self.deny {
            return Err(CameraAccessError::PermissionDenied("user said no".to_string()));
        }
        self.opens.fetch_add(1, Ordering::SeqCst);
        self.open_streams.fetch_add(1, Ordering::SeqCst);
        Ok(FakeStream {
            camera: self.clone(),
            stopped: false,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Op {
    Resize(DisplayGeometry),
    Clear,
    Draw {
        bbox: BoundingBox,
        canvas: DisplayGeometry,
    },
}

#[derive(Clone, Default)]
struct RecordingSurface {
    size: DisplayGeometry,
    ops: Arc<Mutex<Vec<Op>>>,
}

impl OverlaySurface for RecordingSurface {
    fn dimensions(&self) -> DisplayGeometry {
        self.size
    }

    fn resize(&mut self, geometry: DisplayGeometry) -> anyhow::Result<()> {
        self.size = geometry;
        self.ops.lock().unwrap().push(Op::Resize(geometry));
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        self.ops.lock().unwrap().push(Op::Clear);
        Ok(())
    }

    fn draw_face(&mut self, face: &FaceAnalysis) -> anyhow::Result<()> {
        self.ops.lock().unwrap().push(Op::Draw {
            bbox: face.bbox,
            canvas: self.size,
        });
        Ok(())
    }
}

type TestPipeline = DetectionPipeline<ScriptedBackend, FakeCamera, RecordingSurface>;

struct Harness {
    pipeline: TestPipeline,
    camera: FakeCamera,
    counters: Arc<Counters>,
    ops: Arc<Mutex<Vec<Op>>>,
    models: TempDir,
}

fn write_models(dir: &Path) {
    for kind in ModelKind::ALL {
        let manifest = serde_json::json!({
            "format": "onnx",
            "weights": [format!("{}-shard1", kind.stem())],
            "input_width": MODEL_INPUT.width,
            "input_height": MODEL_INPUT.height,
        });
        std::fs::write(dir.join(kind.manifest_name()), manifest.to_string()).unwrap();
        std::fs::write(dir.join(format!("{}-shard1", kind.stem())), b"weights").unwrap();
    }
}

fn harness(backend: ScriptedBackend, camera: FakeCamera, interval: Duration) -> Harness {
    let models = tempfile::tempdir().unwrap();
    write_models(models.path());
    let counters = backend.counters.clone();
    let surface = RecordingSurface::default();
    let ops = surface.ops.clone();
    let config = PipelineConfig {
        tick_interval: interval,
        playback_timeout: Duration::from_secs(2),
        ..Default::default()
    };
    let service = Arc::new(ModelService::new(backend, models.path()));
    let pipeline = DetectionPipeline::new(
        config,
        service,
        camera.clone(),
        surface,
        ResultPublisher::default(),
    );
    Harness {
        pipeline,
        camera,
        counters,
        ops,
        models,
    }
}

async fn next_reading(rx: &mut watch::Receiver<AgeReading>) -> AgeReading {
    tokio::time::timeout(Duration::from_secs(3), rx.changed())
        .await
        .expect("no reading in time")
        .unwrap();
    *rx.borrow_and_update()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(3);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

#[tokio::test]
async fn reading_follows_face_then_clears() {
    let backend = ScriptedBackend::new([Step::Face { age: 34.6, sad: 0.42 }, Step::NoFace]);
    let mut h = harness(backend, FakeCamera::new(), Duration::from_millis(40));
    let mut readings = h.pipeline.subscribe_readings();

    h.pipeline.start().await.unwrap();
    assert_eq!(h.pipeline.state(), PipelineState::Running);

    assert_eq!(
        next_reading(&mut readings).await,
        AgeReading {
            age: Some(35),
            stress_percent: Some(42)
        }
    );
    assert_eq!(
        next_reading(&mut readings).await,
        AgeReading {
            age: None,
            stress_percent: None
        }
    );
    h.pipeline.stop();
}

#[tokio::test]
async fn model_failure_never_touches_camera() {
    let mut backend = ScriptedBackend::new([]);
    backend.fail_load = true;
    let mut h = harness(backend, FakeCamera::new(), Duration::from_millis(10));

    let err = h.pipeline.start().await.err().unwrap();
    match err {
        PipelineError::ModelLoad(err) => {
            assert_eq!(err.model, ModelKind::AgeGenderEstimator);
            assert_eq!(err.path, h.models.path());
        }
        other => panic!("unexpected error {other:?}"),
    }
    assert_eq!(
        h.pipeline.state(),
        PipelineState::Failed(FailureKind::ModelLoad)
    );
    assert_eq!(h.camera.opens.load(Ordering::SeqCst), 0);
    assert!(!h.pipeline.has_pending_ticks());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(h.counters.analyses.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn camera_denial_fails_and_stays_failed() {
    let mut camera = FakeCamera::new();
    camera.deny = true;
    let mut h = harness(ScriptedBackend::new([]), camera, Duration::from_millis(10));

    let err = h.pipeline.start().await.err().unwrap();
    assert!(matches!(
        err,
        PipelineError::CameraAccess(CameraAccessError::PermissionDenied(_))
    ));
    assert_eq!(
        h.pipeline.state(),
        PipelineState::Failed(FailureKind::CameraAccess)
    );

    h.pipeline.stop();
    assert_eq!(
        h.pipeline.state(),
        PipelineState::Failed(FailureKind::CameraAccess)
    );
    assert_eq!(h.pipeline.active_tracks(), 0);
    assert!(!h.pipeline.has_pending_ticks());
}

#[tokio::test]
async fn stop_releases_camera_and_ticks() {
    let mut backend = ScriptedBackend::new([]);
    backend.fallback = Step::Face { age: 50.0, sad: 0.1 };
    let mut h = harness(backend, FakeCamera::new(), Duration::from_millis(10));
    let mut readings = h.pipeline.subscribe_readings();
    let frames = h.pipeline.subscribe_frames();

    h.pipeline.start().await.unwrap();
    assert_eq!(next_reading(&mut readings).await.age, Some(50));
    assert!(h.pipeline.has_pending_ticks());
    assert!(frames.borrow().is_some());

    for _ in 0..3 {
        h.pipeline.stop();
        assert_eq!(h.pipeline.state(), PipelineState::Idle);
        assert_eq!(h.pipeline.active_tracks(), 0);
        assert!(!h.pipeline.has_pending_ticks());
        assert_eq!(h.pipeline.latest_reading(), AgeReading::default());
        assert!(frames.borrow().is_none());
    }

    wait_until(|| h.camera.open_streams.load(Ordering::SeqCst) == 0).await;

    let analyses = h.counters.analyses.load(Ordering::SeqCst);
    tokio::time::sleep(Duration::from_millis(60)).await;
    // at most the tick that was already in flight
    assert!(h.counters.analyses.load(Ordering::SeqCst) <= analyses + 1);
    assert_eq!(h.pipeline.latest_reading(), AgeReading::default());
}

#[tokio::test]
async fn stop_while_waiting_for_playback_releases_camera() {
    let mut camera = FakeCamera::new();
    camera.silent = true;
    let mut h = harness(ScriptedBackend::new([]), camera, Duration::from_millis(10));

    let pending = tokio::time::timeout(Duration::from_millis(50), h.pipeline.start()).await;
    assert!(pending.is_err());
    assert_eq!(h.pipeline.state(), PipelineState::AwaitingPlayback);
    assert_eq!(h.camera.opens.load(Ordering::SeqCst), 1);

    h.pipeline.stop();
    assert_eq!(h.pipeline.state(), PipelineState::Idle);
    assert_eq!(h.pipeline.active_tracks(), 0);
    assert!(!h.pipeline.has_pending_ticks());
    wait_until(|| h.camera.open_streams.load(Ordering::SeqCst) == 0).await;
    assert_eq!(h.counters.analyses.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn restart_replaces_camera_session() {
    let mut h = harness(ScriptedBackend::new([]), FakeCamera::new(), Duration::from_millis(10));

    h.pipeline.start().await.unwrap();
    h.pipeline.start().await.unwrap();

    assert_eq!(h.camera.opens.load(Ordering::SeqCst), 2);
    assert_eq!(h.pipeline.active_tracks(), 1);
    wait_until(|| h.camera.open_streams.load(Ordering::SeqCst) == 1).await;
    // models are loaded once across restarts
    assert_eq!(h.counters.loads.load(Ordering::SeqCst), 3);

    drop(h.pipeline);
    wait_until(|| h.camera.open_streams.load(Ordering::SeqCst) == 0).await;
}

#[tokio::test]
async fn three_failures_in_a_row_fail_the_pipeline() {
    let backend = ScriptedBackend::new([Step::Fail, Step::Fail, Step::Fail]);
    let mut h = harness(backend, FakeCamera::new(), Duration::from_millis(10));
    let mut state = h.pipeline.subscribe_state();

    h.pipeline.start().await.unwrap();
    tokio::time::timeout(Duration::from_secs(3), async {
        while !state.borrow_and_update().is_failed() {
            state.changed().await.unwrap();
        }
    })
    .await
    .expect("pipeline did not fail");

    assert_eq!(
        h.pipeline.state(),
        PipelineState::Failed(FailureKind::Inference)
    );
    assert_eq!(h.camera.open_streams.load(Ordering::SeqCst), 0);
    assert!(!h.pipeline.has_pending_ticks());
    assert_eq!(h.counters.analyses.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn isolated_failures_are_skipped() {
    let backend = ScriptedBackend::new([
        Step::Fail,
        Step::Fail,
        Step::Face { age: 28.2, sad: 0.05 },
        Step::Fail,
        Step::Fail,
        Step::Face { age: 29.0, sad: 0.05 },
    ]);
    let mut h = harness(backend, FakeCamera::new(), Duration::from_millis(10));
    let mut readings = h.pipeline.subscribe_readings();

    h.pipeline.start().await.unwrap();
    assert_eq!(next_reading(&mut readings).await.age, Some(28));
    assert_eq!(next_reading(&mut readings).await.age, Some(29));
    assert_eq!(h.pipeline.state(), PipelineState::Running);
    h.pipeline.stop();
}

#[tokio::test]
async fn slow_inference_drops_ticks_instead_of_queueing() {
    let mut backend = ScriptedBackend::new([]);
    backend.delay = Duration::from_millis(120);
    let mut h = harness(backend, FakeCamera::new(), Duration::from_millis(10));

    h.pipeline.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    h.pipeline.stop();

    assert_eq!(h.counters.max_running.load(Ordering::SeqCst), 1);
    let analyses = h.counters.analyses.load(Ordering::SeqCst);
    assert!(analyses >= 1);
    assert!(analyses <= 5, "ran {analyses} analyses");
}

#[tokio::test]
async fn result_arriving_after_stop_is_discarded() {
    let mut backend = ScriptedBackend::new([Step::Face { age: 41.0, sad: 0.3 }]);
    backend.delay = Duration::from_millis(200);
    let mut h = harness(backend, FakeCamera::new(), Duration::from_millis(10));

    h.pipeline.start().await.unwrap();
    wait_until(|| h.counters.running.load(Ordering::SeqCst) == 1).await;
    h.pipeline.stop();
    let ops_at_stop = h.ops.lock().unwrap().len();

    wait_until(|| h.counters.running.load(Ordering::SeqCst) == 0).await;
    tokio::time::sleep(Duration::from_millis(50)).await;

    assert_eq!(h.pipeline.latest_reading(), AgeReading::default());
    assert_eq!(h.ops.lock().unwrap().len(), ops_at_stop);
    assert!(!h
        .ops
        .lock()
        .unwrap()
        .iter()
        .any(|op| matches!(op, Op::Draw { .. })));
}

#[tokio::test]
async fn canvas_is_cleared_before_each_draw() {
    let backend = ScriptedBackend::new([
        Step::Face { age: 30.0, sad: 0.2 },
        Step::Face { age: 31.0, sad: 0.2 },
        Step::NoFace,
    ]);
    let mut h = harness(backend, FakeCamera::new(), Duration::from_millis(10));
    let mut readings = h.pipeline.subscribe_readings();

    h.pipeline.start().await.unwrap();
    while next_reading(&mut readings).await.age.is_some() {}
    h.pipeline.stop();

    let ops = h.ops.lock().unwrap();
    let mut cleared = false;
    for op in ops.iter() {
        match op {
            Op::Clear => cleared = true,
            Op::Draw { .. } => {
                assert!(cleared, "drew without clearing: {ops:?}");
                cleared = false;
            }
            Op::Resize(_) => {}
        }
    }
    assert!(matches!(ops.last(), Some(Op::Clear)));
}

#[tokio::test]
async fn resolution_change_resizes_canvas_before_drawing() {
    let mut backend = ScriptedBackend::new([]);
    backend.fallback = Step::Face { age: 30.0, sad: 0.2 };
    let camera = FakeCamera::new();
    let mut h = harness(backend, camera.clone(), Duration::from_millis(10));
    let mut readings = h.pipeline.subscribe_readings();

    h.pipeline.start().await.unwrap();
    next_reading(&mut readings).await;
    assert_eq!(h.pipeline.geometry(), DisplayGeometry::new(640, 480));

    let rotated = DisplayGeometry::new(480, 640);
    *camera.resolution.lock().unwrap() = rotated;
    wait_until(|| h.pipeline.with_surface(|s| s.dimensions()) == rotated).await;
    wait_until(|| {
        h.ops
            .lock()
            .unwrap()
            .iter()
            .any(|op| matches!(op, Op::Draw { canvas, .. } if *canvas == rotated))
    })
    .await;
    h.pipeline.stop();

    assert_eq!(h.pipeline.geometry(), rotated);
    let ops = h.ops.lock().unwrap();
    for op in ops.iter() {
        if let Op::Draw { bbox, canvas } = op {
            let (sx, sy) = canvas.scale_from(MODEL_INPUT);
            assert_eq!(*bbox, BoundingBox::new(10.0, 10.0, 50.0, 50.0).scaled(sx, sy));
        }
    }
    assert!(ops.contains(&Op::Resize(rotated)));
}

#[test]
fn expressions_feed_stress() {
    let expressions: Expressions = [("sad", 0.25)].into_iter().collect();
    let face = FaceAnalysis {
        bbox: BoundingBox::default(),
        score: 1.0,
        age: 18.4,
        gender: None,
        expressions,
    };
    assert_eq!(
        ResultPublisher::default().project(Some(&face)),
        AgeReading {
            age: Some(18),
            stress_percent: Some(25)
        }
    );
}
