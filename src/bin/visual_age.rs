use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use bio_age_vision::{
    build_zenoh_config, setup_tracing, CameraConstraints, DetectionPipeline, DisplayGeometry,
    DnnBackend, ErrorWrapper, ExpressionStress, Frame, MatCanvas, ModelService, OpenCvCamera,
    PipelineConfig, ResultPublisher, READINGS_KEY, SNAPSHOT_KEY,
};
use clap::Parser;
use opencv::core::Mat;
use opencv::highgui;
use tracing::{error, info, warn};
use zenoh::prelude::r#async::*;

#[derive(Parser, Debug)]
#[command()]
struct Args {
    /// Directory with the model manifests and weight shards.
    #[clap(long, default_value = "models")]
    models: PathBuf,

    /// Camera index or /dev/videoN path.
    #[clap(long, default_value = "0")]
    camera: String,

    #[clap(long, default_value_t = 640)]
    width: u32,

    #[clap(long, default_value_t = 480)]
    height: u32,

    /// Milliseconds between detection ticks.
    #[clap(long, default_value_t = 100)]
    interval_ms: u64,

    /// Expression whose probability is reported as stress.
    #[clap(long, default_value = "sad")]
    stress_expression: String,

    /// Run without the preview window.
    #[clap(long)]
    headless: bool,

    /// Where snapshots taken with `c` are written.
    #[clap(long, default_value = ".")]
    snapshot_dir: PathBuf,

    /// Endpoints to connect to.
    #[clap(short = 'e', long)]
    connect: Vec<zenoh_config::EndPoint>,

    /// Endpoints to listen on.
    #[clap(long)]
    listen: Vec<zenoh_config::EndPoint>,
}

const WINDOW: &str = "visual age";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let args: Args = Args::parse();

    let zenoh_session = zenoh::open(build_zenoh_config(&args.listen, &args.connect))
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let zenoh_session = zenoh_session.into_arc();

    let reading_publisher = zenoh_session
        .declare_publisher(READINGS_KEY)
        .congestion_control(CongestionControl::Drop)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let snapshot_publisher = zenoh_session
        .declare_publisher(SNAPSHOT_KEY)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;

    let config = PipelineConfig {
        tick_interval: Duration::from_millis(args.interval_ms.max(1)),
        camera: CameraConstraints {
            device: args.camera.clone(),
            width: Some(args.width),
            height: Some(args.height),
            ..Default::default()
        },
        ..Default::default()
    };
    let models = Arc::new(ModelService::new(DnnBackend, &args.models));
    let canvas = MatCanvas::new(DisplayGeometry::new(args.width, args.height))?;
    let publisher = ResultPublisher::new(ExpressionStress::new(&args.stress_expression));
    let mut pipeline = DetectionPipeline::new(config, models, OpenCvCamera, canvas, publisher);

    if let Err(err) = pipeline.start().await {
        error!("Unable to start visual age analysis: {}", err);
        return Err(err.into());
    }

    if !args.headless {
        highgui::named_window_def(WINDOW)?;
    }

    let mut readings = pipeline.subscribe_readings();
    let frames = pipeline.subscribe_frames();
    let mut state = pipeline.subscribe_state();
    let mut refresh = tokio::time::interval(Duration::from_millis(33));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut snapshots = 0;

    loop {
        tokio::select! {
            _ = &mut ctrl_c => break,
            changed = readings.changed() => {
                changed?;
                let reading = *readings.borrow_and_update();
                match (reading.age, reading.stress_percent) {
                    (Some(age), Some(stress)) => {
                        info!("Estimated age: {} Stress level: {}%", age, stress)
                    }
                    (Some(age), None) => info!("Estimated age: {}", age),
                    _ => info!("No face in view"),
                }
                reading_publisher
                    .put(serde_json::to_vec(&reading)?)
                    .res()
                    .await
                    .map_err(ErrorWrapper::ZenohError)?;
            }
            changed = state.changed() => {
                changed?;
                let current = *state.borrow_and_update();
                if current.is_failed() {
                    error!("Visual age analysis failed ({:?})", current);
                    break;
                }
            }
            _ = refresh.tick(), if !args.headless => {
                let preview = match compose_preview(&pipeline, &frames) {
                    Ok(Some(preview)) => preview,
                    Ok(None) => {
                        _ = highgui::poll_key()?;
                        continue;
                    }
                    Err(err) => {
                        warn!("Skipping preview frame: {:#}", err);
                        _ = highgui::poll_key()?;
                        continue;
                    }
                };
                highgui::imshow(WINDOW, &preview)?;
                match highgui::poll_key()? {
                    key if key == 'q' as i32 || key == 27 => break,
                    key if key == 'c' as i32 => {
                        snapshots += 1;
                        let data = encode_jpeg(&preview)?;
                        let path = args.snapshot_dir.join(format!("snapshot-{snapshots:03}.jpg"));
                        tokio::fs::write(&path, &data).await?;
                        info!("Saved snapshot {}", path.display());
                        snapshot_publisher
                            .put(data)
                            .res()
                            .await
                            .map_err(ErrorWrapper::ZenohError)?;
                    }
                    _ => {}
                }
            }
        }
    }

    pipeline.stop();
    info!("Camera released");
    Ok(())
}

type Pipeline = DetectionPipeline<DnnBackend, OpenCvCamera, MatCanvas>;

fn compose_preview(
    pipeline: &Pipeline,
    frames: &tokio::sync::watch::Receiver<Option<Arc<Frame>>>,
) -> anyhow::Result<Option<Mat>> {
    let Some(frame) = frames.borrow().clone() else {
        return Ok(None);
    };
    pipeline.with_surface(|canvas| canvas.preview(&frame))
}

fn encode_jpeg(image: &Mat) -> anyhow::Result<Vec<u8>> {
    let mut buffer: opencv::core::Vector<u8> = Default::default();
    opencv::imgcodecs::imencode_def(".jpg", image, &mut buffer)?;
    Ok(buffer.to_vec())
}
