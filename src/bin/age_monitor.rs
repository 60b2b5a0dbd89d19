use bio_age_vision::{
    build_zenoh_config, jpeg_to_mat, setup_tracing, AgeReading, ErrorWrapper, READINGS_KEY,
    SNAPSHOT_KEY,
};
use clap::Parser;
use opencv::highgui;
use tracing::{info, warn};
use zenoh::prelude::r#async::*;

#[derive(Parser, Debug)]
#[command()]
struct Args {
    /// Show published snapshots in a window.
    #[clap(long)]
    snapshots: bool,

    /// Endpoints to connect to.
    #[clap(short = 'e', long)]
    connect: Vec<zenoh_config::EndPoint>,

    /// Endpoints to listen on.
    #[clap(long)]
    listen: Vec<zenoh_config::EndPoint>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    setup_tracing();
    let args: Args = Args::parse();

    let window = "visual age snapshot";
    if args.snapshots {
        highgui::named_window_def(window)?;
    }

    let zenoh_session = zenoh::open(build_zenoh_config(&args.listen, &args.connect))
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let zenoh_session = zenoh_session.into_arc();

    let readings = zenoh_session
        .declare_subscriber(READINGS_KEY)
        .best_effort()
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;
    let snapshots = zenoh_session
        .declare_subscriber(SNAPSHOT_KEY)
        .res()
        .await
        .map_err(ErrorWrapper::ZenohError)?;

    loop {
        tokio::select! {
            msg = readings.recv_async() => {
                let payload: Vec<u8> = msg?.value.try_into()?;
                match serde_json::from_slice::<AgeReading>(&payload) {
                    Ok(AgeReading { age: Some(age), stress_percent }) => {
                        info!(age, stress_percent = ?stress_percent, "reading");
                    }
                    Ok(_) => info!("no face in view"),
                    Err(err) => warn!("malformed reading: {}", err),
                }
            }
            msg = snapshots.recv_async() => {
                let payload: Vec<u8> = msg?.value.try_into()?;
                info!(bytes = payload.len(), "snapshot received");
                if args.snapshots {
                    let frame = jpeg_to_mat(&payload)?;
                    highgui::imshow(window, &frame)?;
                    _ = highgui::poll_key()?;
                }
            }
        }
    }
}
