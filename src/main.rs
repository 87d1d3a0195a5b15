//! Pi-cam-session binary: capture stills from a V4L2 camera.

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use pi_cam_session::{
    CaptureMode, CaptureRequest, Coordinator, DirectoryStore, LoggingListener, SessionConfig,
    V4L2Camera,
};

/// How long one capture cycle may take before giving up.
const CAPTURE_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Parser)]
#[command(name = "pi-cam-session", version, about = "Capture stills from a V4L2 camera")]
struct Args {
    /// V4L2 device index (0 for /dev/video0)
    #[arg(short, long)]
    device: Option<u32>,

    /// Capture mode (standard, high-performance, exposure-bracketing, ...)
    #[arg(short, long)]
    mode: Option<CaptureMode>,

    /// Number of shutter presses
    #[arg(short = 'n', long, default_value = "1")]
    shots: u32,

    /// Run a focus sweep before each shot
    #[arg(long)]
    focus: bool,

    /// Config file (defaults to ./pi-cam-session.toml when present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Print the effective configuration and exit
    #[arg(long)]
    print_config: bool,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();
    match run(args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "capture failed");
            ExitCode::FAILURE
        }
    }
}

fn run(args: Args) -> pi_cam_session::Result<()> {
    let mut config = SessionConfig::load_from(args.config.as_deref())?;
    if let Some(device) = args.device {
        config.device_index = device;
    }
    if let Some(output) = args.output {
        config.output_dir = output;
    }

    if args.print_config {
        let rendered = config
            .to_toml()
            .map_err(|err| std::io::Error::other(err.to_string()))?;
        print!("{rendered}");
        return Ok(());
    }

    std::fs::create_dir_all(&config.output_dir)?;
    let camera = V4L2Camera::open(config.device_index)?;
    info!(card = %camera.info().card, driver = %camera.info().driver, "camera ready");

    let store = DirectoryStore::new(&config.output_dir);
    let mut session = Coordinator::new(camera, store, config, Arc::new(LoggingListener))?;

    if let Some(mode) = args.mode {
        session.set_capture_mode(mode)?;
    }
    session.start_preview()?;

    for _ in 0..args.shots {
        if args.focus {
            session.auto_focus()?;
            if !session.wait_until_settled(CAPTURE_TIMEOUT) {
                error!("focus did not complete in time");
                break;
            }
        }
        let sequence = session.begin_capture(CaptureRequest::default())?;
        if !session.wait_until_settled(CAPTURE_TIMEOUT) {
            error!(sequence, "capture did not complete in time");
            break;
        }
    }

    let stats = session.release()?;
    info!(
        saved = stats.saved,
        failed = stats.failed,
        thumbnails = stats.thumbnails,
        "done"
    );
    Ok(())
}
