//! lscreensaver - idle screen blanker for Wayland and X11.
//!
//! Blanks all outputs after a period without input, or immediately in lock
//! mode, reading input straight from evdev.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use lscreensaver::config::Config;
use lscreensaver::driver::{self, DaemonMode, LockMode, Mode, ModeDriver};
use lscreensaver::exemption::ProcScanner;
use lscreensaver::input::EvdevSource;
use lscreensaver::input::evdev::DEFAULT_INPUT_DIR;
use lscreensaver::surface::{DisplayBackend, DryRunSurfaces, SurfaceManager};

/// Idle screen blanker.
///
/// Covers every output with a black surface after a period of inactivity.
#[derive(Parser, Debug)]
#[command(name = "lscreensaver")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Blank now and exit on the first input after the grace period.
    #[arg(short, long)]
    lock: bool,

    /// Path to config file (daemon mode only).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Display backend for the blank surfaces.
    #[arg(long, value_enum, default_value_t = DisplayBackend::Auto)]
    backend: DisplayBackend,

    /// Enable dry-run mode (log instead of blanking).
    #[arg(long)]
    dry_run: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory scanned for evdev event nodes.
    #[arg(long, default_value = DEFAULT_INPUT_DIR)]
    input_dir: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!(
        "lscreensaver v{} starting ({} mode)",
        env!("CARGO_PKG_VERSION"),
        if args.lock { "lock" } else { "daemon" }
    );

    let input = EvdevSource::open(&args.input_dir).context("Failed to open input devices")?;
    info!("Watching {} input devices", input.device_count());

    let surfaces = connect_surfaces(args.backend, args.dry_run)?;
    let mut driver = ModeDriver::new(input, surfaces);

    if args.lock {
        run(&mut driver, &mut LockMode::new()).await
    } else {
        let config = Config::load_or_default(args.config.as_deref())
            .context("Failed to load configuration")?;
        config.log_summary();

        let mut mode = DaemonMode::new(&config, ProcScanner::new(), driver::now());
        run(&mut driver, &mut mode).await
    }
}

/// Initialize logging with the specified level.
fn init_logging(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(format!("lscreensaver={level}"))
        .or_else(|_| EnvFilter::try_new("info"))
        .context("Invalid log level")?;

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    Ok(())
}

fn connect_surfaces(backend: DisplayBackend, dry_run: bool) -> Result<Box<dyn SurfaceManager>> {
    if dry_run {
        info!("Dry-run mode, no surfaces will be created");
        return Ok(Box::new(DryRunSurfaces::new()));
    }

    let server = backend.resolve().context("Failed to pick a display backend")?;
    info!("Using {} backend", server.as_str());
    server.connect().map_err(|e| {
        error!("Display backend unavailable: {}", e);
        anyhow::Error::from(e).context(format!("Failed to connect to {}", server.as_str()))
    })
}

/// Drive `mode` until it finishes or a termination signal arrives.
async fn run<M: Mode>(
    driver: &mut ModeDriver<EvdevSource, Box<dyn SurfaceManager>>,
    mode: &mut M,
) -> Result<()> {
    let result = tokio::select! {
        result = driver.run(mode) => result.context("Input source failed"),
        signal = shutdown_signal() => signal.map(|name| info!("Received {}, shutting down", name)),
    };

    driver.shutdown();
    result
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() -> Result<&'static str> {
    let mut sigterm =
        signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            result.context("Failed to listen for SIGINT")?;
            Ok("SIGINT")
        }
        _ = sigterm.recv() => Ok("SIGTERM"),
    }
}
