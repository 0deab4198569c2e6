//! SafeView Viewer
//!
//! Connects to a robot's scan stream and renders the laser scan over the
//! robot footprint. Headless by default; `--rerun` (feature
//! `visualization`) streams the scene to a Rerun viewer.

use anyhow::{Context, Result};
use clap::Parser;
use safeview_core::config::load_json_file;
use safeview_core::{
    ConfigSource, FixedSurface, FootprintResponse, HeadlessBackend, RenderBackend, TransformResponse,
    VisualizerConfig, VisualizerController,
};
use safeview_env::{TokioContext, WebSocketTransport};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "safeview-viewer")]
#[command(about = "Live laser-scan safety view for a robot", long_about = None)]
struct Args {
    /// Stream endpoint (overrides the config file)
    #[arg(short, long)]
    url: Option<String>,

    /// Footprint JSON as served by the configuration service
    #[arg(long)]
    footprint: Option<PathBuf>,

    /// Laser→base transform JSON as served by the configuration service
    #[arg(long)]
    transform: Option<PathBuf>,

    /// Visualizer configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Seconds between reconnect attempts (overrides the config file)
    #[arg(long)]
    reconnect_secs: Option<u64>,

    /// Surface width in pixels
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Surface height in pixels
    #[arg(long, default_value = "720")]
    height: u32,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Stream the scene to a Rerun viewer (requires the `visualization` feature)
    #[arg(long)]
    rerun: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    info!("SafeView Viewer v{}", env!("CARGO_PKG_VERSION"));

    let config = build_config(&args)?;
    let source = ConfigSource {
        footprint: load_optional::<FootprintResponse>(args.footprint.as_deref()),
        transform: load_optional::<TransformResponse>(args.transform.as_deref()),
        texture: None,
    };

    if args.rerun {
        #[cfg(feature = "visualization")]
        {
            let backend = safeview_core::RerunBackend::spawn("safeview")
                .context("failed to spawn Rerun viewer")?;
            return run_viewer(backend, config, source, &args).await;
        }

        #[cfg(not(feature = "visualization"))]
        {
            anyhow::bail!("--rerun requires the `visualization` feature (cargo build --features visualization)");
        }
    }

    run_viewer(HeadlessBackend::new(), config, source, &args).await
}

fn build_config(args: &Args) -> Result<VisualizerConfig> {
    let mut config = match &args.config {
        Some(path) => load_json_file::<VisualizerConfig>(path)
            .with_context(|| format!("loading visualizer config from {}", path.display()))?,
        None => VisualizerConfig::default(),
    };
    if let Some(url) = &args.url {
        config = config.with_stream_url(url);
    }
    if let Some(secs) = args.reconnect_secs {
        config = config.with_reconnect_delay(Duration::from_secs(secs));
    }
    config.validate().context("invalid visualizer config")?;
    Ok(config)
}

/// Missing or unreadable configuration-service files fall back to defaults.
fn load_optional<T: serde::de::DeserializeOwned>(path: Option<&Path>) -> Option<T> {
    let path = path?;
    match load_json_file(path) {
        Ok(value) => Some(value),
        Err(e) => {
            warn!("{e}; continuing without it");
            None
        }
    }
}

async fn run_viewer<B: RenderBackend>(
    backend: B,
    config: VisualizerConfig,
    source: ConfigSource,
    args: &Args,
) -> Result<()> {
    info!(url = %config.stream_url, reconnect = ?config.reconnect_delay(), "starting viewer");

    let mut controller = VisualizerController::new(backend, config);
    controller
        .mount(source, Box::new(FixedSurface::new(args.width, args.height)))
        .context("failed to mount visualizer")?;
    // FixedSurface never changes size, so no resize channel is attached
    controller.connect(TokioContext::shared(), Arc::new(WebSocketTransport::default()));

    let handle = controller.handle();
    let mut brake = handle.subscribe_brake();
    let brake_log = tokio::spawn(async move {
        while brake.changed().await.is_ok() {
            match *brake.borrow_and_update() {
                Some(true) => warn!("BRAKE ENGAGED"),
                Some(false) => info!("brake released"),
                None => {}
            }
        }
    });

    let shutdown = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Ctrl-C received, shutting down");
            shutdown.shutdown();
        }
    });

    controller.run().await;

    let stats = controller.stats();
    let status = controller.connection_status();
    controller.unmount();
    brake_log.abort();

    let summary = serde_json::json!({
        "scans": stats.scans,
        "simulated_scans": stats.simulated_scans,
        "beams_dropped": stats.beams_dropped,
        "brake_updates": stats.brake_updates,
        "frames_drawn": stats.frames_drawn,
        "connect_attempts": status.map(|s| s.attempts),
    });
    info!("session summary: {summary}");
    Ok(())
}
