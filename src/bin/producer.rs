//! Producer endpoint: serves the camera stream and drives the gimbal

use anyhow::{Context, Result};
use clap::Parser;
use gimbalcam::config::Config;
use gimbalcam::device::synthetic::{LoggingGimbal, PassthroughCodec, SyntheticCameraSource};
use gimbalcam::device::CameraSource;
use gimbalcam::session::ProducerSupervisor;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gimbalcam-producer")]
#[command(about = "Streams camera frames over UDP and applies gimbal set-points")]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    fmt().with_env_filter(filter).with_target(false).init();

    info!(config_path = %cli.config, "producer starting");
    let config = Config::load_or_default(&cli.config)?;
    info!(
        control = %config.control_addr()?,
        data = %config.data_addr()?,
        geometry = %format!("{}x{}@{}", config.width, config.height, config.fps),
        "configuration loaded"
    );

    let camera_source: Arc<dyn CameraSource> = Arc::new(SyntheticCameraSource);

    // fail fast when no camera can be opened at all
    let mut probe = camera_source
        .open(config.width, config.height, config.fps)
        .await
        .context("camera initialization failed")?;
    probe.close().await;
    info!("camera probe passed");

    let supervisor = ProducerSupervisor::new(
        config,
        camera_source,
        Box::new(LoggingGimbal::default()),
        Arc::new(PassthroughCodec),
    );

    let shutdown = CancellationToken::new();
    let supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    supervisor_task.await??;

    Ok(())
}
