//! Consumer endpoint: renders the stream and publishes pointer intent

use anyhow::Result;
use clap::Parser;
use gimbalcam::config::Config;
use gimbalcam::device::synthetic::{NullSurface, PassthroughCodec};
use gimbalcam::session::ConsumerSupervisor;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "gimbalcam-consumer")]
#[command(about = "Receives the camera stream and steers the gimbal by pointer")]
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

    info!(config_path = %cli.config, "consumer starting");
    let config = Config::load_or_default(&cli.config)?;
    info!(
        control = %config.control_addr()?,
        data = %config.data_addr()?,
        geometry = %format!("{}x{}", config.width, config.height),
        "configuration loaded"
    );

    let supervisor = ConsumerSupervisor::new(
        config,
        Arc::new(PassthroughCodec),
        Arc::new(Mutex::new(NullSurface::default())),
    );

    let shutdown = CancellationToken::new();
    let mut supervisor_task = tokio::spawn(supervisor.run(shutdown.clone()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
            shutdown.cancel();
            (&mut supervisor_task).await??;
        }
        // the supervisor returns on its own when the user quits
        finished = &mut supervisor_task => {
            finished??;
        }
    }

    Ok(())
}
