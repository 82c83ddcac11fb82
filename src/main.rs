// src/main.rs
//
// Binary entry point: parses the command line, loads configuration and
// runs the bridge until Ctrl-C.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use telebridge::bridge::Bridge;
use telebridge::io::influx::{Forwarder, InfluxWriter};
use telebridge::io::serial::SerialLinkManager;
use telebridge::settings::Settings;

/// Serial-to-InfluxDB telemetry bridge.
#[derive(Parser)]
#[command(name = "telebridge", version, about)]
struct Cli {
    /// Path to the TOML configuration file
    #[arg(short, long, default_value = "telebridge.toml")]
    config: PathBuf,

    /// Serial device to open, overriding the configuration file
    #[arg(short, long)]
    device: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Level is overridden by RUST_LOG.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let mut settings = Settings::load(&cli.config)?;
    if let Some(device) = cli.device {
        settings.serial.device = Some(device);
    }
    settings.validate()?;

    info!("telebridge starting, config {:?}", cli.config);

    // Shutdown flag shared with the link manager.
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_signal = Arc::clone(&shutdown);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("shutdown signal received");
            shutdown_signal.store(true, Ordering::Relaxed);
        }
    });

    let writer = InfluxWriter::new(settings.database.clone())?;
    writer.ping().await;

    let forwarder = Forwarder::start(settings.database.clone(), Arc::new(writer));
    let link = SerialLinkManager::new(settings.serial.clone(), Arc::clone(&shutdown));
    let bridge = Bridge::new(forwarder);

    let flush_timeout = Duration::from_millis(settings.bridge.shutdown_flush_timeout_ms);
    bridge.run(link, flush_timeout).await;

    info!("telebridge stopped");
    Ok(())
}
