//! detection_relay - session-aware object detection relay
//!
//! This daemon:
//! 1. Loads configuration (file named by RELAY_CONFIG, env, then flags)
//! 2. Builds and warms up the detector; failure here exits before serving
//! 3. Serves the socket channel and the REST listener
//! 4. Stops cleanly on Ctrl-C

use std::path::PathBuf;
use std::sync::mpsc;

use anyhow::{Context, Result};
use clap::Parser;

use detection_relay::config::BackendKind;
use detection_relay::detect::build_detector;
use detection_relay::{RelayConfig, RelayServer};

#[derive(Parser, Debug)]
#[command(author, version, about = "Session-aware object detection relay")]
struct Args {
    /// Config file (.toml or JSON). Overrides RELAY_CONFIG.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Socket channel listen address.
    #[arg(long)]
    socket_addr: Option<String>,

    /// REST listen address.
    #[arg(long)]
    http_addr: Option<String>,

    /// Detector backend: 'stub' or 'tract'.
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Path to the ONNX model file.
    #[arg(long)]
    model: Option<String>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => RelayConfig::load_from(Some(path.as_path()))?,
        None => RelayConfig::load()?,
    };
    if let Some(addr) = args.socket_addr {
        config.socket_addr = addr;
    }
    if let Some(addr) = args.http_addr {
        config.http_addr = addr;
    }
    if let Some(backend) = args.backend {
        config.model.backend = backend;
    }
    if let Some(model) = args.model {
        config.model.path = model;
    }
    config.validate()?;

    log::info!(
        "detector config: backend={}, model={} ({}), target={}x{}, conf={}, queue_capacity={}",
        config.model.backend.as_str(),
        config.model.name,
        config.model.path,
        config.detector.target_width,
        config.detector.target_height,
        config.detector.conf_threshold,
        config.queue.capacity
    );

    let detector = build_detector(&config).context("detector failed to initialize")?;
    log::info!("detector '{}' ready", detector.name());

    let handle = RelayServer::new(config, detector).spawn()?;
    log::info!("socket channel listening on {}", handle.socket_addr);
    log::info!("rest api listening on {}", handle.http_addr);

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .expect("error setting Ctrl-C handler");

    log::info!("detection_relay waiting for shutdown signal (Ctrl-C)...");
    let _ = rx.recv();
    log::info!("shutdown signal received, stopping relay...");
    handle.stop()?;

    Ok(())
}
