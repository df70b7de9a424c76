//! Network endpoint
//!
//! Receives a SyncWave stream, buffers it and plays it on a local device at
//! the sender-agreed instant. Volume and delay follow the sender's control
//! messages.

use anyhow::Result;
use clap::Parser;
use crossbeam_channel::bounded;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncwave::{
    audio::{
        device::{list_devices, DeviceHandle},
        playback::CpalRender,
    },
    config::AppConfig,
    endpoints::{EndpointAddress, EndpointId, EndpointLanes, EndpointState, LaneContext},
    network::receiver::UdpReceiver,
    SessionClock,
};

#[derive(Parser)]
#[command(name = "receiver")]
#[command(author, version, about = "Play a SyncWave stream on a local device", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Output device (default output if not specified)
    #[arg(long, value_name = "DEVICE_ID")]
    device: Option<String>,

    /// Address to listen on (default from configuration)
    #[arg(long, value_name = "ADDR:PORT")]
    bind: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting SyncWave receiver");

    let args = Args::parse();
    let config = AppConfig::load_or_default(args.config.as_deref())?;
    config.validate()?;

    // List available output devices
    println!("\n=== Available Output Devices ===");
    for device in list_devices() {
        if device.is_output {
            let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
            println!("  {}{}:", device.name, default_marker);
            println!("    ID: {}", device.id);
            println!("    Sample rates: {:?}", device.sample_rates);
            println!("    Channels: {:?}", device.channels);
        }
    }
    println!();

    let device = args
        .device
        .map(DeviceHandle::new)
        .unwrap_or_else(DeviceHandle::default_output);
    let bind = args.bind.unwrap_or_else(|| config.network.bind_addr());

    let (shutdown_tx, shutdown_rx) = bounded(1);
    let receiver = UdpReceiver::bind(bind, &config.network, shutdown_rx.clone())?;
    let local = receiver.local_addr()?;

    let state = Arc::new(EndpointState::new(
        EndpointId::new(local.to_string()),
        EndpointAddress::Local(device.clone()),
        local,
        &config.jitter,
    ));
    let ctx = LaneContext {
        clock: SessionClock::new(),
        playout: config.playout.clone(),
        shared_epoch: false,
        accept_control: true,
        observations: None,
    };
    let mut lanes = EndpointLanes::spawn(
        state.clone(),
        receiver,
        shutdown_tx,
        shutdown_rx,
        Box::new(CpalRender::new()),
        device.clone(),
        ctx,
    )?;

    tracing::info!("Listening on {}, playing to {}", local, device);
    tracing::info!("Waiting for a stream - press Ctrl+C to stop");

    let mut stats = tokio::time::interval(Duration::from_secs(5));
    stats.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = stats.tick() => {
                let snapshot = state.snapshot();
                tracing::info!(
                    "{} packets, {} frames played, {} dropouts, {} late, {} buffered, drift {:.2} ms, delay {:.1} ms{}",
                    snapshot.packets_received,
                    snapshot.frames_rendered,
                    snapshot.dropouts,
                    snapshot.late_drops,
                    snapshot.buffered,
                    snapshot.drift_ms,
                    snapshot.delay_ms,
                    if snapshot.stale { ", stale" } else { "" },
                );
                tracing::debug!("{}", serde_json::to_string(&snapshot)?);
            }
        }
    }

    tokio::task::spawn_blocking(move || lanes.stop()).await?;
    println!("{}", serde_json::to_string_pretty(&state.snapshot())?);
    Ok(())
}
