//! Broadcast source
//!
//! Captures one device and streams it to every receiver given on the
//! command line, plus any local output devices.

use anyhow::{bail, Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use syncwave::{
    audio::{
        capture::CpalCapture,
        device::{list_devices, DeviceHandle},
        playback::CpalRender,
        source::FrameSource,
    },
    config::AppConfig,
    constants::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE},
    endpoints::{BroadcastSession, CalibrationStatus, EndpointId, EndpointTarget, StaticDiscovery},
    protocol::{SampleFormat, StreamFormat},
    SessionClock,
};

#[derive(Parser)]
#[command(name = "sender")]
#[command(author, version, about = "Broadcast one capture device to many endpoints", long_about = None)]
struct Args {
    /// Configuration file (TOML)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Local output device to play on as well (can be specified multiple times)
    #[arg(long, value_name = "DEVICE_ID")]
    local: Vec<String>,

    /// Calibrate every local device once streaming
    #[arg(long)]
    calibrate: bool,

    /// Receivers, as HOST or HOST:PORT
    #[arg(value_name = "RECEIVER")]
    receivers: Vec<String>,
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

    tracing::info!("Starting SyncWave sender");

    let args = Args::parse();
    let config = AppConfig::load_or_default(args.config.as_deref())?;

    // List available devices
    println!("\n=== Available Audio Devices ===");
    for device in list_devices() {
        let device_type = match (device.is_input, device.is_output) {
            (true, true) => "Input/Output",
            (true, false) => "Input",
            (false, true) => "Output",
            _ => "Unknown",
        };
        let default_marker = if device.is_default { " [DEFAULT]" } else { "" };
        println!("  {} ({}){}:", device.name, device_type, default_marker);
        println!("    ID: {}", device.id);
        println!("    Sample rates: {:?}", device.sample_rates);
        println!("    Channels: {:?}", device.channels);
    }
    println!();

    if args.receivers.is_empty() && args.local.is_empty() {
        bail!("nothing to play to: give at least one receiver address or --local device");
    }

    let capture_device = match &config.capture.device {
        Some(id) => DeviceHandle::new(id.clone()),
        None if config.capture.loopback => DeviceHandle::default_output(),
        None => DeviceHandle::default_input(),
    };
    tracing::info!("Capturing from {}", capture_device);

    let clock = SessionClock::new();
    let mut source = FrameSource::new(
        Box::new(CpalCapture::new(capture_device, config.capture.loopback)),
        clock,
        config.capture.frame_duration(),
    );
    if config.capture.sample_rate.is_some() || config.capture.channels.is_some() {
        source = source.with_requested_format(StreamFormat::new(
            config.capture.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE),
            config.capture.channels.unwrap_or(DEFAULT_CHANNELS),
            SampleFormat::F32,
        ));
    }

    let port = config.network.port;
    let session = Arc::new(BroadcastSession::new(config, clock, source)?);

    let added = session.add_discovered(&StaticDiscovery::resolve(args.receivers.as_slice(), port))?;
    for id in &added {
        tracing::info!("Receiver {}", id);
    }

    let mut locals = Vec::new();
    for (i, device) in args.local.iter().enumerate() {
        let id = EndpointId::new(format!("local-{}", i));
        session.add_endpoint(
            id.clone(),
            EndpointTarget::Local {
                device: DeviceHandle::new(device.clone()),
                render: Box::new(CpalRender::new()),
            },
        )?;
        locals.push(id);
    }

    session.start()?;
    tracing::info!("Streaming - press Ctrl+C to stop");

    if args.calibrate {
        let session = session.clone();
        tokio::task::spawn_blocking(move || {
            for id in locals {
                match session.calibrate(&id) {
                    Ok(delay) => tracing::info!(
                        "{} calibrated, output latency {:.1} ms",
                        id,
                        delay.num_microseconds().unwrap_or_default() as f64 / 1e3
                    ),
                    Err(e) => tracing::warn!("{} not calibrated: {}", id, e),
                }
            }
        });
    }

    let mut stats = tokio::time::interval(Duration::from_secs(10));
    stats.tick().await;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Interrupted");
                break;
            }
            _ = stats.tick() => {
                let snapshot = session.snapshot();
                if !snapshot.running {
                    break;
                }
                for endpoint in &snapshot.endpoints {
                    tracing::info!(
                        "{}: {} frames, {} dropouts, {} late, drift {:.2} ms{}{}",
                        endpoint.id,
                        endpoint.frames_rendered,
                        endpoint.dropouts,
                        endpoint.late_drops,
                        endpoint.drift_ms,
                        if endpoint.stale { ", stale" } else { "" },
                        if endpoint.calibration == CalibrationStatus::Calibrated { ", calibrated" } else { "" },
                    );
                }
                tracing::debug!("{}", serde_json::to_string(&snapshot)?);
            }
        }
    }

    // Endpoints are destroyed by stop, so report first
    println!("{}", serde_json::to_string_pretty(&session.snapshot())?);
    let fatal = session.fatal_error();
    let stopping = session.clone();
    tokio::task::spawn_blocking(move || stopping.stop()).await?;

    match fatal {
        Some(e) => Err(e).context("capture failed"),
        None => Ok(()),
    }
}
