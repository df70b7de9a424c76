//! Endpoint state shared between the controlling side and an endpoint's lanes

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::audio::device::DeviceHandle;
use crate::audio::playback::RenderSink;
use crate::config::JitterConfig;
use crate::error::EndpointError;
use crate::sync::jitter::{JitterBuffer, JitterStats};

/// Caller-chosen endpoint identifier
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(String);

impl EndpointId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EndpointId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Calibration status of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CalibrationStatus {
    Uncalibrated,
    Calibrating,
    Calibrated,
    Failed,
}

/// What an endpoint plays to
pub enum EndpointTarget {
    /// A receiver process elsewhere on the network
    Remote(SocketAddr),
    /// A device on this machine, driven by its own lanes
    Local {
        device: DeviceHandle,
        render: Box<dyn RenderSink>,
    },
}

impl fmt::Debug for EndpointTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointTarget::Remote(addr) => f.debug_tuple("Remote").field(addr).finish(),
            EndpointTarget::Local { device, render } => f
                .debug_struct("Local")
                .field("device", device)
                .field("render", &render.name())
                .finish(),
        }
    }
}

/// Where an endpoint lives, without its render collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointAddress {
    Remote(SocketAddr),
    Local(DeviceHandle),
}

impl fmt::Display for EndpointAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EndpointAddress::Remote(addr) => write!(f, "udp://{}", addr),
            EndpointAddress::Local(device) => write!(f, "device://{}", device),
        }
    }
}

/// Live counters, written by the lanes and read by snapshots
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub packets_received: AtomicU64,
    pub frames_rendered: AtomicU64,
    pub probes_rendered: AtomicU64,
    pub drift_recoveries: AtomicU64,
    pub render_errors: AtomicU64,
    pub timeouts: AtomicU64,
    pub control_messages: AtomicU64,
    /// Malformed, foreign-protocol or unsupported-version datagrams
    pub invalid_datagrams: Arc<AtomicU64>,
    pub drift_ns: AtomicI64,
    pub correction_ns: AtomicI64,
    pub stale: AtomicBool,
}

/// Per-endpoint state
pub struct EndpointState {
    id: EndpointId,
    address: EndpointAddress,
    /// Where the send lane delivers this endpoint's packets
    destination: SocketAddr,
    added_at: DateTime<Utc>,
    volume_bits: AtomicU32,
    /// Manual offset; positive plays later
    delay_ns: AtomicI64,
    /// Output latency measured by the last successful calibration
    latency_ns: AtomicI64,
    /// Added by the session so this endpoint lines up with the slowest one
    alignment_ns: AtomicI64,
    calibration: Mutex<CalibrationStatus>,
    /// Bumped whenever the followed stream changes
    stream_epoch: AtomicU64,
    pub(crate) jitter: Mutex<JitterBuffer>,
    pub metrics: EndpointMetrics,
}

impl EndpointState {
    pub fn new(
        id: EndpointId,
        address: EndpointAddress,
        destination: SocketAddr,
        jitter: &JitterConfig,
    ) -> Self {
        Self {
            id,
            address,
            destination,
            added_at: Utc::now(),
            volume_bits: AtomicU32::new(1.0f32.to_bits()),
            delay_ns: AtomicI64::new(0),
            latency_ns: AtomicI64::new(0),
            alignment_ns: AtomicI64::new(0),
            calibration: Mutex::new(CalibrationStatus::Uncalibrated),
            stream_epoch: AtomicU64::new(0),
            jitter: Mutex::new(JitterBuffer::new(jitter)),
            metrics: EndpointMetrics::default(),
        }
    }

    pub fn id(&self) -> &EndpointId {
        &self.id
    }

    pub fn address(&self) -> &EndpointAddress {
        &self.address
    }

    pub fn destination(&self) -> SocketAddr {
        self.destination
    }

    pub fn is_remote(&self) -> bool {
        matches!(self.address, EndpointAddress::Remote(_))
    }

    pub fn added_at(&self) -> DateTime<Utc> {
        self.added_at
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.volume_bits.load(Ordering::Relaxed))
    }

    pub fn set_volume(&self, volume: f32) -> Result<(), EndpointError> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(EndpointError::InvalidVolume(volume));
        }
        self.volume_bits.store(volume.to_bits(), Ordering::Relaxed);
        Ok(())
    }

    /// Manual delay in nanoseconds; negative plays early
    pub fn delay_ns(&self) -> i64 {
        self.delay_ns.load(Ordering::Relaxed)
    }

    /// Set the manual delay. Values beyond `±limit_ns` are rejected.
    pub fn set_delay_ns(&self, delay_ns: i64, limit_ns: i64) -> Result<(), EndpointError> {
        if delay_ns.unsigned_abs() > limit_ns.unsigned_abs() {
            return Err(EndpointError::InvalidDelay {
                delay_ms: delay_ns as f64 / 1e6,
                limit_ms: limit_ns.unsigned_abs() / 1_000_000,
            });
        }
        self.delay_ns.store(delay_ns, Ordering::Relaxed);
        Ok(())
    }

    /// Calibrated output latency, zero until calibrated
    pub fn latency_ns(&self) -> i64 {
        self.latency_ns.load(Ordering::Relaxed)
    }

    pub fn set_latency_ns(&self, latency_ns: i64) {
        self.latency_ns.store(latency_ns, Ordering::Relaxed);
    }

    pub fn alignment_ns(&self) -> i64 {
        self.alignment_ns.load(Ordering::Relaxed)
    }

    pub fn set_alignment_ns(&self, alignment_ns: i64) {
        self.alignment_ns.store(alignment_ns, Ordering::Relaxed);
    }

    /// What the playout clock adds to the nominal delay
    pub fn compensation_ns(&self) -> i64 {
        self.delay_ns().saturating_add(self.alignment_ns())
    }

    pub fn calibration_status(&self) -> CalibrationStatus {
        *self.calibration.lock()
    }

    pub fn set_calibration_status(&self, status: CalibrationStatus) {
        *self.calibration.lock() = status;
    }

    pub fn stream_epoch(&self) -> u64 {
        self.stream_epoch.load(Ordering::Acquire)
    }

    /// Follow a new stream: clears buffered audio and tells the playout lane
    /// to relearn its clock
    pub fn follow_stream(&self, stream_id: Option<u16>) {
        self.jitter.lock().reset(stream_id);
        self.stream_epoch.fetch_add(1, Ordering::AcqRel);
    }

    pub fn jitter_stats(&self) -> JitterStats {
        self.jitter.lock().stats()
    }

    pub fn is_stale(&self) -> bool {
        self.metrics.stale.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> EndpointSnapshot {
        let m = &self.metrics;
        let jitter = self.jitter_stats();
        EndpointSnapshot {
            id: self.id.clone(),
            address: self.address.to_string(),
            remote: self.is_remote(),
            added_at: self.added_at,
            volume: self.volume(),
            delay_ms: self.delay_ns() as f64 / 1e6,
            latency_ms: (self.calibration_status() == CalibrationStatus::Calibrated
                || self.latency_ns() != 0)
                .then(|| self.latency_ns() as f64 / 1e6),
            compensation_ms: self.compensation_ns() as f64 / 1e6,
            calibration: self.calibration_status(),
            stale: self.is_stale(),
            dropouts: jitter.dropouts,
            late_drops: jitter.late_drops,
            lost_packets: jitter.lost_packets,
            overruns: jitter.overruns,
            buffered: jitter.buffered,
            drift_ms: m.drift_ns.load(Ordering::Relaxed) as f64 / 1e6,
            correction_ms: m.correction_ns.load(Ordering::Relaxed) as f64 / 1e6,
            drift_recoveries: m.drift_recoveries.load(Ordering::Relaxed),
            packets_received: m.packets_received.load(Ordering::Relaxed),
            frames_rendered: m.frames_rendered.load(Ordering::Relaxed),
            render_errors: m.render_errors.load(Ordering::Relaxed),
            timeouts: m.timeouts.load(Ordering::Relaxed),
            invalid_datagrams: m.invalid_datagrams.load(Ordering::Relaxed),
            jitter,
        }
    }
}

/// Point-in-time view of one endpoint
#[derive(Debug, Clone, Serialize)]
pub struct EndpointSnapshot {
    pub id: EndpointId,
    pub address: String,
    pub remote: bool,
    pub added_at: DateTime<Utc>,
    pub volume: f32,
    pub delay_ms: f64,
    /// Output latency from calibration, once measured
    pub latency_ms: Option<f64>,
    /// Manual delay plus session alignment
    pub compensation_ms: f64,
    pub calibration: CalibrationStatus,
    pub stale: bool,
    pub dropouts: u64,
    pub late_drops: u64,
    pub lost_packets: u64,
    pub overruns: u64,
    pub buffered: usize,
    pub drift_ms: f64,
    pub correction_ms: f64,
    pub drift_recoveries: u64,
    pub packets_received: u64,
    pub frames_rendered: u64,
    pub render_errors: u64,
    pub timeouts: u64,
    pub invalid_datagrams: u64,
    pub jitter: JitterStats,
}
