//! Application configuration
//!
//! Loaded from `config.toml` in the platform config directory, falling back
//! to defaults for any missing section or field.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{Error, Result};

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub network: NetworkConfig,
    pub capture: CaptureConfig,
    pub jitter: JitterConfig,
    pub playout: PlayoutConfig,
    pub calibration: CalibrationConfig,
}

impl AppConfig {
    /// Default config file location (`<config dir>/syncwave/config.toml`)
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("", "", "syncwave")
            .map(|dirs| dirs.config_dir().join("config.toml"))
    }

    /// Load and validate a config file
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        let config: AppConfig = toml::from_str(&text)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path`, or the default location, or fall back to defaults
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path() {
                Some(p) => p,
                None => return Ok(Self::default()),
            },
        };

        if path.exists() {
            tracing::info!("Loading configuration from {}", path.display());
            Self::load(&path)
        } else {
            tracing::debug!("No config at {}, using defaults", path.display());
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, text)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.network.max_payload == 0 || self.network.max_payload > MAX_PACKET_SIZE - 24 {
            return Err(Error::Config(format!(
                "network.max_payload must be in 1..={}",
                MAX_PACKET_SIZE - 24
            )));
        }
        if self.capture.frame_duration_ms == 0 {
            return Err(Error::Config("capture.frame_duration_ms must be > 0".into()));
        }
        if self.jitter.target_depth == 0 || self.jitter.max_depth < self.jitter.target_depth {
            return Err(Error::Config(
                "jitter.max_depth must be >= jitter.target_depth > 0".into(),
            ));
        }
        if self.calibration.min_quorum == 0
            || self.calibration.min_quorum > self.calibration.probe_count
        {
            return Err(Error::Config(
                "calibration.min_quorum must be in 1..=probe_count".into(),
            ));
        }
        if self.calibration.min_delay_ms > self.calibration.max_delay_ms {
            return Err(Error::Config(
                "calibration.min_delay_ms exceeds max_delay_ms".into(),
            ));
        }
        if self.calibration.max_delay_ms > self.playout.max_delay_ms {
            return Err(Error::Config(
                "calibration.max_delay_ms exceeds playout.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

/// Network configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Port used for streaming and control traffic
    pub port: u16,
    /// Address receivers bind to
    pub bind_address: IpAddr,
    /// Maximum PCM bytes per datagram
    pub max_payload: usize,
    /// Silence after which a receive fails with `Timeout`
    pub liveness_timeout_ms: u64,
    /// Socket read slice, bounds how late a lane notices shutdown
    pub poll_interval_ms: u64,
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    /// Join this multicast group on receivers
    pub multicast_group: Option<Ipv4Addr>,
    pub multicast_ttl: u32,
    /// Allow sending to broadcast addresses
    pub broadcast: bool,
}

impl NetworkConfig {
    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_millis(self.liveness_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_UDP_PORT,
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_payload: MAX_PAYLOAD_SIZE,
            liveness_timeout_ms: 2000,
            poll_interval_ms: 50,
            send_buffer_size: 1 << 20,
            recv_buffer_size: 1 << 20,
            multicast_group: None,
            multicast_ttl: 1,
            broadcast: true,
        }
    }
}

/// Capture configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    /// Duration of one captured frame
    pub frame_duration_ms: u32,
    /// Device id as listed by `audio::device::list_devices` (default device if unset)
    pub device: Option<String>,
    /// Capture what an output device is playing instead of an input
    pub loopback: bool,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
}

impl CaptureConfig {
    pub fn frame_duration(&self) -> Duration {
        Duration::from_millis(self.frame_duration_ms as u64)
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            frame_duration_ms: DEFAULT_FRAME_SIZE_MS,
            device: None,
            loopback: false,
            sample_rate: None,
            channels: None,
        }
    }
}

/// Jitter buffer configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JitterConfig {
    /// Depth in packets; one depth worth of time is the gap grace period
    pub target_depth: usize,
    /// Hard bound; beyond it the oldest packet is evicted
    pub max_depth: usize,
    /// Empty-buffer silence after which the cursor resynchronizes
    pub watchdog_ms: u64,
}

impl JitterConfig {
    pub fn watchdog(&self) -> Duration {
        Duration::from_millis(self.watchdog_ms)
    }
}

impl Default for JitterConfig {
    fn default() -> Self {
        Self {
            target_depth: 10,
            max_depth: RING_BUFFER_CAPACITY,
            watchdog_ms: 500,
        }
    }
}

/// Playout clock configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PlayoutConfig {
    /// Fixed delay added to every send timestamp, chosen to dominate jitter
    pub nominal_delay_ms: u64,
    /// Drift beyond which the corrector starts slewing
    pub drift_threshold_us: u64,
    /// Maximum correction applied per second of wall time
    pub slew_us_per_sec: u64,
    /// Sleep used when nothing is buffered
    pub idle_poll_ms: u64,
    /// Largest delay compensation magnitude, either direction
    pub max_delay_ms: u64,
}

impl PlayoutConfig {
    pub fn nominal_delay(&self) -> Duration {
        Duration::from_millis(self.nominal_delay_ms)
    }

    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn max_delay_ns(&self) -> i64 {
        (self.max_delay_ms as i64).saturating_mul(1_000_000)
    }
}

impl Default for PlayoutConfig {
    fn default() -> Self {
        Self {
            nominal_delay_ms: DEFAULT_NOMINAL_DELAY_MS,
            drift_threshold_us: 2000,
            slew_us_per_sec: 3000,
            idle_poll_ms: 10,
            max_delay_ms: 2000,
        }
    }
}

/// Auto-calibration configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CalibrationConfig {
    pub probe_count: usize,
    /// Minimum samples for an estimate
    pub min_quorum: usize,
    pub probe_timeout_ms: u64,
    pub probe_interval_ms: u64,
    /// Largest accepted max-min spread of measured latencies
    pub max_spread_ms: u64,
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub tone_hz: f32,
    pub tone_amplitude: f32,
}

impl CalibrationConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            probe_count: 5,
            min_quorum: 3,
            probe_timeout_ms: 1500,
            probe_interval_ms: 200,
            max_spread_ms: 500,
            min_delay_ms: 0,
            max_delay_ms: 2000,
            tone_hz: 1000.0,
            tone_amplitude: 0.5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = AppConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.network.port, 5555);
        assert_eq!(config.network.max_payload, 1400);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [network]
            port = 6000

            [playout]
            nominal_delay_ms = 150
            "#,
        )
        .unwrap();

        assert_eq!(config.network.port, 6000);
        assert_eq!(config.network.max_payload, MAX_PAYLOAD_SIZE);
        assert_eq!(config.playout.nominal_delay(), Duration::from_millis(150));
        assert_eq!(config.jitter, JitterConfig::default());
    }

    #[test]
    fn test_validate_rejects_bad_quorum() {
        let mut config = AppConfig::default();
        config.calibration.min_quorum = 10;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_validate_rejects_calibration_beyond_delay_limit() {
        let mut config = AppConfig::default();
        config.playout.max_delay_ms = 500;
        assert!(matches!(config.validate(), Err(Error::Config(_))));
        config.calibration.max_delay_ms = 500;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_save_then_load() {
        let dir = std::env::temp_dir().join(format!("syncwave-config-{}", uuid::Uuid::new_v4()));
        let path = dir.join("config.toml");

        let mut config = AppConfig::default();
        config.capture.loopback = true;
        config.network.multicast_group = Some(Ipv4Addr::new(239, 0, 0, 7));
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded, config);

        let _ = std::fs::remove_dir_all(dir);
    }
}
