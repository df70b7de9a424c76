//! Audio device enumeration
//!
//! Device selection is resolved here once and handed to the capture and
//! render collaborators as an explicit [`DeviceHandle`], so nothing in the
//! engine reads global device state.

use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::{CaptureError, RenderError};

/// Identifier of a local audio device (`input:<name>` / `output:<name>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DeviceHandle(pub String);

impl DeviceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Handle meaning "whatever the host reports as default"
    pub fn default_output() -> Self {
        Self("output:default".to_string())
    }

    pub fn default_input() -> Self {
        Self("input:default".to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn split(&self) -> (DeviceKind, &str) {
        if let Some(name) = self.0.strip_prefix("input:") {
            (DeviceKind::Input, name)
        } else if let Some(name) = self.0.strip_prefix("output:") {
            (DeviceKind::Output, name)
        } else {
            (DeviceKind::Output, self.0.as_str())
        }
    }
}

impl fmt::Display for DeviceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeviceKind {
    Input,
    Output,
}

/// Description of a device for listings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDeviceInfo {
    pub id: String,
    pub name: String,
    pub is_input: bool,
    pub is_output: bool,
    pub is_default: bool,
    pub sample_rates: Vec<u32>,
    pub channels: Vec<u16>,
}

/// List all available audio devices
pub fn list_devices() -> Vec<AudioDeviceInfo> {
    let host = cpal::default_host();
    let mut devices = Vec::new();

    let default_input_name = host.default_input_device().and_then(|d| d.name().ok());
    let default_output_name = host.default_output_device().and_then(|d| d.name().ok());

    if let Ok(input_devices) = host.input_devices() {
        for device in input_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device, true);
                devices.push(AudioDeviceInfo {
                    id: format!("input:{}", name),
                    is_default: default_input_name.as_ref() == Some(&name),
                    name,
                    is_input: true,
                    is_output: false,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    // Output devices get their own entry even when an input shares the name:
    // the id prefix decides how the device is opened.
    if let Ok(output_devices) = host.output_devices() {
        for device in output_devices {
            if let Ok(name) = device.name() {
                let (sample_rates, channels) = get_device_capabilities(&device, false);
                devices.push(AudioDeviceInfo {
                    id: format!("output:{}", name),
                    is_default: default_output_name.as_ref() == Some(&name),
                    name,
                    is_input: false,
                    is_output: true,
                    sample_rates,
                    channels,
                });
            }
        }
    }

    devices
}

fn get_device_capabilities(device: &cpal::Device, is_input: bool) -> (Vec<u32>, Vec<u16>) {
    let configs: Vec<cpal::SupportedStreamConfigRange> = if is_input {
        device
            .supported_input_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    } else {
        device
            .supported_output_configs()
            .map(|c| c.collect())
            .unwrap_or_default()
    };

    let mut sample_rates = Vec::new();
    let mut channels = Vec::new();
    for config in &configs {
        for rate_val in [44100u32, 48000, 88200, 96000, 176400, 192000] {
            let rate = cpal::SampleRate(rate_val);
            if rate >= config.min_sample_rate()
                && rate <= config.max_sample_rate()
                && !sample_rates.contains(&rate_val)
            {
                sample_rates.push(rate_val);
            }
        }
        if !channels.contains(&config.channels()) {
            channels.push(config.channels());
        }
    }

    sample_rates.sort_unstable();
    channels.sort_unstable();
    (sample_rates, channels)
}

fn find_device(handle: &DeviceHandle, kind: DeviceKind) -> Option<cpal::Device> {
    let host = cpal::default_host();
    let (_, name) = handle.split();

    if name == "default" {
        return match kind {
            DeviceKind::Input => host.default_input_device(),
            DeviceKind::Output => host.default_output_device(),
        };
    }

    let mut devices = match kind {
        DeviceKind::Input => host.input_devices().ok()?,
        DeviceKind::Output => host.output_devices().ok()?,
    };
    devices.find(|d| d.name().map(|n| n == name).unwrap_or(false))
}

/// Resolve a capture device. Loopback capture opens an output device as an
/// input stream, which the WASAPI backend supports.
pub fn capture_device(handle: &DeviceHandle, loopback: bool) -> Result<cpal::Device, CaptureError> {
    let kind = if loopback {
        DeviceKind::Output
    } else {
        handle.split().0
    };
    find_device(handle, kind).ok_or_else(|| CaptureError::DeviceNotFound(handle.to_string()))
}

/// Resolve a playback device
pub fn render_device(handle: &DeviceHandle) -> Result<cpal::Device, RenderError> {
    find_device(handle, DeviceKind::Output)
        .ok_or_else(|| RenderError::DeviceNotFound(handle.to_string()))
}
