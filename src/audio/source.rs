//! Frame Source Adapter
//!
//! Wraps a capture collaborator and turns it into a stream of fixed-duration
//! [`AudioFrame`]s stamped with the session clock. The stream format is
//! detected on the first read and fixed for the rest of the session.

use bytes::Bytes;
use std::time::Duration;

use crate::audio::buffer::AudioFrame;
use crate::clock::SessionClock;
use crate::error::CaptureError;
use crate::protocol::StreamFormat;

/// Capture collaborator interface
///
/// Implementations own the platform side (device acquisition, loopback,
/// permission handling). Device selection is passed in at construction.
pub trait CaptureSource: Send {
    /// Open the device, optionally requesting a format, and report the
    /// format actually delivered
    fn open(&mut self, requested: Option<StreamFormat>) -> Result<StreamFormat, CaptureError>;

    /// Block until `duration` worth of PCM is available
    fn read_frame(&mut self, duration: Duration) -> Result<Bytes, CaptureError>;

    /// Format the device is currently delivering, when the backend can tell
    fn current_format(&self) -> Option<StreamFormat> {
        None
    }

    fn close(&mut self);

    /// Human readable name for logs
    fn name(&self) -> &str {
        "capture"
    }
}

/// Adapter yielding frames from a capture collaborator
pub struct FrameSource {
    capture: Box<dyn CaptureSource>,
    clock: SessionClock,
    frame_duration: Duration,
    requested: Option<StreamFormat>,
    format: Option<StreamFormat>,
    last_timestamp: Option<u64>,
    frames_read: u64,
}

impl FrameSource {
    pub fn new(
        capture: Box<dyn CaptureSource>,
        clock: SessionClock,
        frame_duration: Duration,
    ) -> Self {
        Self {
            capture,
            clock,
            frame_duration,
            requested: None,
            format: None,
            last_timestamp: None,
            frames_read: 0,
        }
    }

    /// Ask the collaborator for a specific format on open
    pub fn with_requested_format(mut self, format: StreamFormat) -> Self {
        self.requested = Some(format);
        self
    }

    /// Format fixed at first read, if any
    pub fn format(&self) -> Option<StreamFormat> {
        self.format
    }

    pub fn frame_duration(&self) -> Duration {
        self.frame_duration
    }

    pub fn frames_read(&self) -> u64 {
        self.frames_read
    }

    /// Block until the next frame is available
    pub fn next_frame(&mut self) -> Result<AudioFrame, CaptureError> {
        let format = match self.format {
            Some(format) => {
                if let Some(actual) = self.capture.current_format() {
                    if actual != format {
                        return Err(CaptureError::FormatChanged {
                            expected: format,
                            actual,
                        });
                    }
                }
                format
            }
            None => {
                let format = self.capture.open(self.requested)?;
                if format.sample_rate == 0 || format.channels == 0 || format.channels > 255 {
                    return Err(CaptureError::UnsupportedFormat(format.to_string()));
                }
                tracing::info!(
                    "Capture '{}' opened: {}, {:?} frames",
                    self.capture.name(),
                    format,
                    self.frame_duration
                );
                self.format = Some(format);
                format
            }
        };

        let samples = self.capture.read_frame(self.frame_duration)?;
        if samples.is_empty() || samples.len() % format.bytes_per_frame() != 0 {
            return Err(CaptureError::Unavailable(format!(
                "short read of {} bytes",
                samples.len()
            )));
        }

        // Keep timestamps strictly increasing even if the clock read races
        let now = self.clock.now_ns();
        let timestamp = match self.last_timestamp {
            Some(last) if now <= last => last + 1,
            _ => now,
        };
        self.last_timestamp = Some(timestamp);
        self.frames_read += 1;

        Ok(AudioFrame::new(samples, format, timestamp))
    }

    /// Release the capture handle. The next `next_frame` reopens it and
    /// detects the format again.
    pub fn close(&mut self) {
        if self.format.take().is_some() {
            self.capture.close();
            tracing::debug!("Capture '{}' closed", self.capture.name());
        }
        self.last_timestamp = None;
    }
}

impl Drop for FrameSource {
    fn drop(&mut self) {
        self.close();
    }
}
