//! Render collaborators
//!
//! A [`RenderSink`] receives decoded PCM from an endpoint's playout lane and
//! reports, when it can, the instant the written audio will actually leave
//! the device. That instant is what calibration measures.

use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::bounded;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{create_shared_buffer, SharedRingBuffer};
use crate::audio::device::{render_device, DeviceHandle};
use crate::audio::pcm;
use crate::constants::RING_BUFFER_CAPACITY;
use crate::error::RenderError;
use crate::protocol::StreamFormat;

/// Render collaborator interface
pub trait RenderSink: Send {
    /// Prepare the device for `format`. Called again when the format changes.
    fn open(&mut self, format: StreamFormat, device: &DeviceHandle) -> Result<(), RenderError>;

    /// Queue one frame of interleaved PCM. Returns the estimated instant the
    /// first sample reaches the listener, or `None` when the backend cannot
    /// tell.
    fn write_frame(&mut self, pcm: &[u8]) -> Result<Option<Instant>, RenderError>;

    fn close(&mut self);

    fn name(&self) -> &str {
        "render"
    }
}

/// Render collaborator backed by a cpal output stream
pub struct CpalRender {
    format: Option<StreamFormat>,
    queue: SharedRingBuffer<Vec<f32>>,
    /// Sample frames queued but not yet handed to the device
    queued_frames: Arc<AtomicUsize>,
    /// Device output latency measured in the callback, nanoseconds
    output_latency_ns: Arc<AtomicU64>,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    name: String,
}

impl CpalRender {
    pub fn new() -> Self {
        Self {
            format: None,
            queue: create_shared_buffer(RING_BUFFER_CAPACITY),
            queued_frames: Arc::new(AtomicUsize::new(0)),
            output_latency_ns: Arc::new(AtomicU64::new(0)),
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            name: "cpal".to_string(),
        }
    }

    /// Frames dropped because the device fell behind
    pub fn overflow_count(&self) -> usize {
        self.queue.overflow_count()
    }

    /// Callbacks that found nothing to play
    pub fn underrun_count(&self) -> usize {
        self.queue.underrun_count()
    }

    fn queued_duration(&self, format: StreamFormat) -> Duration {
        let frames = self.queued_frames.load(Ordering::Relaxed) as u64;
        Duration::from_nanos(frames * 1_000_000_000 / format.sample_rate.max(1) as u64)
    }
}

impl Default for CpalRender {
    fn default() -> Self {
        Self::new()
    }
}

/// State owned by the output callback
struct OutputState {
    queue: SharedRingBuffer<Vec<f32>>,
    queued_frames: Arc<AtomicUsize>,
    output_latency_ns: Arc<AtomicU64>,
    channels: usize,
    current: Vec<f32>,
    position: usize,
}

impl OutputState {
    fn fill<T: cpal::SizedSample + cpal::FromSample<f32>>(
        &mut self,
        data: &mut [T],
        info: &cpal::OutputCallbackInfo,
    ) {
        let ts = info.timestamp();
        if let Some(latency) = ts.playback.duration_since(&ts.callback) {
            self.output_latency_ns
                .store(latency.as_nanos() as u64, Ordering::Relaxed);
        }

        let mut consumed = 0;
        for slot in data.iter_mut() {
            if self.position >= self.current.len() {
                match self.queue.pop() {
                    Some(chunk) => {
                        self.current = chunk;
                        self.position = 0;
                    }
                    None => {
                        *slot = T::EQUILIBRIUM;
                        continue;
                    }
                }
            }
            *slot = T::from_sample(self.current[self.position]);
            self.position += 1;
            consumed += 1;
        }

        let frames = consumed / self.channels.max(1);
        let _ = self
            .queued_frames
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |q| {
                Some(q.saturating_sub(frames))
            });
    }
}

fn build_stream<T: cpal::SizedSample + cpal::FromSample<f32>>(
    device: &cpal::Device,
    config: &StreamConfig,
    mut state: OutputState,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    device.build_output_stream(
        config,
        move |data: &mut [T], info: &cpal::OutputCallbackInfo| state.fill(data, info),
        |err| tracing::error!("Render stream error: {}", err),
        None,
    )
}

impl RenderSink for CpalRender {
    fn open(&mut self, format: StreamFormat, device: &DeviceHandle) -> Result<(), RenderError> {
        if self.format == Some(format) {
            return Ok(());
        }
        self.close();

        let cpal_device = render_device(device)?;
        let default_config = cpal_device
            .default_output_config()
            .map_err(|e| RenderError::DeviceNotFound(e.to_string()))?;
        let device_format = default_config.sample_format();
        if !matches!(device_format, cpal::SampleFormat::F32 | cpal::SampleFormat::I16) {
            return Err(RenderError::UnsupportedFormat(format!("{:?}", device_format)));
        }

        let config = StreamConfig {
            channels: format.channels,
            sample_rate: cpal::SampleRate(format.sample_rate),
            buffer_size: cpal::BufferSize::Default,
        };

        self.queue.clear();
        self.queued_frames.store(0, Ordering::Relaxed);
        self.running.store(true, Ordering::SeqCst);

        let state = OutputState {
            queue: self.queue.clone(),
            queued_frames: self.queued_frames.clone(),
            output_latency_ns: self.output_latency_ns.clone(),
            channels: format.channels as usize,
            current: Vec::new(),
            position: 0,
        };
        let running = self.running.clone();
        let (ready_tx, ready_rx) = bounded::<Result<(), RenderError>>(1);

        let handle = thread::Builder::new()
            .name(format!("render-{}", device))
            .spawn(move || {
                let stream = match device_format {
                    cpal::SampleFormat::I16 => build_stream::<i16>(&cpal_device, &config, state),
                    _ => build_stream::<f32>(&cpal_device, &config, state),
                };
                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(RenderError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(RenderError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                while running.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
            })
            .map_err(|e| RenderError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv_timeout(Duration::from_secs(2))
            .unwrap_or_else(|_| Err(RenderError::StreamError("render thread did not start".into())));
        if let Err(e) = ready {
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        self.thread_handle = Some(handle);
        self.format = Some(format);
        self.name = device.to_string();
        tracing::info!("Render opened on {} at {}", device, format);
        Ok(())
    }

    fn write_frame(&mut self, data: &[u8]) -> Result<Option<Instant>, RenderError> {
        let format = self.format.ok_or(RenderError::NotOpen)?;
        let now = Instant::now();
        let ahead = self.queued_duration(format)
            + Duration::from_nanos(self.output_latency_ns.load(Ordering::Relaxed));

        let samples = pcm::to_f32(data, format.sample_format);
        let frames = samples.len() / format.channels.max(1) as usize;
        if self.queue.push(samples) {
            self.queued_frames.fetch_add(frames, Ordering::Relaxed);
        } else {
            tracing::trace!("Render queue full on {}, frame dropped", self.name);
        }

        Ok(Some(now + ahead))
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.format = None;
        self.queue.clear();
        self.queued_frames.store(0, Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CpalRender {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_before_open_fails() {
        let mut render = CpalRender::new();
        assert!(matches!(
            render.write_frame(&[0, 0, 0, 0]),
            Err(RenderError::NotOpen)
        ));
    }

    #[test]
    fn test_queued_duration() {
        let render = CpalRender::new();
        let format = StreamFormat::new(48000, 2, crate::protocol::SampleFormat::F32);
        render.queued_frames.store(480, Ordering::Relaxed);
        assert_eq!(render.queued_duration(format), Duration::from_millis(10));
    }
}
