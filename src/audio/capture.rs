//! Audio capture from cpal devices
//!
//! The cpal stream lives on its own thread (streams are not `Send` on every
//! backend). The callback converts samples to little-endian PCM bytes and
//! pushes them through a lock-free ring buffer; `read_frame` reassembles
//! fixed-duration frames on the consumer side.

use bytes::{Bytes, BytesMut};
use cpal::traits::{DeviceTrait, StreamTrait};
use cpal::StreamConfig;
use crossbeam_channel::{bounded, Receiver, Sender};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::audio::buffer::{create_shared_buffer, SharedRingBuffer};
use crate::audio::device::{capture_device, DeviceHandle};
use crate::audio::source::CaptureSource;
use crate::constants::RING_BUFFER_CAPACITY;
use crate::error::CaptureError;
use crate::protocol::{SampleFormat, StreamFormat};

/// Silence from the device after which capture is reported lost
const STALL_TIMEOUT: Duration = Duration::from_secs(2);

/// Sample types the capture callback can serialize
trait PcmSample: cpal::SizedSample + Send + 'static {
    const WIRE_FORMAT: SampleFormat;
    fn extend_le(samples: &[Self], out: &mut Vec<u8>);
}

impl PcmSample for i16 {
    const WIRE_FORMAT: SampleFormat = SampleFormat::I16;
    fn extend_le(samples: &[Self], out: &mut Vec<u8>) {
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
    }
}

impl PcmSample for f32 {
    const WIRE_FORMAT: SampleFormat = SampleFormat::F32;
    fn extend_le(samples: &[Self], out: &mut Vec<u8>) {
        for s in samples {
            out.extend_from_slice(&s.to_le_bytes());
        }
    }
}

/// Capture collaborator backed by a cpal input (or loopback) stream
pub struct CpalCapture {
    device: DeviceHandle,
    loopback: bool,
    running: Arc<AtomicBool>,
    thread_handle: Option<JoinHandle<()>>,
    chunks: SharedRingBuffer<Vec<u8>>,
    pending: BytesMut,
    error_rx: Option<Receiver<CaptureError>>,
    format: Option<StreamFormat>,
    name: String,
}

impl CpalCapture {
    pub fn new(device: DeviceHandle, loopback: bool) -> Self {
        let name = if loopback {
            format!("loopback:{}", device)
        } else {
            device.to_string()
        };
        Self {
            device,
            loopback,
            running: Arc::new(AtomicBool::new(false)),
            thread_handle: None,
            chunks: create_shared_buffer(RING_BUFFER_CAPACITY),
            pending: BytesMut::new(),
            error_rx: None,
            format: None,
            name,
        }
    }

    /// Chunks dropped because the consumer fell behind
    pub fn overflow_count(&self) -> usize {
        self.chunks.overflow_count()
    }

    fn stream_config(
        &self,
        device: &cpal::Device,
        requested: Option<StreamFormat>,
    ) -> Result<(StreamConfig, SampleFormat), CaptureError> {
        let default_config = if self.loopback {
            device.default_output_config()
        } else {
            device.default_input_config()
        }
        .map_err(|e| CaptureError::DeviceNotFound(e.to_string()))?;

        let sample_format = match default_config.sample_format() {
            cpal::SampleFormat::I16 => SampleFormat::I16,
            cpal::SampleFormat::F32 => SampleFormat::F32,
            other => {
                return Err(CaptureError::UnsupportedFormat(format!("{:?}", other)));
            }
        };

        let config = StreamConfig {
            channels: requested
                .map(|f| f.channels)
                .unwrap_or(default_config.channels()),
            sample_rate: requested
                .map(|f| cpal::SampleRate(f.sample_rate))
                .unwrap_or(default_config.sample_rate()),
            buffer_size: cpal::BufferSize::Default,
        };
        Ok((config, sample_format))
    }
}

/// Interleaved little-endian wire bytes of one callback buffer
fn encode<T: PcmSample>(data: &[T]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(data.len() * T::WIRE_FORMAT.bytes_per_sample());
    T::extend_le(data, &mut bytes);
    bytes
}

fn build_stream<T: PcmSample>(
    device: &cpal::Device,
    config: &StreamConfig,
    chunks: SharedRingBuffer<Vec<u8>>,
    running: Arc<AtomicBool>,
    error_tx: Sender<CaptureError>,
) -> Result<cpal::Stream, cpal::BuildStreamError> {
    device.build_input_stream(
        config,
        move |data: &[T], _: &cpal::InputCallbackInfo| {
            if !running.load(Ordering::Relaxed) {
                return;
            }
            // Overflow is counted by the ring buffer
            let _ = chunks.push(encode(data));
        },
        move |err| {
            let _ = error_tx.try_send(CaptureError::Unavailable(err.to_string()));
        },
        None,
    )
}

impl CaptureSource for CpalCapture {
    fn open(&mut self, requested: Option<StreamFormat>) -> Result<StreamFormat, CaptureError> {
        if let Some(format) = self.format {
            return Ok(format);
        }

        let device = capture_device(&self.device, self.loopback)?;
        let (config, sample_format) = self.stream_config(&device, requested)?;
        let format = StreamFormat::new(config.sample_rate.0, config.channels, sample_format);

        let (error_tx, error_rx) = bounded::<CaptureError>(16);
        let (ready_tx, ready_rx) = bounded::<Result<(), CaptureError>>(1);
        self.chunks.clear();
        self.pending.clear();
        self.running.store(true, Ordering::SeqCst);

        let running = self.running.clone();
        let running_for_loop = self.running.clone();
        let chunks = self.chunks.clone();

        let handle = thread::Builder::new()
            .name(format!("capture-{}", self.name))
            .spawn(move || {
                let stream = match sample_format {
                    SampleFormat::I16 => {
                        build_stream::<i16>(&device, &config, chunks, running, error_tx)
                    }
                    SampleFormat::F32 => {
                        build_stream::<f32>(&device, &config, chunks, running, error_tx)
                    }
                };

                let stream = match stream {
                    Ok(stream) => stream,
                    Err(e) => {
                        let _ = ready_tx.send(Err(CaptureError::StreamError(e.to_string())));
                        return;
                    }
                };
                if let Err(e) = stream.play() {
                    let _ = ready_tx.send(Err(CaptureError::StreamError(e.to_string())));
                    return;
                }
                let _ = ready_tx.send(Ok(()));

                // Keep thread alive while running
                while running_for_loop.load(Ordering::Relaxed) {
                    thread::sleep(Duration::from_millis(10));
                }
                // Stream is dropped here, stopping capture
            })
            .map_err(|e| CaptureError::StreamError(e.to_string()))?;

        let ready = ready_rx
            .recv_timeout(STALL_TIMEOUT)
            .unwrap_or_else(|_| Err(CaptureError::StreamError("capture thread did not start".into())));
        if let Err(e) = ready {
            self.running.store(false, Ordering::SeqCst);
            let _ = handle.join();
            return Err(e);
        }

        self.thread_handle = Some(handle);
        self.error_rx = Some(error_rx);
        self.format = Some(format);
        tracing::info!("Capturing from {} at {}", self.name, format);
        Ok(format)
    }

    fn read_frame(&mut self, duration: Duration) -> Result<Bytes, CaptureError> {
        let format = self
            .format
            .ok_or_else(|| CaptureError::Unavailable("capture not open".into()))?;
        let needed = format.frames_in(duration) * format.bytes_per_frame();
        let mut last_data = Instant::now();

        while self.pending.len() < needed {
            if let Some(err) = self.error_rx.as_ref().and_then(|rx| rx.try_recv().ok()) {
                return Err(err);
            }

            match self.chunks.try_pop() {
                Some(chunk) => {
                    self.pending.extend_from_slice(&chunk);
                    last_data = Instant::now();
                }
                None => {
                    if last_data.elapsed() > STALL_TIMEOUT {
                        return Err(CaptureError::Unavailable(format!(
                            "no audio from {} for {:?}",
                            self.name, STALL_TIMEOUT
                        )));
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }

        Ok(self.pending.split_to(needed).freeze())
    }

    fn current_format(&self) -> Option<StreamFormat> {
        self.format
    }

    fn close(&mut self) {
        self.running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.thread_handle.take() {
            let _ = handle.join();
        }
        self.error_rx = None;
        self.format = None;
        self.chunks.clear();
        self.pending.clear();
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for CpalCapture {
    fn drop(&mut self) {
        self.close();
    }
}
