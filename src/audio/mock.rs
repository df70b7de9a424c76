//! Synthetic capture and collecting render for running the engine without
//! audio hardware.
//!
//! Frame `n` produced by [`SyntheticCapture`] carries the same marker value in
//! every sample, so whatever reaches a [`CollectingRender`] can be traced back
//! to the frame it was captured in.

use bytes::{BufMut, Bytes, BytesMut};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::audio::device::DeviceHandle;
use crate::audio::playback::RenderSink;
use crate::audio::source::CaptureSource;
use crate::error::{CaptureError, RenderError};
use crate::protocol::{SampleFormat, StreamFormat};

const MARKER_PERIOD: u64 = 32_000;

/// Marker sample value carried by frame `index`
pub fn frame_marker(index: u64) -> i16 {
    (index % MARKER_PERIOD + 1) as i16
}

/// Recover the frame index (modulo the marker period) from rendered PCM
pub fn decode_marker(pcm: &[u8], format: SampleFormat) -> Option<u64> {
    let value = match format {
        SampleFormat::I16 => i16::from_le_bytes([*pcm.first()?, *pcm.get(1)?]) as i32,
        SampleFormat::F32 => {
            let raw = f32::from_le_bytes([*pcm.first()?, *pcm.get(1)?, *pcm.get(2)?, *pcm.get(3)?]);
            (raw * 32768.0).round() as i32
        }
    };
    if value <= 0 {
        None
    } else {
        Some(value as u64 - 1)
    }
}

/// Open/close accounting shared with tests
#[derive(Debug, Default)]
pub struct CaptureCounters {
    pub opens: AtomicUsize,
    pub closes: AtomicUsize,
}

impl CaptureCounters {
    /// True when every open has been matched by a close
    pub fn balanced(&self) -> bool {
        self.opens.load(Ordering::SeqCst) == self.closes.load(Ordering::SeqCst)
    }
}

/// Capture collaborator generating marker frames in real time
pub struct SyntheticCapture {
    format: Arc<Mutex<StreamFormat>>,
    opened: Option<StreamFormat>,
    paced: bool,
    started: Option<Instant>,
    frames_emitted: u64,
    fail_after: Option<u64>,
    counters: Arc<CaptureCounters>,
}

impl SyntheticCapture {
    pub fn new(format: StreamFormat) -> Self {
        Self {
            format: Arc::new(Mutex::new(format)),
            opened: None,
            paced: true,
            started: None,
            frames_emitted: 0,
            fail_after: None,
            counters: Arc::new(CaptureCounters::default()),
        }
    }

    /// Return frames as fast as they are requested
    pub fn unpaced(mut self) -> Self {
        self.paced = false;
        self
    }

    /// Simulate losing the device after `frames` frames
    pub fn fail_after(mut self, frames: u64) -> Self {
        self.fail_after = Some(frames);
        self
    }

    /// Handle to the format the "device" reports; writing to it simulates a
    /// mid-stream format change.
    pub fn format_switch(&self) -> Arc<Mutex<StreamFormat>> {
        self.format.clone()
    }

    pub fn counters(&self) -> Arc<CaptureCounters> {
        self.counters.clone()
    }

    fn frame(&self, format: StreamFormat, frames: usize) -> Bytes {
        let marker = frame_marker(self.frames_emitted);
        let samples = frames * format.channels as usize;
        let mut buf = BytesMut::with_capacity(samples * format.sample_format.bytes_per_sample());
        for _ in 0..samples {
            match format.sample_format {
                SampleFormat::I16 => buf.put_i16_le(marker),
                SampleFormat::F32 => buf.put_f32_le(marker as f32 / 32768.0),
            }
        }
        buf.freeze()
    }
}

impl CaptureSource for SyntheticCapture {
    fn open(&mut self, _requested: Option<StreamFormat>) -> Result<StreamFormat, CaptureError> {
        let format = *self.format.lock();
        self.opened = Some(format);
        self.started = None;
        self.frames_emitted = 0;
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        Ok(format)
    }

    fn read_frame(&mut self, duration: Duration) -> Result<Bytes, CaptureError> {
        let format = self
            .opened
            .ok_or_else(|| CaptureError::Unavailable("synthetic capture not open".into()))?;
        if let Some(limit) = self.fail_after {
            if self.frames_emitted >= limit {
                return Err(CaptureError::Unavailable("synthetic device removed".into()));
            }
        }

        if self.paced {
            // Anchored to the first read so sleep overshoot never accumulates
            let started = *self.started.get_or_insert_with(Instant::now);
            let due = started + duration * (self.frames_emitted as u32 + 1);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }

        let bytes = self.frame(format, format.frames_in(duration));
        self.frames_emitted += 1;
        Ok(bytes)
    }

    fn current_format(&self) -> Option<StreamFormat> {
        Some(*self.format.lock())
    }

    fn close(&mut self) {
        if self.opened.take().is_some() {
            self.counters.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn name(&self) -> &str {
        "synthetic"
    }
}

/// One frame handed to a [`CollectingRender`]
#[derive(Debug, Clone)]
pub struct RenderedFrame {
    /// When the playout lane wrote the frame
    pub at: Instant,
    /// Instant the render reported back
    pub reported: Option<Instant>,
    /// Capture frame index, when the payload carries a marker
    pub marker: Option<u64>,
    pub len: usize,
}

/// Shared view of everything a [`CollectingRender`] received
#[derive(Debug, Clone, Default)]
pub struct RenderLog {
    frames: Arc<Mutex<Vec<RenderedFrame>>>,
    opens: Arc<AtomicUsize>,
    closes: Arc<AtomicUsize>,
}

impl RenderLog {
    pub fn frames(&self) -> Vec<RenderedFrame> {
        self.frames.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.frames.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.lock().is_empty()
    }

    /// Write instant of the first frame carrying `marker`
    pub fn first_with_marker(&self, marker: u64) -> Option<Instant> {
        self.frames
            .lock()
            .iter()
            .find(|f| f.marker == Some(marker))
            .map(|f| f.at)
    }

    /// Instant the first frame carrying `marker` became audible: the
    /// reported instant, or the write instant when nothing was reported
    pub fn first_audible_with_marker(&self, marker: u64) -> Option<Instant> {
        self.frames
            .lock()
            .iter()
            .find(|f| f.marker == Some(marker))
            .map(|f| f.reported.unwrap_or(f.at))
    }

    /// Highest marker received so far
    pub fn last_marker(&self) -> Option<u64> {
        self.frames.lock().iter().filter_map(|f| f.marker).max()
    }

    pub fn opens(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }
}

/// Render collaborator recording what it is given
pub struct CollectingRender {
    log: RenderLog,
    format: Option<StreamFormat>,
    output_latency: Option<Duration>,
}

impl CollectingRender {
    /// A render that cannot report playout instants
    pub fn new() -> (Self, RenderLog) {
        let log = RenderLog::default();
        (
            Self {
                log: log.clone(),
                format: None,
                output_latency: None,
            },
            log,
        )
    }

    /// A render that reports audio leaving `latency` after each write
    pub fn with_latency(latency: Duration) -> (Self, RenderLog) {
        let (mut render, log) = Self::new();
        render.output_latency = Some(latency);
        (render, log)
    }
}

impl RenderSink for CollectingRender {
    fn open(&mut self, format: StreamFormat, _device: &DeviceHandle) -> Result<(), RenderError> {
        self.format = Some(format);
        self.log.opens.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn write_frame(&mut self, pcm: &[u8]) -> Result<Option<Instant>, RenderError> {
        let format = self.format.ok_or(RenderError::NotOpen)?;
        let at = Instant::now();
        let reported = self.output_latency.map(|latency| at + latency);
        self.log.frames.lock().push(RenderedFrame {
            at,
            reported,
            marker: decode_marker(pcm, format.sample_format),
            len: pcm.len(),
        });
        Ok(reported)
    }

    fn close(&mut self) {
        if self.format.take().is_some() {
            self.log.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn name(&self) -> &str {
        "collecting"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_marker_survives_both_formats() {
        for sample_format in [SampleFormat::I16, SampleFormat::F32] {
            let format = StreamFormat::new(48000, 2, sample_format);
            let mut capture = SyntheticCapture::new(format).unpaced();
            capture.open(None).unwrap();

            for expected in 0..3 {
                let pcm = capture.read_frame(Duration::from_millis(10)).unwrap();
                assert_eq!(pcm.len(), 480 * format.bytes_per_frame());
                assert_eq!(decode_marker(&pcm, sample_format), Some(expected));
            }
        }
    }

    #[test]
    fn test_paced_capture_runs_in_real_time() {
        let format = StreamFormat::new(48000, 1, SampleFormat::I16);
        let mut capture = SyntheticCapture::new(format);
        capture.open(None).unwrap();

        let start = Instant::now();
        for _ in 0..5 {
            capture.read_frame(Duration::from_millis(10)).unwrap();
        }
        assert!(start.elapsed() >= Duration::from_millis(45));
    }

    #[test]
    fn test_counters_track_open_close() {
        let format = StreamFormat::new(48000, 2, SampleFormat::I16);
        let mut capture = SyntheticCapture::new(format);
        let counters = capture.counters();

        capture.open(None).unwrap();
        assert!(!counters.balanced());
        capture.close();
        capture.close();
        assert!(counters.balanced());
        assert_eq!(counters.opens.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collecting_render_reports_latency() {
        let (mut render, log) = CollectingRender::with_latency(Duration::from_millis(50));
        let format = StreamFormat::new(48000, 2, SampleFormat::I16);
        render.open(format, &DeviceHandle::default_output()).unwrap();

        let pcm = frame_marker(7).to_le_bytes().repeat(2);
        let reported = render.write_frame(&pcm).unwrap().unwrap();

        let frames = log.frames();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].marker, Some(7));
        assert_eq!(reported - frames[0].at, Duration::from_millis(50));

        render.close();
        assert_eq!((log.opens(), log.closes()), (1, 1));
    }
}
