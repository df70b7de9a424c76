//! Lock-free ring buffer and the captured audio frame type
//!
//! The ring buffer is a single-producer single-consumer (SPSC) queue used at
//! the boundary between a cpal callback thread and the engine.

use bytes::Bytes;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::protocol::StreamFormat;

/// Fixed-duration block of interleaved PCM produced by the frame source
#[derive(Debug, Clone, PartialEq)]
pub struct AudioFrame {
    /// Interleaved PCM bytes in `format.sample_format`
    pub samples: Bytes,
    pub sample_rate: u32,
    pub channel_count: u16,
    pub format: StreamFormat,
    /// Session-clock nanoseconds at which the frame was captured
    pub capture_timestamp: u64,
}

impl AudioFrame {
    pub fn new(samples: Bytes, format: StreamFormat, capture_timestamp: u64) -> Self {
        Self {
            samples,
            sample_rate: format.sample_rate,
            channel_count: format.channels,
            format,
            capture_timestamp,
        }
    }

    /// Number of samples per channel
    pub fn samples_per_channel(&self) -> usize {
        self.samples.len() / self.format.bytes_per_frame().max(1)
    }

    pub fn duration(&self) -> Duration {
        self.format.duration_of(self.samples.len())
    }
}

/// Lock-free bounded queue with overflow/underrun accounting
pub struct RingBuffer<T> {
    queue: ArrayQueue<T>,
    overflow_count: AtomicUsize,
    underrun_count: AtomicUsize,
}

impl<T> RingBuffer<T> {
    /// Create a new ring buffer with the specified capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            queue: ArrayQueue::new(capacity),
            overflow_count: AtomicUsize::new(0),
            underrun_count: AtomicUsize::new(0),
        }
    }

    /// Push an item, returning false (and counting an overflow) when full
    pub fn push(&self, item: T) -> bool {
        match self.queue.push(item) {
            Ok(()) => true,
            Err(_) => {
                self.overflow_count.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Pop an item, counting an underrun when empty
    pub fn pop(&self) -> Option<T> {
        match self.queue.pop() {
            Some(item) => Some(item),
            None => {
                self.underrun_count.fetch_add(1, Ordering::Relaxed);
                None
            }
        }
    }

    /// Try to pop without counting underrun
    pub fn try_pop(&self) -> Option<T> {
        self.queue.pop()
    }

    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.queue.is_full()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn capacity(&self) -> usize {
        self.queue.capacity()
    }

    pub fn overflow_count(&self) -> usize {
        self.overflow_count.load(Ordering::Relaxed)
    }

    pub fn underrun_count(&self) -> usize {
        self.underrun_count.load(Ordering::Relaxed)
    }

    /// Get fill level as a fraction of capacity
    pub fn fill_level(&self) -> f32 {
        self.len() as f32 / self.capacity() as f32
    }
}

/// Thread-safe handle to a ring buffer
pub type SharedRingBuffer<T> = Arc<RingBuffer<T>>;

/// Create a new shared ring buffer
pub fn create_shared_buffer<T>(capacity: usize) -> SharedRingBuffer<T> {
    Arc::new(RingBuffer::new(capacity))
}
