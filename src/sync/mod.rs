//! Synchronization core: packetizing, jitter buffering, playout timing and
//! latency calibration

pub mod calibration;
pub mod jitter;
pub mod packetizer;
pub mod playout;

pub use calibration::{CalibrationPhase, CalibrationSample, Calibrator};
pub use jitter::{JitterBuffer, JitterStats, PushOutcome};
pub use packetizer::Packetizer;
pub use playout::{PlayoutClock, Schedule};
