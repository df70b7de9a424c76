//! Audio subsystem: capture, render and the frame source adapter

pub mod buffer;
pub mod capture;
pub mod device;
pub mod mock;
pub mod pcm;
pub mod playback;
pub mod source;

pub use buffer::{AudioFrame, RingBuffer};
pub use capture::CpalCapture;
pub use device::{list_devices, AudioDeviceInfo, DeviceHandle};
pub use playback::{CpalRender, RenderSink};
pub use source::{CaptureSource, FrameSource};
