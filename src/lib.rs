//! # SyncWave
//!
//! Synchronized playback of one live audio stream on many endpoints over LAN.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                              SOURCE PC                                       │
//! │  ┌──────────────────┐     ┌──────────────────┐     ┌────────────────────┐   │
//! │  │ Capture (cpal /  │────▶│  Frame Source    │────▶│    Packetizer      │   │
//! │  │ loopback / mock) │     │  (audio::source) │     │  (sync::packetizer)│   │
//! │  └──────────────────┘     └──────────────────┘     └─────────┬──────────┘   │
//! │                                   send lane                   │              │
//! │                                                               ▼              │
//! │  ┌─────────────────────────────────────────────────────────────────────┐   │
//! │  │          Fan-out Sender (network::sender) - Single Socket            │   │
//! │  │   Packets: [SW|ver|kind|Stream|Seq|Rate|Ch|Fmt|Timestamp|PCM]        │   │
//! │  └───────┬───────────────────────┬─────────────────────────┬───────────┘   │
//! │          │ loopback              │ loopback                 │              │
//! │          ▼                       ▼                          │              │
//! │  ┌───────────────┐       ┌───────────────┐                  │              │
//! │  │ Local Endpoint│       │ Local Endpoint│   Calibrator ◀───┼── probes     │
//! │  │  recv lane    │       │  recv lane    │   (one run at    │              │
//! │  │  jitter buf   │       │  jitter buf   │    a time)       │              │
//! │  │  playout lane │       │  playout lane │                  │              │
//! │  └──────┬────────┘       └──────┬────────┘                  │              │
//! │         ▼                       ▼                           │              │
//! │   Speakers (wired)       Headphones (BT)                    │              │
//! └─────────────────────────────────────────────────────────────┼──────────────┘
//!                                                               │ UDP over LAN
//!                                                               ▼
//! ┌─────────────────────────────────────────────────────────────────────────────┐
//! │                             RECEIVER PC                                      │
//! │  ┌─────────────┐   ┌─────────────┐   ┌──────────────┐   ┌─────────────┐    │
//! │  │ UDP Receive │──▶│Jitter Buffer│──▶│ Playout Clock│──▶│   Render    │    │
//! │  │   lane      │   │  (reorder)  │   │ drift correct│   │   (cpal)    │    │
//! │  └─────────────┘   └─────────────┘   └──────────────┘   └─────────────┘    │
//! └─────────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod audio;
pub mod clock;
pub mod config;
pub mod endpoints;
pub mod error;
pub mod network;
pub mod protocol;
pub mod sync;

pub use clock::SessionClock;
pub use config::AppConfig;
pub use endpoints::{BroadcastSession, EndpointId, EndpointTarget};
pub use error::{Error, Result};

/// Application-wide constants
pub mod constants {
    /// Default sample rate used by the synthetic source and as a capture hint
    pub const DEFAULT_SAMPLE_RATE: u32 = 48000;

    /// Default channel count (stereo)
    pub const DEFAULT_CHANNELS: u16 = 2;

    /// Default frame size in milliseconds
    pub const DEFAULT_FRAME_SIZE_MS: u32 = 10;

    /// Default UDP port for streaming and control traffic
    pub const DEFAULT_UDP_PORT: u16 = 5555;

    /// Largest PCM payload carried by one datagram
    pub const MAX_PAYLOAD_SIZE: usize = 1400;

    /// Receive buffer size for a single datagram
    pub const MAX_PACKET_SIZE: usize = 1472; // MTU - IP/UDP headers

    /// Lock-free ring buffer capacity (in chunks)
    pub const RING_BUFFER_CAPACITY: usize = 256;

    /// Default nominal transport delay in milliseconds
    pub const DEFAULT_NOMINAL_DELAY_MS: u64 = 120;
}
