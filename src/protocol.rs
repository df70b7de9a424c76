//! Wire protocol
//!
//! Every datagram starts with a fixed header. Audio and probe datagrams carry
//! raw interleaved PCM after it; control datagrams carry a bincode body.
//!
//! ```text
//!  0      2      3      4        6          10          14   15   16            24
//!  ┌──────┬──────┬──────┬────────┬──────────┬───────────┬────┬────┬─────────────┬─────────
//!  │ "SW" │ ver  │ kind │ stream │ sequence │ sample    │ ch │fmt │ send        │ PCM ...
//!  │      │ (1)  │      │ id u16 │ u32      │ rate u32  │ u8 │ u8 │ timestamp   │
//!  │      │      │      │        │          │           │    │    │ u64 (ns)    │
//!  └──────┴──────┴──────┴────────┴──────────┴───────────┴────┴────┴─────────────┴─────────
//! ```
//!
//! All integers are big-endian. PCM samples are little-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::error::NetworkError;

/// Leading bytes of every datagram of this protocol
pub const MAGIC: [u8; 2] = *b"SW";

/// Current protocol version
pub const PROTOCOL_VERSION: u8 = 1;

/// Size of the fixed header in bytes
pub const HEADER_LEN: usize = 24;

/// Size of the prefix shared by all packet kinds (magic, version, kind)
const PREFIX_LEN: usize = 4;

/// PCM sample encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SampleFormat {
    /// Signed 16-bit little-endian
    I16 = 1,
    /// IEEE float 32-bit little-endian
    F32 = 2,
}

impl SampleFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            SampleFormat::I16 => 2,
            SampleFormat::F32 => 4,
        }
    }

    pub fn tag(self) -> u8 {
        self as u8
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            1 => Some(SampleFormat::I16),
            2 => Some(SampleFormat::F32),
            _ => None,
        }
    }
}

/// Format of a PCM stream, fixed for the lifetime of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub sample_format: SampleFormat,
}

impl StreamFormat {
    pub fn new(sample_rate: u32, channels: u16, sample_format: SampleFormat) -> Self {
        Self {
            sample_rate,
            channels,
            sample_format,
        }
    }

    /// Bytes per interleaved sample frame (one sample for every channel)
    pub fn bytes_per_frame(&self) -> usize {
        self.channels as usize * self.sample_format.bytes_per_sample()
    }

    /// Number of sample frames in `duration`
    pub fn frames_in(&self, duration: Duration) -> usize {
        (self.sample_rate as u128 * duration.as_nanos() / 1_000_000_000) as usize
    }

    /// Duration of `bytes` worth of PCM in this format
    pub fn duration_of(&self, bytes: usize) -> Duration {
        let frames = bytes / self.bytes_per_frame().max(1);
        Duration::from_nanos(frames as u64 * 1_000_000_000 / self.sample_rate.max(1) as u64)
    }
}

impl fmt::Display for StreamFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}Hz/{}ch/{:?}",
            self.sample_rate, self.channels, self.sample_format
        )
    }
}

/// Datagram kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketKind {
    Audio = 0,
    /// First packet of a calibration probe frame
    Probe = 1,
    Control = 2,
}

impl PacketKind {
    fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(PacketKind::Audio),
            1 => Some(PacketKind::Probe),
            2 => Some(PacketKind::Control),
            _ => None,
        }
    }
}

/// Audio transport packet
#[derive(Debug, Clone, PartialEq)]
pub struct Packet {
    pub kind: PacketKind,
    pub stream_id: u16,
    pub sequence: u32,
    pub sample_rate: u32,
    pub channels: u8,
    pub sample_format: SampleFormat,
    /// Nanoseconds since the sender's session epoch
    pub send_timestamp: u64,
    pub payload: Bytes,
}

impl Packet {
    pub fn format(&self) -> StreamFormat {
        StreamFormat::new(self.sample_rate, self.channels as u16, self.sample_format)
    }

    /// Media duration of the payload
    pub fn duration(&self) -> Duration {
        self.format().duration_of(self.payload.len())
    }

    pub fn is_probe(&self) -> bool {
        self.kind == PacketKind::Probe
    }

    /// Same header, different payload and kind. Used to route a probe to a
    /// single endpoint while the others keep receiving the programme audio.
    pub fn substitute(&self, kind: PacketKind, payload: Bytes) -> Packet {
        Packet {
            kind,
            payload,
            ..self.clone()
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }

    /// Serialize header and payload
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.reserve(self.encoded_len());
        put_prefix(buf, self.kind);
        buf.put_u16(self.stream_id);
        buf.put_u32(self.sequence);
        buf.put_u32(self.sample_rate);
        buf.put_u8(self.channels);
        buf.put_u8(self.sample_format.tag());
        buf.put_u64(self.send_timestamp);
        buf.put_slice(&self.payload);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode(&mut buf);
        buf.freeze()
    }

    /// Parse an audio or probe datagram
    pub fn decode(data: &[u8]) -> Result<Packet, NetworkError> {
        let kind = check_prefix(data)?;
        if kind == PacketKind::Control {
            return Err(NetworkError::InvalidPacket("control datagram"));
        }
        if data.len() < HEADER_LEN {
            return Err(NetworkError::InvalidPacket("truncated header"));
        }

        let mut header = &data[PREFIX_LEN..HEADER_LEN];
        let stream_id = header.get_u16();
        let sequence = header.get_u32();
        let sample_rate = header.get_u32();
        let channels = header.get_u8();
        let sample_format = SampleFormat::from_tag(header.get_u8())
            .ok_or(NetworkError::InvalidPacket("unknown sample format"))?;
        let send_timestamp = header.get_u64();

        if sample_rate == 0 {
            return Err(NetworkError::InvalidPacket("zero sample rate"));
        }
        if channels == 0 {
            return Err(NetworkError::InvalidPacket("zero channels"));
        }

        let payload = &data[HEADER_LEN..];
        let frame_bytes = channels as usize * sample_format.bytes_per_sample();
        if payload.len() % frame_bytes != 0 {
            return Err(NetworkError::InvalidPacket("partial sample frame"));
        }

        Ok(Packet {
            kind,
            stream_id,
            sequence,
            sample_rate,
            channels,
            sample_format,
            send_timestamp,
            payload: Bytes::copy_from_slice(payload),
        })
    }
}

/// Out-of-band messages sharing the streaming port
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Sent when a receiver is added to a session
    Hello { session: String, stream_id: u16 },
    SetVolume { volume: f32 },
    /// Signed delay compensation in nanoseconds
    SetDelay { delay_ns: i64 },
    /// Sent when a receiver is removed or the session stops
    Goodbye { stream_id: u16 },
}

impl ControlMessage {
    pub fn to_bytes(&self) -> Result<Bytes, NetworkError> {
        let body = bincode::serialize(self)
            .map_err(|e| NetworkError::SendFailed(format!("control encode: {}", e)))?;
        let mut buf = BytesMut::with_capacity(PREFIX_LEN + body.len());
        put_prefix(&mut buf, PacketKind::Control);
        buf.put_slice(&body);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<ControlMessage, NetworkError> {
        if check_prefix(data)? != PacketKind::Control {
            return Err(NetworkError::InvalidPacket("not a control datagram"));
        }
        bincode::deserialize(&data[PREFIX_LEN..])
            .map_err(|_| NetworkError::InvalidPacket("malformed control body"))
    }
}

/// A decoded datagram of either family
#[derive(Debug, Clone, PartialEq)]
pub enum Datagram {
    Audio(Packet),
    Control(ControlMessage),
}

impl Datagram {
    pub fn decode(data: &[u8]) -> Result<Datagram, NetworkError> {
        match check_prefix(data)? {
            PacketKind::Control => ControlMessage::decode(data).map(Datagram::Control),
            _ => Packet::decode(data).map(Datagram::Audio),
        }
    }
}

fn put_prefix(buf: &mut BytesMut, kind: PacketKind) {
    buf.put_slice(&MAGIC);
    buf.put_u8(PROTOCOL_VERSION);
    buf.put_u8(kind as u8);
}

fn check_prefix(data: &[u8]) -> Result<PacketKind, NetworkError> {
    if data.len() < PREFIX_LEN || data[..2] != MAGIC {
        return Err(NetworkError::InvalidPacket("bad magic"));
    }
    if data[2] != PROTOCOL_VERSION {
        return Err(NetworkError::UnsupportedVersion(data[2]));
    }
    PacketKind::from_tag(data[3]).ok_or(NetworkError::InvalidPacket("unknown kind"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn packet(payload: Vec<u8>) -> Packet {
        Packet {
            kind: PacketKind::Audio,
            stream_id: 0xBEEF,
            sequence: 42,
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::I16,
            send_timestamp: 123_456_789,
            payload: Bytes::from(payload),
        }
    }

    #[test]
    fn test_header_layout() {
        let bytes = packet(vec![1, 2, 3, 4]).to_bytes();
        assert_eq!(bytes.len(), HEADER_LEN + 4);
        assert_eq!(&bytes[..2], b"SW");
        assert_eq!(bytes[2], PROTOCOL_VERSION);
        assert_eq!(bytes[3], PacketKind::Audio as u8);
        assert_eq!(&bytes[4..6], &0xBEEFu16.to_be_bytes());
        assert_eq!(&bytes[6..10], &42u32.to_be_bytes());
        assert_eq!(&bytes[10..14], &48000u32.to_be_bytes());
        assert_eq!(bytes[14], 2);
        assert_eq!(bytes[15], SampleFormat::I16.tag());
        assert_eq!(&bytes[16..24], &123_456_789u64.to_be_bytes());
        assert_eq!(&bytes[24..], &[1, 2, 3, 4]);
    }

    #[test]
    fn test_decode_matches_encoded_packet() {
        let original = packet(vec![0; 1920]);
        let decoded = Packet::decode(&original.to_bytes()).unwrap();
        assert_eq!(decoded, original);
        assert_eq!(decoded.duration(), Duration::from_millis(10));
    }

    #[test]
    fn test_rejects_foreign_and_future_traffic() {
        assert!(matches!(
            Packet::decode(b"GET / HTTP/1.1"),
            Err(NetworkError::InvalidPacket(_))
        ));

        let mut bytes = packet(vec![0; 4]).to_bytes().to_vec();
        bytes[2] = 9;
        assert!(matches!(
            Packet::decode(&bytes),
            Err(NetworkError::UnsupportedVersion(9))
        ));
    }

    #[test]
    fn test_rejects_partial_sample_frame() {
        let bytes = packet(vec![0; 3]).to_bytes();
        assert!(matches!(
            Packet::decode(&bytes),
            Err(NetworkError::InvalidPacket("partial sample frame"))
        ));
    }

    #[test]
    fn test_control_message_shares_prefix() {
        let msg = ControlMessage::SetDelay { delay_ns: -15_000_000 };
        let bytes = msg.to_bytes().unwrap();
        assert_eq!(&bytes[..2], b"SW");

        match Datagram::decode(&bytes).unwrap() {
            Datagram::Control(decoded) => assert_eq!(decoded, msg),
            other => panic!("unexpected datagram {:?}", other),
        }
        assert!(Packet::decode(&bytes).is_err());
    }

    #[test]
    fn test_stream_format_math() {
        let format = StreamFormat::new(48000, 2, SampleFormat::F32);
        assert_eq!(format.bytes_per_frame(), 8);
        assert_eq!(format.frames_in(Duration::from_millis(10)), 480);
        assert_eq!(format.duration_of(480 * 8), Duration::from_millis(10));
    }
}
