//! Frame to packet slicing
//!
//! A frame larger than the payload cap is split on sample-frame boundaries.
//! Each slice gets the next sequence number and a send timestamp offset by
//! the media time preceding it in the frame.

use crate::audio::buffer::AudioFrame;
use crate::protocol::{Packet, PacketKind};

pub struct Packetizer {
    stream_id: u16,
    next_sequence: u32,
    max_payload: usize,
}

impl Packetizer {
    pub fn new(stream_id: u16, max_payload: usize) -> Self {
        Self {
            stream_id,
            next_sequence: 0,
            max_payload,
        }
    }

    /// Packetizer with a random stream id
    pub fn with_random_stream_id(max_payload: usize) -> Self {
        let id = uuid::Uuid::new_v4();
        let bytes = id.as_bytes();
        Self::new(u16::from_be_bytes([bytes[0], bytes[1]]), max_payload)
    }

    pub fn stream_id(&self) -> u16 {
        self.stream_id
    }

    /// Sequence number the next packet will carry
    pub fn next_sequence(&self) -> u32 {
        self.next_sequence
    }

    /// Slice `frame` into packets. Never drops audio: every byte of the frame
    /// lands in exactly one packet.
    pub fn packetize(&mut self, frame: &AudioFrame) -> Vec<Packet> {
        let format = frame.format;
        let frame_bytes = format.bytes_per_frame().max(1);
        let chunk = (self.max_payload / frame_bytes).max(1) * frame_bytes;
        let total = frame.samples.len();

        let mut packets = Vec::with_capacity(total.div_ceil(chunk).max(1));
        let mut offset = 0;
        while offset < total {
            let end = (offset + chunk).min(total);
            let send_timestamp =
                frame.capture_timestamp + format.duration_of(offset).as_nanos() as u64;

            packets.push(Packet {
                kind: PacketKind::Audio,
                stream_id: self.stream_id,
                sequence: self.next_sequence,
                sample_rate: format.sample_rate,
                channels: format.channels as u8,
                sample_format: format.sample_format,
                send_timestamp,
                payload: frame.samples.slice(offset..end),
            });
            self.next_sequence = self.next_sequence.wrapping_add(1);
            offset = end;
        }
        packets
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{SampleFormat, StreamFormat};
    use bytes::Bytes;
    use std::time::Duration;

    fn frame(len: usize, ts: u64) -> AudioFrame {
        let format = StreamFormat::new(48000, 2, SampleFormat::I16);
        let samples: Vec<u8> = (0..len).map(|i| i as u8).collect();
        AudioFrame::new(Bytes::from(samples), format, ts)
    }

    #[test]
    fn test_splits_on_sample_frame_boundaries() {
        let mut packetizer = Packetizer::new(7, 1400);
        let frame = frame(1920, 1_000);
        let packets = packetizer.packetize(&frame);

        assert_eq!(packets.len(), 2);
        assert_eq!(packets[0].payload.len(), 1400);
        assert_eq!(packets[1].payload.len(), 520);
        assert!(packets.iter().all(|p| p.payload.len() % 4 == 0));

        let joined: Vec<u8> = packets.iter().flat_map(|p| p.payload.to_vec()).collect();
        assert_eq!(&joined[..], &frame.samples[..]);
    }

    #[test]
    fn test_sequence_and_timestamps() {
        let mut packetizer = Packetizer::new(7, 1400);
        let packets = packetizer.packetize(&frame(1920, 1_000));

        assert_eq!(packets[0].sequence, 0);
        assert_eq!(packets[1].sequence, 1);
        assert_eq!(packets[0].send_timestamp, 1_000);
        // 350 frames at 48 kHz precede the second slice
        assert_eq!(
            packets[1].send_timestamp,
            1_000 + Duration::from_nanos(350 * 1_000_000_000 / 48000).as_nanos() as u64
        );
        assert_eq!(packetizer.next_sequence(), 2);
    }

    #[test]
    fn test_sequence_wraps() {
        let mut packetizer = Packetizer::new(1, 1400);
        packetizer.next_sequence = u32::MAX;
        let packets = packetizer.packetize(&frame(1920, 0));
        assert_eq!(packets[0].sequence, u32::MAX);
        assert_eq!(packets[1].sequence, 0);
    }
}
