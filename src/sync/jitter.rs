//! Per-endpoint jitter buffer
//!
//! Packets are keyed by an extended (64-bit) sequence number so ordering
//! survives the 32-bit wrap. A cursor tracks the next sequence due for
//! playout:
//!
//! - packets behind the cursor once playout has started are dropped as late
//! - a gap at the cursor is skipped after one buffer depth worth of time, or
//!   as soon as the packet after the gap is itself due, and counted as a
//!   single dropout
//! - when the buffer stays empty past the watchdog the cursor is released
//!   and re-seeded by the next arrival
//!
//! All times are session-clock nanoseconds passed in by the caller.

use serde::Serialize;
use std::collections::BTreeMap;

use crate::config::JitterConfig;
use crate::protocol::Packet;
use crate::sync::playout::Schedule;

/// Packet duration assumed before the first packet is seen
const DEFAULT_PACKET_NS: u64 = 10_000_000;

/// Arrival samples kept for the playout clock between drains
const MAX_ARRIVAL_SAMPLES: usize = 256;

/// Result of offering a packet to the buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushOutcome {
    Buffered,
    /// Behind the playout cursor
    Late,
    /// Already buffered
    Duplicate,
    /// From a stream other than the one being followed
    ForeignStream,
    /// Buffered, but the oldest entries were evicted to stay within bounds
    Overrun { evicted: usize },
}

/// Jitter buffer counters
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct JitterStats {
    pub buffered: usize,
    pub received: u64,
    pub released: u64,
    pub late_drops: u64,
    pub duplicates: u64,
    pub foreign: u64,
    /// Skip and overrun events
    pub dropouts: u64,
    /// Sequence numbers never released
    pub lost_packets: u64,
    pub overruns: u64,
    pub resyncs: u64,
}

pub struct JitterBuffer {
    packets: BTreeMap<u64, Packet>,
    next_expected: Option<u64>,
    started: bool,
    stream_id: Option<u16>,
    previous_stream: Option<u16>,
    highest: Option<u64>,
    last_released: Option<u64>,
    target_depth: usize,
    max_depth: usize,
    watchdog_ns: u64,
    last_accepted_ns: Option<u64>,
    gap_since: Option<u64>,
    packet_ns: u64,
    arrivals: Vec<(u64, u64)>,
    stats: JitterStats,
}

impl JitterBuffer {
    pub fn new(config: &JitterConfig) -> Self {
        Self {
            packets: BTreeMap::new(),
            next_expected: None,
            started: false,
            stream_id: None,
            previous_stream: None,
            highest: None,
            last_released: None,
            target_depth: config.target_depth.max(1),
            max_depth: config.max_depth.max(1),
            watchdog_ns: config.watchdog().as_nanos() as u64,
            last_accepted_ns: None,
            gap_since: None,
            packet_ns: DEFAULT_PACKET_NS,
            arrivals: Vec::new(),
            stats: JitterStats::default(),
        }
    }

    /// Stream currently followed
    pub fn stream_id(&self) -> Option<u16> {
        self.stream_id
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn stats(&self) -> JitterStats {
        JitterStats {
            buffered: self.packets.len(),
            ..self.stats.clone()
        }
    }

    /// Time a gap may stay open before it is skipped
    pub fn grace_ns(&self) -> u64 {
        self.target_depth as u64 * self.packet_ns
    }

    /// Drop all state tied to the current stream and follow `stream_id` (or
    /// whichever stream arrives next). Counters are kept.
    pub fn reset(&mut self, stream_id: Option<u16>) {
        self.packets.clear();
        self.next_expected = None;
        self.started = false;
        self.stream_id = stream_id;
        self.previous_stream = None;
        self.highest = None;
        self.last_released = None;
        self.gap_since = None;
        self.arrivals.clear();
    }

    /// (send timestamp, arrival) pairs accepted since the last call
    pub fn take_arrival_samples(&mut self) -> Vec<(u64, u64)> {
        std::mem::take(&mut self.arrivals)
    }

    fn extend(&self, sequence: u32) -> u64 {
        match self.next_expected.or(self.highest) {
            Some(reference) => {
                let diff = sequence.wrapping_sub(reference as u32) as i32;
                (reference as i64 + diff as i64).max(0) as u64
            }
            None => (1u64 << 32) + sequence as u64,
        }
    }

    fn resync(&mut self) {
        self.next_expected = None;
        self.started = false;
        self.gap_since = None;
        self.previous_stream = self.stream_id.take();
        self.stats.resyncs += 1;
        tracing::debug!("Jitter buffer idle past watchdog, resynchronizing");
    }

    /// Offer an arriving packet
    pub fn push(&mut self, packet: Packet, arrival_ns: u64) -> PushOutcome {
        self.stats.received += 1;

        if self.packets.is_empty() {
            if let Some(last) = self.last_accepted_ns {
                if arrival_ns.saturating_sub(last) >= self.watchdog_ns && self.next_expected.is_some() {
                    self.resync();
                }
            }
        }

        match self.stream_id {
            Some(id) if id != packet.stream_id => {
                self.stats.foreign += 1;
                return PushOutcome::ForeignStream;
            }
            Some(_) => {}
            None => {
                if self.previous_stream != Some(packet.stream_id) {
                    self.highest = None;
                    self.last_released = None;
                }
                self.stream_id = Some(packet.stream_id);
            }
        }

        let ext = self.extend(packet.sequence);

        let behind_cursor = self.started && self.next_expected.is_some_and(|next| ext < next);
        let already_played = self.last_released.is_some_and(|released| ext <= released);
        if behind_cursor || already_played {
            self.stats.late_drops += 1;
            tracing::trace!("Late packet {} dropped", packet.sequence);
            return PushOutcome::Late;
        }

        if self.packets.contains_key(&ext) {
            self.stats.duplicates += 1;
            return PushOutcome::Duplicate;
        }

        // Before playout starts an earlier packet may still arrive
        match self.next_expected {
            Some(next) if ext >= next => {}
            _ => self.next_expected = Some(ext),
        }

        if !packet.payload.is_empty() {
            self.packet_ns = packet.duration().as_nanos() as u64;
        }
        if self.arrivals.len() < MAX_ARRIVAL_SAMPLES {
            self.arrivals.push((packet.send_timestamp, arrival_ns));
        }
        self.highest = Some(self.highest.map_or(ext, |h| h.max(ext)));
        self.last_accepted_ns = Some(arrival_ns);
        self.packets.insert(ext, packet);

        if self.packets.len() > self.max_depth {
            return self.evict_overflow();
        }
        PushOutcome::Buffered
    }

    fn evict_overflow(&mut self) -> PushOutcome {
        let mut evicted = 0;
        while self.packets.len() > self.max_depth {
            if let Some((key, _)) = self.packets.pop_first() {
                let cursor = self.next_expected.unwrap_or(key);
                self.stats.lost_packets += key.saturating_sub(cursor) + 1;
                self.next_expected = Some(key + 1);
                evicted += 1;
            }
        }
        if let Some(&first) = self.packets.keys().next() {
            let cursor = self.next_expected.unwrap_or(first);
            self.stats.lost_packets += first.saturating_sub(cursor);
            self.next_expected = Some(first);
        }
        self.gap_since = None;
        self.stats.overruns += evicted as u64;
        self.stats.dropouts += 1;
        tracing::debug!("Jitter buffer overrun, evicted {} packets", evicted);
        PushOutcome::Overrun { evicted }
    }

    /// Release the next packet if its playout instant has arrived
    pub fn pop_ready<S: Schedule + ?Sized>(&mut self, now_ns: u64, schedule: &S) -> Option<Packet> {
        let next = self.next_expected?;
        let (&first, head) = self.packets.first_key_value()?;
        let head_due = schedule.due_at(head.send_timestamp) <= now_ns as i64;

        if first == next {
            if !head_due {
                return None;
            }
            let packet = self.packets.pop_first().map(|(_, p)| p)?;
            self.next_expected = Some(next + 1);
            self.last_released = Some(next);
            self.started = true;
            self.gap_since = None;
            self.stats.released += 1;
            return Some(packet);
        }

        // Gap at the cursor
        let since = *self.gap_since.get_or_insert(now_ns);
        if head_due || now_ns.saturating_sub(since) >= self.grace_ns() {
            let missing = first - next;
            self.stats.dropouts += 1;
            self.stats.lost_packets += missing;
            self.next_expected = Some(first);
            self.gap_since = None;
            tracing::debug!("Dropout: skipped {} missing packets", missing);
            return self.pop_ready(now_ns, schedule);
        }
        None
    }

    /// Session time at which `pop_ready` may next return something
    pub fn next_wake<S: Schedule + ?Sized>(&self, schedule: &S) -> Option<i64> {
        let next = self.next_expected?;
        let (&first, head) = self.packets.first_key_value()?;
        let due = schedule.due_at(head.send_timestamp);
        if first == next {
            return Some(due);
        }
        match self.gap_since {
            Some(since) => Some(due.min((since + self.grace_ns()) as i64)),
            None => Some(i64::MIN),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketKind, SampleFormat};
    use bytes::Bytes;
    use proptest::prelude::*;

    const MS: u64 = 1_000_000;

    fn config(target_depth: usize, max_depth: usize) -> JitterConfig {
        JitterConfig {
            target_depth,
            max_depth,
            watchdog_ms: 500,
        }
    }

    /// 10 ms of 48 kHz mono I16
    fn packet(sequence: u32) -> Packet {
        Packet {
            kind: PacketKind::Audio,
            stream_id: 1,
            sequence,
            sample_rate: 48000,
            channels: 1,
            sample_format: SampleFormat::I16,
            send_timestamp: sequence as u64 * 10 * MS,
            payload: Bytes::from(vec![0u8; 960]),
        }
    }

    /// Due exactly at the send timestamp
    fn immediate(send: u64) -> i64 {
        send as i64
    }

    fn always(_: u64) -> i64 {
        i64::MIN
    }

    fn drain(buffer: &mut JitterBuffer, now: u64) -> Vec<u32> {
        let mut out = Vec::new();
        while let Some(p) = buffer.pop_ready(now, &always) {
            out.push(p.sequence);
        }
        out
    }

    #[test]
    fn test_reorders() {
        let mut buffer = JitterBuffer::new(&config(4, 64));
        for seq in [2, 0, 3, 1] {
            assert_eq!(buffer.push(packet(seq), 0), PushOutcome::Buffered);
        }
        assert_eq!(drain(&mut buffer, 0), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_waits_for_due_time() {
        let mut buffer = JitterBuffer::new(&config(4, 64));
        buffer.push(packet(5), 0);

        assert!(buffer.pop_ready(49 * MS, &immediate).is_none());
        assert_eq!(buffer.next_wake(&immediate), Some(50 * MS as i64));
        assert_eq!(buffer.pop_ready(50 * MS, &immediate).unwrap().sequence, 5);
    }

    #[test]
    fn test_late_packet_dropped() {
        let mut buffer = JitterBuffer::new(&config(4, 64));
        buffer.push(packet(10), 0);
        buffer.push(packet(11), 0);
        assert_eq!(drain(&mut buffer, 0), vec![10, 11]);

        assert_eq!(buffer.push(packet(9), 0), PushOutcome::Late);
        assert_eq!(buffer.push(packet(11), 0), PushOutcome::Late);
        assert_eq!(buffer.stats().late_drops, 2);
    }

    #[test]
    fn test_duplicate_ignored() {
        let mut buffer = JitterBuffer::new(&config(4, 64));
        buffer.push(packet(1), 0);
        assert_eq!(buffer.push(packet(1), 0), PushOutcome::Duplicate);
        assert_eq!(drain(&mut buffer, 0), vec![1]);
    }

    #[test]
    fn test_single_gap_skipped_after_grace() {
        // Grace: 4 packets of 10 ms
        let mut buffer = JitterBuffer::new(&config(4, 64));
        let schedule = |send: u64| send as i64 + 1_000 * MS as i64;
        for seq in [0, 1, 2, 4, 5, 6] {
            buffer.push(packet(seq), 0);
        }

        let mut released = Vec::new();
        let mut now = 1_000 * MS;
        while now <= 1_200 * MS {
            while let Some(p) = buffer.pop_ready(now, &schedule) {
                released.push(p.sequence);
            }
            now += MS;
        }

        assert_eq!(released, vec![0, 1, 2, 4, 5, 6]);
        let stats = buffer.stats();
        assert_eq!(stats.dropouts, 1);
        assert_eq!(stats.lost_packets, 1);
    }

    #[test]
    fn test_gap_waits_while_next_packet_not_due() {
        let mut buffer = JitterBuffer::new(&config(4, 64));
        buffer.push(packet(0), 0);
        buffer.push(packet(2), 0);
        let far = |_: u64| i64::MAX;
        let soon = |_: u64| 0i64;

        assert_eq!(buffer.pop_ready(0, &soon).unwrap().sequence, 0);
        // Gap opened at 0; grace is 40 ms and the head is not due
        assert!(buffer.pop_ready(0, &far).is_none());
        assert!(buffer.pop_ready(39 * MS, &far).is_none());
        assert_eq!(buffer.next_wake(&far), Some(40 * MS as i64));

        // Missing packet shows up inside the grace period
        assert_eq!(buffer.push(packet(1), 39 * MS), PushOutcome::Buffered);
        assert_eq!(drain(&mut buffer, 40 * MS), vec![1, 2]);
        assert_eq!(buffer.stats().dropouts, 0);
    }

    #[test]
    fn test_overrun_evicts_oldest() {
        let mut buffer = JitterBuffer::new(&config(2, 4));
        for seq in 0..4 {
            buffer.push(packet(seq), 0);
        }
        assert_eq!(
            buffer.push(packet(4), 0),
            PushOutcome::Overrun { evicted: 1 }
        );
        assert_eq!(buffer.len(), 4);
        assert_eq!(drain(&mut buffer, 0), vec![1, 2, 3, 4]);

        let stats = buffer.stats();
        assert_eq!(stats.overruns, 1);
        assert_eq!(stats.dropouts, 1);
        assert_eq!(stats.lost_packets, 1);
    }

    #[test]
    fn test_watchdog_resyncs_cursor() {
        let mut buffer = JitterBuffer::new(&config(4, 64));
        buffer.push(packet(100), 0);
        assert_eq!(drain(&mut buffer, 0), vec![100]);

        // Sender jumped far ahead after a long silence
        assert_eq!(buffer.push(packet(5000), 600 * MS), PushOutcome::Buffered);
        assert_eq!(buffer.stats().resyncs, 1);
        assert_eq!(drain(&mut buffer, 600 * MS), vec![5000]);
        assert_eq!(buffer.stats().dropouts, 0);

        // Already played packets stay late after a resync
        assert_eq!(buffer.push(packet(100), 2_000 * MS), PushOutcome::Late);
    }

    #[test]
    fn test_sequence_wrap() {
        let mut buffer = JitterBuffer::new(&config(4, 64));
        for seq in [u32::MAX - 1, 0, u32::MAX, 1] {
            buffer.push(packet(seq), 0);
        }
        assert_eq!(drain(&mut buffer, 0), vec![u32::MAX - 1, u32::MAX, 0, 1]);
    }

    #[test]
    fn test_stream_lock() {
        let mut buffer = JitterBuffer::new(&config(4, 64));
        buffer.push(packet(0), 0);

        let mut other = packet(1);
        other.stream_id = 2;
        assert_eq!(buffer.push(other.clone(), 0), PushOutcome::ForeignStream);

        buffer.reset(Some(2));
        assert_eq!(buffer.push(other, 0), PushOutcome::Buffered);
        assert_eq!(drain(&mut buffer, 0), vec![1]);
    }

    #[test]
    fn test_arrival_samples_drained() {
        let mut buffer = JitterBuffer::new(&config(4, 64));
        buffer.push(packet(3), 77);
        assert_eq!(buffer.take_arrival_samples(), vec![(30 * MS, 77)]);
        assert!(buffer.take_arrival_samples().is_empty());
    }

    proptest! {
        #[test]
        fn prop_release_order_is_strict(
            ops in prop::collection::vec((0u32..48, any::<bool>()), 1..300)
        ) {
            let mut buffer = JitterBuffer::new(&config(4, 32));
            let mut released: Vec<u32> = Vec::new();

            for (seq, pop) in ops {
                buffer.push(packet(seq), 0);
                if pop {
                    if let Some(p) = buffer.pop_ready(0, &always) {
                        released.push(p.sequence);
                    }
                }
            }
            released.extend(drain(&mut buffer, 0));

            for pair in released.windows(2) {
                prop_assert!(pair[0] < pair[1]);
            }
        }
    }
}
