//! Fan-out sender
//!
//! One socket serves every destination. A packet is encoded once and then
//! handed to the kernel per destination; a failing destination is counted
//! and skipped, it never delays the others.

use bytes::BytesMut;
use serde::Serialize;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::NetworkConfig;
use crate::constants::MAX_PACKET_SIZE;
use crate::error::NetworkError;
use crate::network::udp::{create_socket, SocketOptions};
use crate::protocol::{ControlMessage, Packet};

/// Sender statistics snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct SenderStats {
    pub packets_sent: u64,
    pub datagrams_sent: u64,
    pub bytes_sent: u64,
    pub send_errors: u64,
    pub control_sent: u64,
}

#[derive(Debug, Default)]
struct Counters {
    packets_sent: AtomicU64,
    datagrams_sent: AtomicU64,
    bytes_sent: AtomicU64,
    send_errors: AtomicU64,
    control_sent: AtomicU64,
}

/// Non-blocking UDP sender shared by the send lane and control paths
pub struct FanoutSender {
    socket: UdpSocket,
    counters: Counters,
}

impl FanoutSender {
    /// Bind the sending socket on an ephemeral port of `config.bind_address`
    pub fn new(config: &NetworkConfig) -> Result<Self, NetworkError> {
        let addr = SocketAddr::new(config.bind_address, 0);
        let socket = create_socket(addr, &SocketOptions::sender(config))?;
        tracing::debug!("Fan-out sender bound to {:?}", socket.local_addr());
        Ok(Self {
            socket,
            counters: Counters::default(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    /// Send `packet` to every destination. Returns how many destinations
    /// accepted the datagram.
    pub fn send<'a, I>(&self, packet: &Packet, destinations: I) -> Result<usize, NetworkError>
    where
        I: IntoIterator<Item = &'a SocketAddr>,
    {
        let len = packet.encoded_len();
        if len > MAX_PACKET_SIZE {
            return Err(NetworkError::PacketTooLarge(len));
        }

        let mut buf = BytesMut::with_capacity(len);
        packet.encode(&mut buf);

        let mut delivered = 0;
        for dest in destinations {
            if self.send_datagram(&buf, *dest) {
                delivered += 1;
            }
        }
        self.counters.packets_sent.fetch_add(1, Ordering::Relaxed);
        Ok(delivered)
    }

    /// Send a single packet to one destination
    pub fn send_to(&self, packet: &Packet, dest: SocketAddr) -> Result<bool, NetworkError> {
        self.send(packet, std::iter::once(&dest)).map(|n| n == 1)
    }

    /// Send a control message to one destination
    pub fn send_control(&self, message: &ControlMessage, dest: SocketAddr) -> Result<(), NetworkError> {
        let bytes = message.to_bytes()?;
        self.socket
            .send_to(&bytes, dest)
            .map_err(|e| {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                NetworkError::SendFailed(format!("{}: {}", dest, e))
            })?;
        self.counters.control_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn send_datagram(&self, data: &[u8], dest: SocketAddr) -> bool {
        match self.socket.send_to(data, dest) {
            Ok(n) => {
                self.counters.datagrams_sent.fetch_add(1, Ordering::Relaxed);
                self.counters.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
                true
            }
            Err(e) => {
                // WouldBlock lands here too: a full socket buffer drops the datagram
                let errors = self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                if errors % 100 == 0 {
                    tracing::debug!("Send to {} failed: {}", dest, e);
                }
                false
            }
        }
    }

    pub fn stats(&self) -> SenderStats {
        SenderStats {
            packets_sent: self.counters.packets_sent.load(Ordering::Relaxed),
            datagrams_sent: self.counters.datagrams_sent.load(Ordering::Relaxed),
            bytes_sent: self.counters.bytes_sent.load(Ordering::Relaxed),
            send_errors: self.counters.send_errors.load(Ordering::Relaxed),
            control_sent: self.counters.control_sent.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{PacketKind, SampleFormat};
    use bytes::Bytes;
    use std::time::Duration;

    fn loopback_config() -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            ..NetworkConfig::default()
        }
    }

    fn packet(payload_len: usize) -> Packet {
        Packet {
            kind: PacketKind::Audio,
            stream_id: 1,
            sequence: 9,
            sample_rate: 48000,
            channels: 2,
            sample_format: SampleFormat::I16,
            send_timestamp: 1,
            payload: Bytes::from(vec![0u8; payload_len]),
        }
    }

    fn listener() -> UdpSocket {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        socket
    }

    #[test]
    fn test_fans_out_to_every_destination() {
        let sender = FanoutSender::new(&loopback_config()).unwrap();
        let a = listener();
        let b = listener();
        let dests = [a.local_addr().unwrap(), b.local_addr().unwrap()];

        let delivered = sender.send(&packet(8), &dests).unwrap();
        assert_eq!(delivered, 2);

        let mut buf = [0u8; 64];
        for socket in [&a, &b] {
            let (n, _) = socket.recv_from(&mut buf).unwrap();
            assert_eq!(Packet::decode(&buf[..n]).unwrap().sequence, 9);
        }

        let stats = sender.stats();
        assert_eq!(stats.packets_sent, 1);
        assert_eq!(stats.datagrams_sent, 2);
    }

    #[test]
    fn test_oversized_packet_rejected() {
        let sender = FanoutSender::new(&loopback_config()).unwrap();
        let dest = listener().local_addr().unwrap();
        assert!(matches!(
            sender.send_to(&packet(MAX_PACKET_SIZE), dest),
            Err(NetworkError::PacketTooLarge(_))
        ));
    }

    #[test]
    fn test_control_message_delivery() {
        let sender = FanoutSender::new(&loopback_config()).unwrap();
        let socket = listener();
        let msg = ControlMessage::SetVolume { volume: 0.25 };
        sender.send_control(&msg, socket.local_addr().unwrap()).unwrap();

        let mut buf = [0u8; 64];
        let (n, _) = socket.recv_from(&mut buf).unwrap();
        assert_eq!(ControlMessage::decode(&buf[..n]).unwrap(), msg);
    }
}
