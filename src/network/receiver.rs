//! Datagram receiver for a single endpoint
//!
//! Reads block for at most one poll interval so the owning lane can notice
//! cancellation promptly. Cancellation is signalled by dropping (or sending
//! on) the shutdown channel handed in at construction.

use crossbeam_channel::{Receiver, TryRecvError};
use serde::Serialize;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::NetworkConfig;
use crate::error::NetworkError;
use crate::network::udp::{create_socket, SocketOptions};
use crate::protocol::Datagram;

/// Largest datagram accepted; anything bigger is truncated and rejected
const RECV_BUFFER_SIZE: usize = 65536;

/// A decoded datagram with its arrival instant
#[derive(Debug, Clone)]
pub struct Received {
    pub datagram: Datagram,
    pub from: SocketAddr,
    pub arrived: Instant,
}

/// Receiver statistics
#[derive(Debug, Clone, Default, Serialize)]
pub struct ReceiverStats {
    pub datagrams: u64,
    pub bytes: u64,
    pub invalid: u64,
    pub timeouts: u64,
}

pub struct UdpReceiver {
    socket: UdpSocket,
    buf: Vec<u8>,
    liveness_timeout: Duration,
    shutdown: Receiver<()>,
    last_datagram: Instant,
    stats: ReceiverStats,
    /// Shared so the owner can publish it while `recv` is blocked
    invalid: Arc<AtomicU64>,
}

impl UdpReceiver {
    /// Bind a receive socket on `addr`
    pub fn bind(
        addr: SocketAddr,
        config: &NetworkConfig,
        shutdown: Receiver<()>,
    ) -> Result<Self, NetworkError> {
        let socket = create_socket(addr, &SocketOptions::receiver(config))?;
        tracing::debug!("Receiver bound to {:?}", socket.local_addr());
        Ok(Self::from_socket(socket, config.liveness_timeout(), shutdown))
    }

    /// Wrap an already configured socket. Its read timeout must be set.
    pub fn from_socket(socket: UdpSocket, liveness_timeout: Duration, shutdown: Receiver<()>) -> Self {
        Self {
            socket,
            buf: vec![0u8; RECV_BUFFER_SIZE],
            liveness_timeout,
            shutdown,
            last_datagram: Instant::now(),
            stats: ReceiverStats::default(),
            invalid: Arc::default(),
        }
    }

    /// Count rejected datagrams into `counter` instead of a private one
    pub fn count_invalid_into(mut self, counter: Arc<AtomicU64>) -> Self {
        counter.fetch_add(self.invalid.load(Ordering::Relaxed), Ordering::Relaxed);
        self.invalid = counter;
        self
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        self.socket
            .local_addr()
            .map_err(|e| NetworkError::BindFailed(e.to_string()))
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            invalid: self.invalid.load(Ordering::Relaxed),
            ..self.stats.clone()
        }
    }

    /// Block until a valid datagram arrives.
    ///
    /// Fails with `Timeout` after `liveness_timeout` without traffic (the
    /// timer then restarts) and with `Closed` once cancelled. Foreign or
    /// malformed datagrams are counted and skipped.
    pub fn recv(&mut self) -> Result<Received, NetworkError> {
        loop {
            match self.shutdown.try_recv() {
                Ok(()) | Err(TryRecvError::Disconnected) => return Err(NetworkError::Closed),
                Err(TryRecvError::Empty) => {}
            }

            match self.socket.recv_from(&mut self.buf) {
                Ok((len, from)) => {
                    let arrived = Instant::now();
                    self.stats.datagrams += 1;
                    self.stats.bytes += len as u64;

                    match Datagram::decode(&self.buf[..len]) {
                        Ok(datagram) => {
                            self.last_datagram = arrived;
                            return Ok(Received {
                                datagram,
                                from,
                                arrived,
                            });
                        }
                        Err(e) => {
                            self.invalid.fetch_add(1, Ordering::Relaxed);
                            tracing::trace!("Dropping datagram from {}: {}", from, e);
                        }
                    }
                }
                Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                    if self.last_datagram.elapsed() >= self.liveness_timeout {
                        self.last_datagram = Instant::now();
                        self.stats.timeouts += 1;
                        return Err(NetworkError::Timeout);
                    }
                }
                // Windows reports ICMP port unreachable from an earlier send here
                Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {}
                Err(e) => return Err(NetworkError::ReceiveFailed(e.to_string())),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ControlMessage;
    use crossbeam_channel::bounded;

    fn config() -> NetworkConfig {
        NetworkConfig {
            bind_address: "127.0.0.1".parse().unwrap(),
            poll_interval_ms: 10,
            liveness_timeout_ms: 100,
            ..NetworkConfig::default()
        }
    }

    fn receiver(shutdown: Receiver<()>) -> UdpReceiver {
        UdpReceiver::bind("127.0.0.1:0".parse().unwrap(), &config(), shutdown).unwrap()
    }

    #[test]
    fn test_receives_control_and_skips_garbage() {
        let (_tx, rx) = bounded(1);
        let mut receiver = receiver(rx);
        let addr = receiver.local_addr().unwrap();

        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket.send_to(b"not ours", addr).unwrap();
        let msg = ControlMessage::Goodbye { stream_id: 3 };
        socket.send_to(&msg.to_bytes().unwrap(), addr).unwrap();

        let received = receiver.recv().unwrap();
        assert!(matches!(received.datagram, Datagram::Control(ref m) if *m == msg));
        assert_eq!(receiver.stats().invalid, 1);
    }

    #[test]
    fn test_rejected_datagrams_visible_while_blocked() {
        let (tx, rx) = bounded::<()>(1);
        let counter = Arc::new(AtomicU64::new(0));
        let mut receiver = receiver(rx).count_invalid_into(counter.clone());
        let addr = receiver.local_addr().unwrap();

        let handle = std::thread::spawn(move || loop {
            match receiver.recv() {
                Err(NetworkError::Timeout) => continue,
                result => return (result, receiver.stats().invalid),
            }
        });
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        for _ in 0..5 {
            socket.send_to(b"SW\x09garbage", addr).unwrap();
        }

        let deadline = Instant::now() + Duration::from_secs(1);
        while counter.load(Ordering::Relaxed) < 5 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(counter.load(Ordering::Relaxed), 5);

        drop(tx);
        let (result, invalid) = handle.join().unwrap();
        assert!(matches!(result, Err(NetworkError::Closed)));
        assert_eq!(invalid, 5);
    }

    #[test]
    fn test_liveness_timeout() {
        let (_tx, rx) = bounded(1);
        let mut receiver = receiver(rx);

        let start = Instant::now();
        assert!(matches!(receiver.recv(), Err(NetworkError::Timeout)));
        assert!(start.elapsed() >= Duration::from_millis(100));
        assert_eq!(receiver.stats().timeouts, 1);
    }

    #[test]
    fn test_cancellation_unblocks_within_poll_interval() {
        let (tx, rx) = bounded::<()>(1);
        let mut receiver = receiver(rx);

        let handle = std::thread::spawn(move || receiver.recv());
        std::thread::sleep(Duration::from_millis(20));
        drop(tx);

        let result = handle.join().unwrap();
        assert!(matches!(result, Err(NetworkError::Closed)));
    }
}
