//! UDP socket construction
//!
//! Sockets are built with socket2 so buffer sizes, broadcast and multicast
//! can be configured before bind, then handed out as std sockets.

use socket2::{Domain, Protocol, Socket, Type};
use std::net::{Ipv4Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use crate::config::NetworkConfig;
use crate::error::NetworkError;

/// Options applied when creating a socket
#[derive(Debug, Clone, PartialEq)]
pub struct SocketOptions {
    pub send_buffer_size: usize,
    pub recv_buffer_size: usize,
    pub broadcast: bool,
    pub multicast_group: Option<Ipv4Addr>,
    pub multicast_ttl: u32,
    /// Blocking read slice; `None` leaves the socket non-blocking
    pub read_timeout: Option<Duration>,
}

impl SocketOptions {
    /// Options for the sending side: non-blocking, never waits on the kernel
    pub fn sender(config: &NetworkConfig) -> Self {
        Self {
            send_buffer_size: config.send_buffer_size,
            recv_buffer_size: config.recv_buffer_size,
            broadcast: config.broadcast,
            multicast_group: None,
            multicast_ttl: config.multicast_ttl,
            read_timeout: None,
        }
    }

    /// Options for a receive lane: reads block for at most one poll interval
    pub fn receiver(config: &NetworkConfig) -> Self {
        Self {
            send_buffer_size: config.send_buffer_size,
            recv_buffer_size: config.recv_buffer_size,
            broadcast: config.broadcast,
            multicast_group: config.multicast_group,
            multicast_ttl: config.multicast_ttl,
            read_timeout: Some(config.poll_interval()),
        }
    }
}

/// Create and bind a UDP socket
pub fn create_socket(addr: SocketAddr, options: &SocketOptions) -> Result<UdpSocket, NetworkError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    socket
        .set_reuse_address(true)
        .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

    // The kernel may clamp these; a smaller buffer is not fatal
    if let Err(e) = socket.set_send_buffer_size(options.send_buffer_size) {
        tracing::warn!("Failed to set send buffer size: {}", e);
    }
    if let Err(e) = socket.set_recv_buffer_size(options.recv_buffer_size) {
        tracing::warn!("Failed to set receive buffer size: {}", e);
    }

    if options.broadcast {
        socket
            .set_broadcast(true)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    }

    socket
        .bind(&addr.into())
        .map_err(|e| NetworkError::BindFailed(format!("{}: {}", addr, e)))?;

    if let Some(group) = options.multicast_group {
        socket
            .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
            .map_err(|e| NetworkError::BindFailed(format!("join {}: {}", group, e)))?;
        tracing::info!("Joined multicast group {}", group);
    }
    if addr.is_ipv4() {
        socket
            .set_multicast_ttl_v4(options.multicast_ttl)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
    }

    match options.read_timeout {
        Some(timeout) => socket
            .set_read_timeout(Some(timeout))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?,
        None => socket
            .set_nonblocking(true)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?,
    }

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_ephemeral_port() {
        let options = SocketOptions::sender(&NetworkConfig::default());
        let socket = create_socket("127.0.0.1:0".parse().unwrap(), &options).unwrap();
        assert_ne!(socket.local_addr().unwrap().port(), 0);
    }

    #[test]
    fn test_receiver_socket_times_out() {
        let options = SocketOptions::receiver(&NetworkConfig::default());
        let socket = create_socket("127.0.0.1:0".parse().unwrap(), &options).unwrap();

        let mut buf = [0u8; 16];
        let err = socket.recv_from(&mut buf).unwrap_err();
        assert!(matches!(
            err.kind(),
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
        ));
    }
}
