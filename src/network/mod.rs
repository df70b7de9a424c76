//! Network subsystem for UDP audio transport

pub mod receiver;
pub mod sender;
pub mod udp;

pub use receiver::{Received, ReceiverStats, UdpReceiver};
pub use sender::{FanoutSender, SenderStats};
pub use udp::{create_socket, SocketOptions};
