//! Transports and servers
//!
//! Blocking clients for serial lines, TCP and UDP behind one [`Client`]
//! trait, plus thread-per-peer TCP and UDP servers built on [`Server`].

pub mod builder;
pub mod client;
mod common;
pub mod queue;
#[cfg(target_os = "linux")]
pub mod serial;
pub mod server;
pub mod tcp;
pub mod tcp_server;
pub mod udp;
pub mod udp_server;

pub use builder::{BuildClient, ClientBuilder};
pub use client::{Client, Mode};
pub use queue::{ByteQueue, QueueStats};
#[cfg(target_os = "linux")]
pub use serial::{OpenMode, SerialClient};
pub use server::{PeerSession, Server, ServerConfig, ServerCore};
pub use tcp::TcpClient;
pub use tcp_server::{PeerId, TcpPeer, TcpServer};
pub use udp::{UdpClient, MAX_UDP_DATAGRAM_SIZE};
pub use udp_server::{UdpPeer, UdpServer};
