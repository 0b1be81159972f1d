//! UDP client addressing one fixed peer
//!
//! The socket is never connected at the OS level: `connect` only resolves and
//! stores the peer address, so it succeeds even when nothing is listening.
//!
//! # Important Notes
//!
//! - **No delivery guarantee**: datagrams may be lost, duplicated or reordered
//! - **MTU limitation**: a single datagram carries at most 65507 bytes
//! - **Weak `read_until`**: chunks are accumulated without checking which
//!   address sent them, so a datagram from a third party can be mistaken for
//!   a continuation

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};
use std::time::Duration;

use tracing::{debug, info};

use crate::error::{CommError, Result};
use crate::io::client::{Client, ClientCore, Mode, ZeroRead};
use crate::io::common;

/// Maximum UDP datagram size (IPv4 max - IP header - UDP header)
/// 65535 (max IP packet) - 20 (IP header) - 8 (UDP header) = 65507 bytes
pub const MAX_UDP_DATAGRAM_SIZE: usize = 65507;

/// Socket plus the peer every datagram is exchanged with
pub(crate) struct UdpLink {
    socket: UdpSocket,
    peer: SocketAddr,
}

/// UDP client for exchanging datagrams with one peer
///
/// # Examples
///
/// ```no_run
/// use comms_rust::io::{Client, UdpClient};
/// use std::time::Duration;
///
/// let client = UdpClient::new();
/// client.connect("127.0.0.1", 5001)?;
/// client.set_read_timeout(Some(Duration::from_secs(1)))?;
///
/// client.write(b"ping", false)?;
/// let mut reply = [0u8; 4];
/// client.read(&mut reply, false, false)?;
/// # Ok::<(), comms_rust::error::CommError>(())
/// ```
pub struct UdpClient {
    core: ClientCore<UdpLink>,
}

impl Default for UdpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl UdpClient {
    /// Create a closed client
    pub fn new() -> Self {
        UdpClient {
            core: ClientCore::new(Mode::Udp, "UDP-Client"),
        }
    }

    /// Resolve `host:port` and bind an ephemeral local socket
    ///
    /// Never waits for the peer: UDP has no handshake.
    ///
    /// # Errors
    ///
    /// - [`CommError::HostResolution`] - `host` did not resolve
    /// - [`CommError::SocketCreate`] - the local socket could not be bound
    pub fn connect(&self, host: &str, port: u16) -> Result<()> {
        let peer = common::resolve(host, port)?[0];
        let local: SocketAddr = if peer.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = UdpSocket::bind(local).map_err(CommError::SocketCreate)?;
        info!(%peer, "UDP socket is setup");

        self.core
            .install(UdpLink { socket, peer }, &format!("{host}:{port}"));
        Ok(())
    }

    /// Resolved peer address
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.core.with_handle(|link| Ok(link.peer))
    }

    /// Local socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.core.with_handle(|link| Ok(link.socket.local_addr()?))
    }

    /// Set read timeout
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout duration (None for blocking forever)
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core
            .with_handle(|link| Ok(link.socket.set_read_timeout(timeout)?))
    }

    /// Set write timeout
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout duration (None for blocking forever)
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core
            .with_handle(|link| Ok(link.socket.set_write_timeout(timeout)?))
    }
}

impl Client for UdpClient {
    fn mode(&self) -> Mode {
        self.core.mode()
    }

    fn label(&self) -> String {
        self.core.label()
    }

    fn open(&self, address: &str, option: u32, _flags: i32) -> Result<()> {
        let port = u16::try_from(option).map_err(|_| {
            CommError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("port {option} out of range"),
            ))
        })?;
        self.connect(address, port)
    }

    fn close(&self) -> Result<()> {
        self.core.close();
        Ok(())
    }

    fn read(&self, buf: &mut [u8], has_crc: bool, read_until: bool) -> Result<usize> {
        self.core
            .read_frame(buf, has_crc, read_until, ZeroRead::Retry, |link, chunk| {
                let (n, from) = link.socket.recv_from(chunk)?;
                if from != link.peer {
                    debug!(%from, peer = %link.peer, "Datagram from unexpected sender");
                }
                Ok(n)
            })
    }

    fn write(&self, data: &[u8], add_crc: bool) -> Result<usize> {
        self.core.write_frame(data, add_crc, |link, frame| {
            if frame.len() > MAX_UDP_DATAGRAM_SIZE {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!(
                        "datagram of {} bytes exceeds {} bytes",
                        frame.len(),
                        MAX_UDP_DATAGRAM_SIZE
                    ),
                ));
            }
            link.socket.send_to(frame, link.peer)
        })
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}
