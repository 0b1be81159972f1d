//! Type-state builder for clients
//!
//! Settings that only make sense for one transport (a baud rate, a connect
//! timeout) are only offered once that transport has been chosen, so a
//! mismatched combination fails to compile instead of at run time.
//!
//! # Type-State Pattern
//!
//! - Transport state: Unspecified -> SerialConfigured, TcpConfigured or UdpConfigured
//! - `build()` exists only on configured states and returns an opened client
//!
//! # Examples
//!
//! ```no_run
//! use comms_rust::io::builder::ClientBuilder;
//! use std::time::Duration;
//!
//! let tcp = ClientBuilder::new()
//!     .tcp("127.0.0.1", 5000)
//!     .connect_timeout(Duration::from_secs(2))
//!     .nodelay(true)
//!     .build()?;
//!
//! let udp = ClientBuilder::new()
//!     .udp("127.0.0.1", 5001)
//!     .read_timeout(Duration::from_millis(500))
//!     .build()?;
//! # Ok::<(), comms_rust::error::CommError>(())
//! ```

use std::time::Duration;

use crate::error::Result;
use crate::io::client::Client;
#[cfg(target_os = "linux")]
use crate::io::serial::{OpenMode, SerialClient};
use crate::io::tcp::TcpClient;
use crate::io::udp::UdpClient;

// ============================================================================
// State Marker Types
// ============================================================================

/// No transport chosen yet
pub struct Unspecified;

/// Serial transport chosen
#[cfg(target_os = "linux")]
pub struct SerialConfigured {
    path: String,
    baud: u32,
    mode: OpenMode,
}

/// TCP transport chosen
pub struct TcpConfigured {
    host: String,
    port: u16,
    connect_timeout: Option<Duration>,
    nodelay: bool,
}

/// UDP transport chosen
pub struct UdpConfigured {
    host: String,
    port: u16,
}

// ============================================================================
// ClientBuilder - Type-State Pattern
// ============================================================================

/// Type-state builder for clients
///
/// # Type Parameters
/// * `Transport` - Transport state (Unspecified, SerialConfigured, TcpConfigured, UdpConfigured)
pub struct ClientBuilder<Transport = Unspecified> {
    transport: Transport,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
}

impl ClientBuilder<Unspecified> {
    /// Create a new client builder
    pub fn new() -> Self {
        ClientBuilder {
            transport: Unspecified,
            read_timeout: None,
            write_timeout: None,
        }
    }

    /// Use a serial device at 115200 baud, read/write
    #[cfg(target_os = "linux")]
    pub fn serial(self, path: impl Into<String>) -> ClientBuilder<SerialConfigured> {
        self.with_transport(SerialConfigured {
            path: path.into(),
            baud: 115200,
            mode: OpenMode::ReadWrite,
        })
    }

    /// Use a TCP connection
    pub fn tcp(self, host: impl Into<String>, port: u16) -> ClientBuilder<TcpConfigured> {
        self.with_transport(TcpConfigured {
            host: host.into(),
            port,
            connect_timeout: None,
            nodelay: false,
        })
    }

    /// Use UDP datagrams to a fixed peer
    pub fn udp(self, host: impl Into<String>, port: u16) -> ClientBuilder<UdpConfigured> {
        self.with_transport(UdpConfigured {
            host: host.into(),
            port,
        })
    }

    fn with_transport<T>(self, transport: T) -> ClientBuilder<T> {
        ClientBuilder {
            transport,
            read_timeout: self.read_timeout,
            write_timeout: self.write_timeout,
        }
    }
}

impl Default for ClientBuilder<Unspecified> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Serial
// ============================================================================

#[cfg(target_os = "linux")]
impl ClientBuilder<SerialConfigured> {
    /// Line rate; must be one of [`crate::io::serial::SUPPORTED_BAUD_RATES`]
    pub fn baud(mut self, baud: u32) -> Self {
        self.transport.baud = baud;
        self
    }

    /// Device access mode
    pub fn mode(mut self, mode: OpenMode) -> Self {
        self.transport.mode = mode;
        self
    }

    /// Open and configure the device
    pub fn build(self) -> Result<SerialClient> {
        let SerialConfigured { path, baud, mode } = self.transport;
        let client = SerialClient::new();
        client.open_port(&path, baud, mode)?;
        Ok(client)
    }
}

// ============================================================================
// TCP
// ============================================================================

impl ClientBuilder<TcpConfigured> {
    /// Bound the wait for the connection to complete
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport.connect_timeout = Some(timeout);
        self
    }

    /// Enable or disable TCP_NODELAY once connected
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.transport.nodelay = nodelay;
        self
    }

    /// Bound every blocking receive
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Bound every blocking send
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Connect and apply the socket options
    pub fn build(self) -> Result<TcpClient> {
        let TcpConfigured {
            host,
            port,
            connect_timeout,
            nodelay,
        } = self.transport;

        let client = TcpClient::new();
        client.connect(&host, port, connect_timeout)?;
        if nodelay {
            client.set_nodelay(true)?;
        }
        client.set_read_timeout(self.read_timeout)?;
        client.set_write_timeout(self.write_timeout)?;
        Ok(client)
    }
}

// ============================================================================
// UDP
// ============================================================================

impl ClientBuilder<UdpConfigured> {
    /// Bound every blocking receive
    pub fn read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = Some(timeout);
        self
    }

    /// Bound every blocking send
    pub fn write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = Some(timeout);
        self
    }

    /// Bind the local socket and record the peer
    pub fn build(self) -> Result<UdpClient> {
        let client = UdpClient::new();
        client.connect(&self.transport.host, self.transport.port)?;
        client.set_read_timeout(self.read_timeout)?;
        client.set_write_timeout(self.write_timeout)?;
        Ok(client)
    }
}

// ============================================================================
// Trait objects
// ============================================================================

/// Configured builders that can produce a transport-erased client
pub trait BuildClient {
    /// Open the client behind the [`Client`] trait
    fn build_boxed(self) -> Result<Box<dyn Client>>;
}

#[cfg(target_os = "linux")]
impl BuildClient for ClientBuilder<SerialConfigured> {
    fn build_boxed(self) -> Result<Box<dyn Client>> {
        Ok(Box::new(self.build()?))
    }
}

impl BuildClient for ClientBuilder<TcpConfigured> {
    fn build_boxed(self) -> Result<Box<dyn Client>> {
        Ok(Box::new(self.build()?))
    }
}

impl BuildClient for ClientBuilder<UdpConfigured> {
    fn build_boxed(self) -> Result<Box<dyn Client>> {
        Ok(Box::new(self.build()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CommError;
    use crate::io::client::Mode;
    use std::net::{TcpListener, UdpSocket};

    #[test]
    fn test_tcp_builder_connects() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = ClientBuilder::new()
            .tcp("127.0.0.1", port)
            .connect_timeout(Duration::from_secs(2))
            .nodelay(true)
            .read_timeout(Duration::from_millis(200))
            .build()
            .unwrap();
        assert!(client.is_connected());
        assert_eq!(client.mode(), Mode::Tcp);
    }

    #[test]
    fn test_udp_builder_boxed() {
        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = peer.local_addr().unwrap().port();

        let client = ClientBuilder::new()
            .udp("127.0.0.1", port)
            .read_timeout(Duration::from_millis(100))
            .build_boxed()
            .unwrap();
        assert_eq!(client.mode(), Mode::Udp);
        assert_eq!(client.write(b"hi", false).unwrap(), 2);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn test_serial_builder_rejects_baud() {
        let err = ClientBuilder::new()
            .serial("/dev/null")
            .baud(1234)
            .build()
            .unwrap_err();
        assert!(matches!(err, CommError::UnsupportedBaudRate(1234)));
    }
}
