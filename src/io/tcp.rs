//! Blocking TCP client
//!
//! Connects with an optional bounded wait, then exchanges raw bytes. `read`
//! with `read_until` reassembles partial segments into the exact count the
//! caller asked for; `write` is a single send with no retry on short writes.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpStream};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::error::{CommError, Result};
use crate::io::client::{Client, ClientCore, Mode, ZeroRead};
use crate::io::common::{self, is_socket_creation_failure};

/// Synchronous TCP client
///
/// All I/O on one client is serialized by its internal lock, so a client can
/// be shared between threads behind an `Arc`.
///
/// # Examples
///
/// ```no_run
/// use comms_rust::io::TcpClient;
/// use std::time::Duration;
///
/// let client = TcpClient::new();
/// client.connect("127.0.0.1", 5000, Some(Duration::from_secs(2)))?;
///
/// client.write_all(b"Hello TCP")?;
/// let mut reply = [0u8; 4];
/// client.read_exact(&mut reply)?;
/// # Ok::<(), comms_rust::error::CommError>(())
/// ```
pub struct TcpClient {
    core: ClientCore<TcpStream>,
}

impl Default for TcpClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpClient {
    /// Create a closed client
    pub fn new() -> Self {
        TcpClient {
            core: ClientCore::new(Mode::Tcp, "TCP-Client"),
        }
    }

    /// Connect to `host:port`
    ///
    /// `timeout` bounds the wait for the connection to complete, a zero
    /// timeout included; `None` blocks until the OS gives up. Every resolved address is tried in turn, IPv4
    /// first.
    ///
    /// # Errors
    ///
    /// - [`CommError::HostResolution`] - `host` did not resolve
    /// - [`CommError::SocketCreate`] - the OS could not create a socket
    /// - [`CommError::ConnectionTimeout`] - the bounded wait expired
    /// - [`CommError::Connect`] - the connection was refused or reset
    pub fn connect(&self, host: &str, port: u16, timeout: Option<Duration>) -> Result<()> {
        let endpoint = format!("{host}:{port}");
        info!(endpoint = %endpoint, ?timeout, "Connection in progress...");

        let addrs = common::resolve(host, port)?;
        let mut last_err = None;
        for addr in addrs {
            match connect_one(&addr, timeout) {
                Ok(stream) => {
                    self.core.install(stream, &endpoint);
                    return Ok(());
                }
                Err(e) => {
                    debug!(%addr, error = %e, "Connect attempt failed");
                    last_err = Some(e);
                }
            }
        }

        let err = last_err.unwrap_or_else(|| io::Error::from(io::ErrorKind::AddrNotAvailable));
        warn!(endpoint = %endpoint, error = %err, "Could not connect");
        Err(classify_connect_error(&endpoint, timeout, err))
    }

    /// Read exactly `buf.len()` bytes
    pub fn read_exact(&self, buf: &mut [u8]) -> Result<usize> {
        let n = self.read(buf, false, true)?;
        if n < buf.len() {
            return Err(io::Error::from(io::ErrorKind::UnexpectedEof).into());
        }
        Ok(n)
    }

    /// Write the whole buffer, looping over short sends
    pub fn write_all(&self, data: &[u8]) -> Result<()> {
        self.core.with_handle(|stream| {
            stream.write_all(data)?;
            stream.flush()?;
            Ok(())
        })
    }

    /// Set read timeout for receive operations
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout duration (None for blocking forever)
    pub fn set_read_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core
            .with_handle(|stream| Ok(stream.set_read_timeout(timeout)?))
    }

    /// Set write timeout for send operations
    ///
    /// # Arguments
    ///
    /// * `timeout` - Timeout duration (None for blocking forever)
    pub fn set_write_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.core
            .with_handle(|stream| Ok(stream.set_write_timeout(timeout)?))
    }

    /// Enable or disable TCP_NODELAY (Nagle's algorithm)
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        self.core.with_handle(|stream| Ok(stream.set_nodelay(nodelay)?))
    }

    /// Set the size of the TCP receive buffer (SO_RCVBUF)
    pub fn set_recv_buffer_size(&self, size: usize) -> Result<()> {
        self.core
            .with_handle(|stream| Ok(common::set_recv_buffer_size(stream, size)?))
    }

    /// Set the size of the TCP send buffer (SO_SNDBUF)
    pub fn set_send_buffer_size(&self, size: usize) -> Result<()> {
        self.core
            .with_handle(|stream| Ok(common::set_send_buffer_size(stream, size)?))
    }

    /// Get the remote peer address
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.core.with_handle(|stream| Ok(stream.peer_addr()?))
    }

    /// Get the local socket address
    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.core.with_handle(|stream| Ok(stream.local_addr()?))
    }
}

/// Shortest readiness wait; `connect_timeout` rejects a zero duration
const MIN_CONNECT_WAIT: Duration = Duration::from_millis(1);

fn connect_wait(timeout: Option<Duration>) -> Option<Duration> {
    timeout.map(|timeout| timeout.max(MIN_CONNECT_WAIT))
}

fn connect_one(addr: &SocketAddr, timeout: Option<Duration>) -> io::Result<TcpStream> {
    match connect_wait(timeout) {
        // std switches the socket to non-blocking, waits for write readiness
        // with poll(), checks SO_ERROR and restores blocking mode.
        Some(wait) => TcpStream::connect_timeout(addr, wait),
        None => TcpStream::connect(addr),
    }
}

fn classify_connect_error(endpoint: &str, timeout: Option<Duration>, err: io::Error) -> CommError {
    if is_socket_creation_failure(&err) {
        return CommError::SocketCreate(err);
    }
    match (err.kind(), timeout) {
        (io::ErrorKind::TimedOut, Some(timeout)) => CommError::ConnectionTimeout {
            addr: endpoint.to_string(),
            timeout,
        },
        _ => CommError::Connect {
            addr: endpoint.to_string(),
            source: err,
        },
    }
}

/// Convert the trait-level `flags` argument into a connect timeout
///
/// `-1` (or any negative value) blocks indefinitely. Zero still bounds the
/// wait, so a connect that does not complete at once times out.
pub(crate) fn timeout_from_flags(flags: i32) -> Option<Duration> {
    u64::try_from(flags).ok().map(Duration::from_secs)
}

impl Client for TcpClient {
    fn mode(&self) -> Mode {
        self.core.mode()
    }

    fn label(&self) -> String {
        self.core.label()
    }

    fn open(&self, address: &str, option: u32, flags: i32) -> Result<()> {
        let port = u16::try_from(option).map_err(|_| {
            CommError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("port {option} out of range"),
            ))
        })?;
        self.connect(address, port, timeout_from_flags(flags))
    }

    fn close(&self) -> Result<()> {
        let _ = self
            .core
            .with_handle(|stream| Ok(stream.shutdown(Shutdown::Both)?));
        self.core.close();
        Ok(())
    }

    fn read(&self, buf: &mut [u8], has_crc: bool, read_until: bool) -> Result<usize> {
        self.core
            .read_frame(buf, has_crc, read_until, ZeroRead::Eof, |stream, chunk| {
                stream.read(chunk)
            })
    }

    fn write(&self, data: &[u8], add_crc: bool) -> Result<usize> {
        self.core
            .write_frame(data, add_crc, |stream, frame| stream.write(frame))
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_timeout_from_flags() {
        assert_eq!(timeout_from_flags(-1), None);
        assert_eq!(timeout_from_flags(2), Some(Duration::from_secs(2)));
        assert_eq!(timeout_from_flags(0), Some(Duration::ZERO));
    }

    #[test]
    fn test_zero_timeout_still_bounds_connect() {
        assert_eq!(connect_wait(None), None);
        assert_eq!(connect_wait(Some(Duration::ZERO)), Some(MIN_CONNECT_WAIT));
        assert_eq!(
            connect_wait(Some(Duration::from_secs(3))),
            Some(Duration::from_secs(3))
        );
    }

    #[test]
    fn test_open_with_zero_timeout_flags() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let client = TcpClient::new();
        let start = Instant::now();
        let result = client.open("127.0.0.1", u32::from(port), 0);
        assert!(start.elapsed() < Duration::from_secs(1));
        match result {
            Ok(()) => assert!(client.is_connected()),
            Err(err) => assert!(matches!(
                err,
                CommError::ConnectionTimeout { timeout, .. } if timeout.is_zero()
            )),
        }

        let refused = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let start = Instant::now();
        let err = TcpClient::new()
            .open("127.0.0.1", u32::from(refused), 0)
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(1));
        assert!(matches!(
            err,
            CommError::Connect { .. } | CommError::ConnectionTimeout { .. }
        ));
    }

    #[test]
    fn test_io_before_connect() {
        let client = TcpClient::new();
        assert!(!client.is_connected());
        let err = client.write(b"x", false).unwrap_err();
        assert!(matches!(err, CommError::NotConnected));
    }

    #[test]
    fn test_connect_and_exchange() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let server = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let client = TcpClient::new();
        client
            .connect("127.0.0.1", port, Some(Duration::from_secs(2)))
            .unwrap();
        assert!(client.is_connected());
        assert_eq!(client.label(), format!("TCP-Client - 127.0.0.1:{port}"));

        client.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        assert_eq!(client.read_exact(&mut reply).unwrap(), 4);
        assert_eq!(&reply, b"ping");

        server.join().unwrap();
        client.close().unwrap();
        client.close().unwrap();
        assert!(!client.is_connected());
    }

    #[test]
    fn test_refused_connection_is_prompt() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };

        let start = Instant::now();
        let err = TcpClient::new()
            .connect("127.0.0.1", port, Some(Duration::from_secs(1)))
            .unwrap_err();
        assert!(start.elapsed() < Duration::from_secs(2));
        assert!(matches!(
            err,
            CommError::Connect { .. } | CommError::ConnectionTimeout { .. }
        ));
    }
}
