//! Client capability shared by the serial, TCP and UDP transports
//!
//! Every transport composes a [`ClientCore`]: one mutex around the OS handle,
//! a connected flag and a [`Mode`] tag. The mutex is held for the whole of
//! each `read`/`write`, so all I/O on one client is totally ordered while
//! separate clients never contend.

use std::borrow::Cow;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use crate::error::{CommError, Result};
use crate::io::common::{is_transient, lock};
use crate::protocol::crc::{self, CRC_SIZE};

/// Transport variant of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Mode {
    /// Serial line (tty device)
    Serial,
    /// TCP stream
    Tcp,
    /// UDP datagrams to a fixed peer
    Udp,
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Mode::Serial => f.write_str("Serial"),
            Mode::Tcp => f.write_str("TCP"),
            Mode::Udp => f.write_str("UDP"),
        }
    }
}

/// Common interface over every transport
///
/// `open` takes the same three arguments on every variant:
///
/// | variant | `address` | `option` | `flags` |
/// |---|---|---|---|
/// | Serial | device path | baud rate | `O_*` access flags |
/// | TCP | host | port | connect timeout in seconds, `-1` blocks |
/// | UDP | host | port | ignored |
///
/// # Examples
///
/// ```no_run
/// use comms_rust::io::{Client, TcpClient};
///
/// let client: Box<dyn Client> = Box::new(TcpClient::new());
/// client.open("127.0.0.1", 5000, 2)?;
///
/// let mut frame = [0u8; 8];
/// client.write(b"status", true)?;
/// client.read(&mut frame, true, true)?;
/// # Ok::<(), comms_rust::error::CommError>(())
/// ```
pub trait Client: Send + Sync {
    /// Transport variant
    fn mode(&self) -> Mode;

    /// Diagnostic label (transport name plus endpoint once open)
    fn label(&self) -> String;

    /// Establish the underlying transport
    ///
    /// Replaces (and closes) any handle that was already open.
    fn open(&self, address: &str, option: u32, flags: i32) -> Result<()>;

    /// Release the OS handle; calling it on a closed client is a no-op
    fn close(&self) -> Result<()>;

    /// Read up to `buf.len()` bytes
    ///
    /// With `read_until` the call keeps receiving until the buffer is full or
    /// the transport reports end of stream or an error. With `has_crc` the
    /// last two of the received bytes are checked as the checksum of the
    /// others; a mismatch returns [`CommError::CrcMismatch`] and the received
    /// bytes stay in `buf`.
    fn read(&self, buf: &mut [u8], has_crc: bool, read_until: bool) -> Result<usize>;

    /// Write `data`, optionally followed by its 2-byte checksum
    ///
    /// Issues a single send. Stream transports may transmit fewer bytes than
    /// requested; the returned count (trailer included) tells the caller how
    /// much went out.
    fn write(&self, data: &[u8], add_crc: bool) -> Result<usize>;

    /// Whether the transport is open
    fn is_connected(&self) -> bool;
}

/// How a zero-length receive is interpreted by the read loop
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ZeroRead {
    /// The peer closed the stream
    Eof,
    /// Nothing arrived yet (serial quiet period, empty datagram)
    Retry,
}

/// State every client variant composes
pub(crate) struct ClientCore<H> {
    mode: Mode,
    label: Mutex<String>,
    handle: Mutex<Option<H>>,
    connected: AtomicBool,
}

impl<H> ClientCore<H> {
    pub(crate) fn new(mode: Mode, label: impl Into<String>) -> Self {
        ClientCore {
            mode,
            label: Mutex::new(label.into()),
            handle: Mutex::new(None),
            connected: AtomicBool::new(false),
        }
    }

    pub(crate) fn mode(&self) -> Mode {
        self.mode
    }

    pub(crate) fn label(&self) -> String {
        lock(&self.label).clone()
    }

    pub(crate) fn set_label(&self, label: impl Into<String>) {
        *lock(&self.label) = label.into();
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Acquire)
    }

    /// Adopt a freshly opened handle, dropping any previous one
    pub(crate) fn install(&self, handle: H, endpoint: &str) {
        let mut slot = lock(&self.handle);
        let label = format!("{}-Client - {}", self.mode, endpoint);
        *slot = Some(handle);
        self.connected.store(true, Ordering::Release);
        debug!(client = %label, "connected");
        self.set_label(label);
    }

    /// Drop the handle; returns whether one was open
    pub(crate) fn close(&self) -> bool {
        let mut slot = lock(&self.handle);
        self.connected.store(false, Ordering::Release);
        let was_open = slot.take().is_some();
        if was_open {
            debug!(client = %self.label(), "closed");
        }
        was_open
    }

    /// Run `f` on the open handle while holding the client's I/O lock
    pub(crate) fn with_handle<T>(&self, f: impl FnOnce(&mut H) -> Result<T>) -> Result<T> {
        let mut slot = lock(&self.handle);
        match slot.as_mut() {
            Some(handle) => f(handle),
            None => Err(CommError::NotConnected),
        }
    }

    /// Shared read contract: `read_until` reassembly, then optional CRC check
    pub(crate) fn read_frame<F>(
        &self,
        buf: &mut [u8],
        has_crc: bool,
        read_until: bool,
        zero: ZeroRead,
        mut recv: F,
    ) -> Result<usize>
    where
        F: FnMut(&mut H, &mut [u8]) -> io::Result<usize>,
    {
        let size = buf.len();
        let n = self.with_handle(|handle| {
            let mut n = 0;
            while n < size {
                match recv(handle, &mut buf[n..]) {
                    Ok(0) if zero == ZeroRead::Eof => break,
                    Ok(k) => n += k,
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    // A receive timeout after partial data reports what arrived.
                    Err(e) if n > 0 && is_transient(&e) => break,
                    Err(e) => return Err(e.into()),
                }
                if !read_until {
                    break;
                }
            }
            Ok(n)
        })?;

        trace!(client = %self.label(), requested = size, received = n, "read");

        if has_crc {
            check_frame(&buf[..n])?;
        }
        Ok(n)
    }

    /// Shared write contract: optional checksum trailer, one send
    pub(crate) fn write_frame<F>(&self, data: &[u8], add_crc: bool, send: F) -> Result<usize>
    where
        F: FnOnce(&mut H, &[u8]) -> io::Result<usize>,
    {
        let frame: Cow<'_, [u8]> = if add_crc {
            let mut framed = Vec::with_capacity(data.len() + CRC_SIZE);
            framed.extend_from_slice(data);
            crc::append_crc(&mut framed);
            Cow::Owned(framed)
        } else {
            Cow::Borrowed(data)
        };

        let sent = self.with_handle(|handle| Ok(send(handle, &frame)?))?;
        trace!(client = %self.label(), requested = frame.len(), sent, "write");
        Ok(sent)
    }
}

/// Check that the last two bytes of `frame` are the checksum of the rest
pub(crate) fn check_frame(frame: &[u8]) -> Result<()> {
    let (expected, actual) = match crc::split_frame(frame) {
        Some((payload, trailer)) => (crc::compute_crc(payload), trailer),
        None => (crc::compute_crc(frame), 0),
    };
    if frame.len() >= CRC_SIZE && expected == actual {
        Ok(())
    } else {
        Err(CommError::CrcMismatch { expected, actual })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    /// Feeds queued chunks one `recv` at a time
    struct Script(VecDeque<Vec<u8>>);

    fn recv_chunk(script: &mut Script, out: &mut [u8]) -> io::Result<usize> {
        match script.0.pop_front() {
            Some(chunk) => {
                let n = chunk.len().min(out.len());
                out[..n].copy_from_slice(&chunk[..n]);
                Ok(n)
            }
            None => Ok(0),
        }
    }

    fn scripted(chunks: &[&[u8]]) -> ClientCore<Script> {
        let core = ClientCore::new(Mode::Tcp, "TCP-Client");
        core.install(
            Script(chunks.iter().map(|c| c.to_vec()).collect()),
            "test:0",
        );
        core
    }

    #[test]
    fn test_read_until_reassembles_chunks() {
        let core = scripted(&[b"Hel", b"lo ", b"TCP"]);
        let mut buf = [0u8; 9];
        let n = core
            .read_frame(&mut buf, false, true, ZeroRead::Eof, recv_chunk)
            .unwrap();
        assert_eq!(n, 9);
        assert_eq!(&buf, b"Hello TCP");
    }

    #[test]
    fn test_single_read_returns_first_chunk() {
        let core = scripted(&[b"Hel", b"lo"]);
        let mut buf = [0u8; 5];
        let n = core
            .read_frame(&mut buf, false, false, ZeroRead::Eof, recv_chunk)
            .unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn test_read_until_stops_at_eof() {
        let core = scripted(&[b"abc"]);
        let mut buf = [0u8; 8];
        let n = core
            .read_frame(&mut buf, false, true, ZeroRead::Eof, recv_chunk)
            .unwrap();
        assert_eq!(n, 3);
    }

    #[test]
    fn test_crc_mismatch_keeps_data() {
        let mut frame = b"data".to_vec();
        crc::append_crc(&mut frame);
        let last = frame.len() - 1;
        frame[last] ^= 0xff;

        let core = scripted(&[frame.as_slice()]);
        let mut buf = [0u8; 6];
        let err = core
            .read_frame(&mut buf, true, true, ZeroRead::Eof, recv_chunk)
            .unwrap_err();
        assert!(matches!(err, CommError::CrcMismatch { .. }));
        assert_eq!(&buf[..4], b"data");
    }

    #[test]
    fn test_crc_frame_accepted() {
        let mut frame = b"data".to_vec();
        crc::append_crc(&mut frame);

        let core = scripted(&[&frame[..3], &frame[3..]]);
        let mut buf = [0u8; 6];
        let n = core
            .read_frame(&mut buf, true, true, ZeroRead::Eof, recv_chunk)
            .unwrap();
        assert_eq!(n, 6);
    }

    #[test]
    fn test_write_appends_trailer() {
        let core = scripted(&[]);
        let mut sent = Vec::new();
        let n = core
            .write_frame(b"ping", true, |_, frame| {
                sent.extend_from_slice(frame);
                Ok(frame.len())
            })
            .unwrap();
        assert_eq!(n, 6);
        assert!(crc::verify_crc(&sent));
    }

    #[test]
    fn test_io_after_close_fails() {
        let core = scripted(&[b"x"]);
        assert!(core.close());
        assert!(!core.close());
        assert!(!core.is_connected());

        let mut buf = [0u8; 1];
        let err = core
            .read_frame(&mut buf, false, false, ZeroRead::Eof, recv_chunk)
            .unwrap_err();
        assert!(matches!(err, CommError::NotConnected));
    }

    #[test]
    fn test_label_tracks_endpoint() {
        let core = scripted(&[]);
        assert_eq!(core.label(), "TCP-Client - test:0");
    }
}
