//! Error types for transport and server operations
//!
//! Connection-setup failures (resolution, socket creation, bind, connect,
//! serial configuration) surface here and are never retried internally.
//! Transient would-block conditions inside server loops are handled where
//! they occur and never become a [`CommError`].

use std::fmt;
use std::io;
use std::time::Duration;

use thiserror::Error;

/// Communication error types
///
/// All fallible operations in this library return `Result<T, CommError>`.
#[derive(Error, Debug)]
pub enum CommError {
    /// The host name could not be resolved to any socket address
    ///
    /// # Example
    /// ```no_run
    /// # use comms_rust::error::CommError;
    /// let err = CommError::HostResolution("no-such-host.invalid".to_string());
    /// ```
    #[error("Unknown host {0}")]
    HostResolution(String),

    /// The OS refused to create a socket (descriptor limits, unsupported family)
    #[error("socket() invalid: {0}")]
    SocketCreate(#[source] io::Error),

    /// Binding a server socket failed
    ///
    /// `reason` is derived from the OS error code so callers can report why
    /// without inspecting `source` themselves.
    #[error("Failed to bind to {addr}: {reason}")]
    Bind {
        /// Address the server tried to bind
        addr: String,
        /// Classified failure reason
        reason: BindReason,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Connecting to the remote endpoint failed with a pending socket error
    #[error("Could not connect to {addr}: {source}")]
    Connect {
        /// Remote address
        addr: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// The bounded connect wait expired
    #[error("Connection to {addr} timed out after {timeout:?}")]
    ConnectionTimeout {
        /// Remote address
        addr: String,
        /// Configured connect timeout
        timeout: Duration,
    },

    /// The requested serial line rate is not in the supported whitelist
    #[error("Unsupported baud rate {0}")]
    UnsupportedBaudRate(u32),

    /// The serial device could not be opened
    #[error("Could not open the serial port {path}: {source}")]
    SerialOpen {
        /// Device path requested by the caller
        path: String,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Reading or applying the serial line settings failed
    #[error("Could not {stage} the serial port settings of {path}: {source}")]
    SerialConfig {
        /// Device path
        path: String,
        /// Which step failed ("get", "set" or "configure")
        stage: &'static str,
        /// Underlying OS error
        #[source]
        source: io::Error,
    },

    /// Trailing checksum does not match the payload
    ///
    /// Returned by `read` when CRC checking was requested. The caller's buffer
    /// still holds every byte that was received.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// Checksum computed over the payload
        expected: u16,
        /// Checksum found in the frame trailer
        actual: u16,
    },

    /// `start()` was called on a server that is already running
    #[error("Server is already running")]
    AlreadyRunning,

    /// I/O was attempted on a client that is not open
    #[error("Not connected")]
    NotConnected,

    /// The peer is not tracked by this server
    #[error("Unknown peer {0}")]
    UnknownPeer(String),

    /// I/O error during an established exchange
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result type alias for communication operations
pub type Result<T> = std::result::Result<T, CommError>;

/// Why a `bind()` call failed, classified from the OS error code
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindReason {
    /// The address is protected (privileged port) or access was denied
    PermissionDenied,
    /// Another socket already owns the address
    AddressInUse,
    /// The socket is not a valid file descriptor
    BadDescriptor,
    /// The socket is already bound to an address
    AlreadyBound,
    /// The descriptor does not refer to a socket
    NotSocket,
    /// The address is not available from the local machine
    AddressNotAvailable,
    /// The address does not match the socket's address family
    FamilyNotSupported,
    /// The address points outside the writable address space
    Fault,
    /// Too many symbolic links while resolving the address
    SymlinkLoop,
    /// Path resolution produced a name that is too long
    NameTooLong,
    /// A path component does not exist
    NoEntry,
    /// Any other OS error code (or none)
    Other(Option<i32>),
}

impl BindReason {
    /// Classify an I/O error returned by `bind()`
    pub fn from_io(err: &io::Error) -> Self {
        match err.raw_os_error() {
            Some(libc::EACCES) => BindReason::PermissionDenied,
            Some(libc::EADDRINUSE) => BindReason::AddressInUse,
            Some(libc::EBADF) => BindReason::BadDescriptor,
            Some(libc::EINVAL) => BindReason::AlreadyBound,
            Some(libc::ENOTSOCK) => BindReason::NotSocket,
            Some(libc::EADDRNOTAVAIL) => BindReason::AddressNotAvailable,
            Some(libc::EAFNOSUPPORT) => BindReason::FamilyNotSupported,
            Some(libc::EFAULT) => BindReason::Fault,
            Some(libc::ELOOP) => BindReason::SymlinkLoop,
            Some(libc::ENAMETOOLONG) => BindReason::NameTooLong,
            Some(libc::ENOENT) => BindReason::NoEntry,
            code => BindReason::Other(code),
        }
    }
}

impl fmt::Display for BindReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BindReason::PermissionDenied => {
                f.write_str("the address is protected, or access to it was denied")
            }
            BindReason::AddressInUse => f.write_str("the address is already in use"),
            BindReason::BadDescriptor => f.write_str("the socket is not a valid file descriptor"),
            BindReason::AlreadyBound => f.write_str("the socket is already bound to an address"),
            BindReason::NotSocket => f.write_str("the descriptor does not refer to a socket"),
            BindReason::AddressNotAvailable => {
                f.write_str("the address is not available from the local machine")
            }
            BindReason::FamilyNotSupported => {
                f.write_str("the address is not valid for the socket's address family")
            }
            BindReason::Fault => f.write_str("the address is outside the user address space"),
            BindReason::SymlinkLoop => f.write_str("too many symbolic links in the address"),
            BindReason::NameTooLong => f.write_str("the address path is too long"),
            BindReason::NoEntry => f.write_str("a component of the address path does not exist"),
            BindReason::Other(Some(code)) => write!(f, "unknown error {code}"),
            BindReason::Other(None) => f.write_str("unknown error"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_reason_classification() {
        let in_use = io::Error::from_raw_os_error(libc::EADDRINUSE);
        assert_eq!(BindReason::from_io(&in_use), BindReason::AddressInUse);

        let denied = io::Error::from_raw_os_error(libc::EACCES);
        assert_eq!(BindReason::from_io(&denied), BindReason::PermissionDenied);

        let custom = io::Error::new(io::ErrorKind::Other, "synthetic");
        assert_eq!(BindReason::from_io(&custom), BindReason::Other(None));
    }

    #[test]
    fn test_bind_error_message_names_reason() {
        let err = CommError::Bind {
            addr: "0.0.0.0:80".to_string(),
            reason: BindReason::PermissionDenied,
            source: io::Error::from_raw_os_error(libc::EACCES),
        };
        let text = err.to_string();
        assert!(text.contains("0.0.0.0:80"));
        assert!(text.contains("protected"));
    }

    #[test]
    fn test_crc_mismatch_display() {
        let err = CommError::CrcMismatch {
            expected: 0x31c3,
            actual: 0x0001,
        };
        assert_eq!(err.to_string(), "CRC mismatch: expected 0x31c3, got 0x0001");
    }
}
