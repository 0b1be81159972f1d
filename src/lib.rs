//! Byte-stream communication over serial lines, TCP and UDP
//!
//! This library provides blocking clients for three transports behind one
//! [`io::Client`] trait, concurrent TCP and UDP servers with per-peer byte
//! queues and callbacks, and the 16-bit CRC used to frame payloads.
//!
//! # Features
//!
//! - **One client contract** - `open`/`read`/`write`/`close` work the same on every transport
//! - **Optional CRC framing** - append or verify a 2-byte checksum trailer on any read or write
//! - **Thread-per-peer servers** - accept and receive loops with queued data and callbacks
//! - **Bounded shutdown** - `stop()` joins every service thread within one poll interval
//! - **Structured logging** - every connection event goes through `tracing`
//!
//! # Quick Start
//!
//! **Server:**
//! ```no_run
//! use comms_rust::io::{Server, ServerConfig, TcpServer};
//!
//! let server = TcpServer::new(ServerConfig::new(5000));
//! server.set_data_callback(|server, data, peer| {
//!     println!("peer #{peer} sent {} bytes", data.len());
//!     let _ = server.send_to(peer, data);
//! });
//! server.start()?;
//! # Ok::<(), comms_rust::CommError>(())
//! ```
//!
//! **Client:**
//! ```no_run
//! use comms_rust::io::{Client, ClientBuilder};
//! use std::time::Duration;
//!
//! let client = ClientBuilder::new()
//!     .tcp("127.0.0.1", 5000)
//!     .connect_timeout(Duration::from_secs(2))
//!     .build()?;
//!
//! client.write(b"Hello TCP", true)?;
//! let mut reply = [0u8; 11];
//! client.read(&mut reply, true, true)?;
//! # Ok::<(), comms_rust::CommError>(())
//! ```
//!
//! # Architecture
//!
//! ## Module Structure
//!
//! - **`protocol`** - Framing
//!   - `crc` - CRC-16 (polynomial 0x1021) table, compute, verify and trailer helpers
//!
//! - **`io`** - Transports
//!   - `Client` - Common client trait; `SerialClient`, `TcpClient`, `UdpClient`
//!   - `ClientBuilder` - Type-state builder for opened clients
//!   - `Server` - Lifecycle, peer tracking, queues and callbacks
//!   - `TcpServer` / `UdpServer` - Concrete servers
//!
//! - **`error`** - Error handling
//!   - `CommError` - Unified error type for all operations
//!   - `Result<T>` - Type alias for `Result<T, CommError>`
//!
//! # Error Handling
//!
//! Every fallible operation returns [`Result`]. The variants most callers
//! care about:
//!
//! - **Connect / ConnectionTimeout** - The peer refused or did not answer in time
//! - **Bind** - A server could not claim its port, with the reason classified
//! - **CrcMismatch** - A received frame failed its checksum; the bytes are still in the buffer
//!
//! ```no_run
//! use comms_rust::io::ClientBuilder;
//! use comms_rust::CommError;
//!
//! match ClientBuilder::new().tcp("localhost", 5000).build() {
//!     Ok(_client) => println!("Connected"),
//!     Err(CommError::Connect { addr, source }) => eprintln!("{addr}: {source}"),
//!     Err(e) => eprintln!("Other error: {e}"),
//! }
//! ```

pub mod error;
pub mod io;
pub mod protocol;

// Re-export commonly used types
pub use error::{CommError, Result};
