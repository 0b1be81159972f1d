//! Concurrent UDP server
//!
//! A single receive thread reads datagrams from a non-blocking socket. Every
//! sender address becomes a tracked peer on its first datagram, and its
//! payloads accumulate in that peer's queue. When no data callback is set,
//! each datagram is echoed back to its sender unchanged, which makes the
//! server usable as a discovery responder out of the box.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::{Arc, RwLock, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, info, trace, warn};

use crate::error::{BindReason, CommError, Result};
use crate::io::common::{is_socket_creation_failure, is_transient, read_lock, write_lock};
use crate::io::queue::ByteQueue;
use crate::io::server::{PeerSession, Server, ServerConfig, ServerCore};
use crate::io::udp::MAX_UDP_DATAGRAM_SIZE;

/// Sender tracked by a [`UdpServer`]
#[derive(Debug)]
pub struct UdpPeer {
    addr: SocketAddr,
    queue: ByteQueue,
}

impl PeerSession for UdpPeer {
    fn queue(&self) -> &ByteQueue {
        &self.queue
    }

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_open(&self) -> bool {
        true
    }
}

#[derive(Debug)]
struct UdpInner {
    core: ServerCore<UdpServer>,
    socket: RwLock<Option<Arc<UdpSocket>>>,
}

/// Datagram server keyed by sender address
///
/// # Examples
///
/// ```no_run
/// use comms_rust::io::{Server, ServerConfig, UdpServer};
///
/// let server = UdpServer::new(ServerConfig::new(5001));
/// server.set_data_callback(|server, data, from| {
///     println!("{} bytes from {from}", data.len());
///     let _ = server.send_to(from, b"ack");
/// });
/// server.start()?;
/// # Ok::<(), comms_rust::error::CommError>(())
/// ```
#[derive(Debug, Clone)]
pub struct UdpServer {
    inner: Arc<UdpInner>,
}

impl UdpServer {
    /// Create a stopped server
    pub fn new(config: ServerConfig) -> Self {
        UdpServer {
            inner: Arc::new(UdpInner {
                core: ServerCore::new("UDP-Server", config),
                socket: RwLock::new(None),
            }),
        }
    }

    /// Create a stopped server listening on all interfaces at `port`
    pub fn bind_port(port: u16) -> Self {
        Self::new(ServerConfig::new(port))
    }

    fn upgrade(weak: &Weak<UdpInner>) -> Option<UdpServer> {
        weak.upgrade().map(|inner| UdpServer { inner })
    }

    fn socket(&self) -> Result<Arc<UdpSocket>> {
        read_lock(&self.inner.socket)
            .clone()
            .ok_or(CommError::NotConnected)
    }

    fn ingest(&self, socket: &UdpSocket, datagram: &[u8], from: SocketAddr) {
        let core = &self.inner.core;
        let (peer, created) = core.get_or_register(&from, || UdpPeer {
            addr: from,
            queue: ByteQueue::new(),
        });
        if created {
            info!(%from, "New UDP peer");
            core.dispatch_new_peer(self, from, &from);
        }

        let queued = peer.queue.push(datagram);
        trace!(%from, received = datagram.len(), queued, "Datagram received");

        if !core.dispatch_data(self, datagram, &from) {
            if let Err(e) = socket.send_to(datagram, from) {
                debug!(%from, error = %e, "Echo failed");
            }
        }
    }
}

fn receive_loop(weak: Weak<UdpInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; MAX_UDP_DATAGRAM_SIZE];
    loop {
        let Some(server) = UdpServer::upgrade(&weak) else {
            break;
        };
        if !server.is_running() {
            break;
        }
        match socket.recv_from(&mut buf) {
            Ok((n, from)) => server.ingest(&socket, &buf[..n], from),
            Err(e) => {
                // ICMP errors from earlier sends surface here; keep serving.
                if !is_transient(&e) {
                    warn!(error = %e, "Error receiving datagram");
                }
                let backoff = server.inner.core.config().idle_backoff;
                drop(server);
                thread::sleep(backoff);
            }
        }
    }
    debug!("Receive thread exiting");
}

impl Server for UdpServer {
    type Peer = SocketAddr;
    type Session = UdpPeer;

    fn core(&self) -> &ServerCore<Self> {
        &self.inner.core
    }

    fn listen(&self) -> Result<(SocketAddr, Vec<JoinHandle<()>>)> {
        let addr = self.inner.core.config().socket_addr();
        let socket = UdpSocket::bind(addr).map_err(|source| {
            if is_socket_creation_failure(&source) {
                CommError::SocketCreate(source)
            } else {
                CommError::Bind {
                    addr: addr.to_string(),
                    reason: BindReason::from_io(&source),
                    source,
                }
            }
        })?;
        socket.set_nonblocking(true)?;
        let local = socket.local_addr()?;
        info!(%local, "Listening for UDP datagrams");

        let socket = Arc::new(socket);
        *write_lock(&self.inner.socket) = Some(Arc::clone(&socket));

        let weak = Arc::downgrade(&self.inner);
        let spawned = thread::Builder::new()
            .name("udp-receive".into())
            .spawn(move || receive_loop(weak, socket));
        match spawned {
            Ok(handle) => Ok((local, vec![handle])),
            Err(e) => {
                *write_lock(&self.inner.socket) = None;
                Err(e.into())
            }
        }
    }

    fn write_session(&self, peer: &SocketAddr, _session: &UdpPeer, data: &[u8]) -> Result<usize> {
        self.send_to(peer, data)
    }

    fn on_stopped(&self) {
        *write_lock(&self.inner.socket) = None;
    }

    /// Send `data` to any address, tracked or not
    fn send_to(&self, peer: &SocketAddr, data: &[u8]) -> Result<usize> {
        let sent = self.socket()?.send_to(data, peer)?;
        trace!(%peer, sent, "Datagram sent");
        Ok(sent)
    }

    /// Send one datagram to the IPv4 limited broadcast address
    ///
    /// Uses a throwaway socket with `SO_BROADCAST` set, addressed to the
    /// server's own port, so every instance on the local segment receives it.
    fn broadcast(&self, data: &[u8]) -> Result<()> {
        let port = self
            .local_addr()
            .map(|addr| addr.port())
            .unwrap_or(self.inner.core.config().port);
        let socket =
            UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(CommError::SocketCreate)?;
        socket.set_broadcast(true)?;
        let target = SocketAddrV4::new(Ipv4Addr::BROADCAST, port);
        let sent = socket.send_to(data, target)?;
        debug!(%target, sent, "Broadcast sent");
        Ok(())
    }
}
