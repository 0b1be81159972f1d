//! Concurrent TCP server
//!
//! One accept thread admits connections; each accepted connection gets its
//! own worker thread that reads chunks into the peer's queue and hands them
//! to the data callback. Peers are identified by a [`PeerId`] assigned in
//! accept order.

use std::io::{self, Read, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread::{self, JoinHandle};

use tracing::{debug, error, info, trace, warn};

use crate::error::{BindReason, CommError, Result};
use crate::io::common::{self, is_socket_creation_failure, is_transient, lock};
use crate::io::queue::ByteQueue;
use crate::io::server::{PeerSession, Server, ServerConfig, ServerCore};

/// Unique identifier for each accepted connection
pub type PeerId = u64;

/// State of one accepted connection
#[derive(Debug)]
pub struct TcpPeer {
    addr: SocketAddr,
    queue: ByteQueue,
    writer: Mutex<Option<TcpStream>>,
    open: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TcpPeer {
    fn new(addr: SocketAddr, writer: TcpStream) -> Self {
        TcpPeer {
            addr,
            queue: ByteQueue::new(),
            writer: Mutex::new(Some(writer)),
            open: AtomicBool::new(true),
            worker: Mutex::new(None),
        }
    }

    fn close(&self) {
        self.open.store(false, Ordering::Release);
        if let Some(stream) = lock(&self.writer).take() {
            let _ = stream.shutdown(Shutdown::Both);
        }
    }
}

impl PeerSession for TcpPeer {
    fn queue(&self) -> &ByteQueue {
        &self.queue
    }

    fn remote_addr(&self) -> SocketAddr {
        self.addr
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    fn take_worker(&self) -> Option<JoinHandle<()>> {
        lock(&self.worker).take()
    }
}

#[derive(Debug)]
struct TcpInner {
    core: ServerCore<TcpServer>,
    next_peer_id: AtomicU64,
}

/// Multi-client TCP server
///
/// Cloning yields another handle to the same server. Service threads only
/// hold weak references, so dropping every handle lets them wind down.
///
/// # Examples
///
/// ```no_run
/// use comms_rust::io::{Server, ServerConfig, TcpServer};
///
/// let server = TcpServer::new(ServerConfig::new(5000).with_nodelay(true));
/// server.set_new_peer_callback(|_, addr, peer| {
///     println!("peer #{peer} connected from {addr}");
/// });
/// server.set_data_callback(|server, data, peer| {
///     let _ = server.send_to(peer, data);
/// });
/// server.start()?;
/// # Ok::<(), comms_rust::error::CommError>(())
/// ```
#[derive(Debug, Clone)]
pub struct TcpServer {
    inner: Arc<TcpInner>,
}

impl TcpServer {
    /// Create a stopped server
    pub fn new(config: ServerConfig) -> Self {
        TcpServer {
            inner: Arc::new(TcpInner {
                core: ServerCore::new("TCP-Server", config),
                next_peer_id: AtomicU64::new(1),
            }),
        }
    }

    /// Create a stopped server listening on all interfaces at `port`
    pub fn bind_port(port: u16) -> Self {
        Self::new(ServerConfig::new(port))
    }

    /// Set TCP_NODELAY for connections accepted from now on
    pub fn set_nodelay(&self, nodelay: bool) {
        self.inner.core.update_config(|c| c.nodelay = nodelay);
    }

    /// Set TCP_QUICKACK for connections accepted from now on
    pub fn set_quickack(&self, quickack: bool) {
        self.inner.core.update_config(|c| c.quickack = quickack);
    }

    fn upgrade(weak: &Weak<TcpInner>) -> Option<TcpServer> {
        weak.upgrade().map(|inner| TcpServer { inner })
    }

    fn admit(&self, stream: TcpStream, addr: SocketAddr) {
        let config = self.inner.core.config();
        if let Err(e) = prepare_stream(&stream, &config) {
            warn!(%addr, error = %e, "Failed to configure accepted connection");
            return;
        }
        let writer = match stream.try_clone() {
            Ok(writer) => writer,
            Err(e) => {
                warn!(%addr, error = %e, "Failed to clone accepted connection");
                return;
            }
        };

        let id = self.inner.next_peer_id.fetch_add(1, Ordering::SeqCst);
        let peer = Arc::new(TcpPeer::new(addr, writer));
        self.inner.core.register(id, Arc::clone(&peer));
        info!(peer = id, %addr, "Client connected");

        self.inner.core.dispatch_new_peer(self, addr, &id);

        let weak = Arc::downgrade(&self.inner);
        let session = Arc::clone(&peer);
        let chunk = config.recv_chunk;
        let spawned = thread::Builder::new()
            .name(format!("tcp-peer-{id}"))
            .spawn(move || serve_peer(weak, id, session, stream, chunk));
        match spawned {
            Ok(handle) => *lock(&peer.worker) = Some(handle),
            Err(e) => {
                error!(peer = id, error = %e, "Failed to spawn peer worker");
                peer.close();
            }
        }
    }
}

fn prepare_stream(stream: &TcpStream, config: &ServerConfig) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(config.read_timeout())?;
    stream.set_nodelay(config.nodelay)?;
    if config.quickack {
        common::set_quickack(stream, true)?;
    }
    Ok(())
}

fn bind_error(addr: SocketAddr, source: io::Error) -> CommError {
    if is_socket_creation_failure(&source) {
        return CommError::SocketCreate(source);
    }
    CommError::Bind {
        addr: addr.to_string(),
        reason: BindReason::from_io(&source),
        source,
    }
}

fn accept_loop(weak: Weak<TcpInner>, listener: TcpListener) {
    loop {
        let Some(server) = TcpServer::upgrade(&weak) else {
            break;
        };
        if !server.is_running() {
            break;
        }
        match listener.accept() {
            Ok((stream, addr)) => server.admit(stream, addr),
            Err(e) if is_transient(&e) || e.kind() == io::ErrorKind::ConnectionAborted => {
                let backoff = server.inner.core.config().idle_backoff;
                drop(server);
                thread::sleep(backoff);
            }
            Err(e) => {
                error!(error = %e, "Accept failed");
                break;
            }
        }
    }
    debug!("Accept thread exiting");
}

fn serve_peer(
    weak: Weak<TcpInner>,
    id: PeerId,
    peer: Arc<TcpPeer>,
    mut stream: TcpStream,
    chunk: usize,
) {
    let mut buf = vec![0u8; chunk];
    loop {
        if !TcpServer::upgrade(&weak).is_some_and(|s| s.is_running()) {
            break;
        }
        match stream.read(&mut buf) {
            Ok(0) => {
                info!(peer = id, addr = %peer.addr, "Client disconnected");
                break;
            }
            Ok(n) => {
                let queued = peer.queue.push(&buf[..n]);
                trace!(peer = id, received = n, queued, "Data received");
                let Some(server) = TcpServer::upgrade(&weak) else {
                    break;
                };
                if !server.is_running() {
                    break;
                }
                server.inner.core.dispatch_data(&server, &buf[..n], &id);
            }
            Err(e) if is_transient(&e) => continue,
            Err(e) => {
                warn!(peer = id, error = %e, "Error receiving data");
                break;
            }
        }
    }
    peer.close();
    let _ = stream.shutdown(Shutdown::Both);
    debug!(peer = id, "Peer worker exiting");
}

impl Server for TcpServer {
    type Peer = PeerId;
    type Session = TcpPeer;

    fn core(&self) -> &ServerCore<Self> {
        &self.inner.core
    }

    fn listen(&self) -> Result<(SocketAddr, Vec<JoinHandle<()>>)> {
        let config = self.inner.core.config();
        let addr = config.socket_addr();

        // std enables SO_REUSEADDR on Unix before binding.
        let listener = TcpListener::bind(addr).map_err(|e| bind_error(addr, e))?;
        common::set_backlog(&listener, config.max_connections)?;
        listener.set_nonblocking(true)?;
        let local = listener.local_addr()?;
        info!(%local, backlog = config.max_connections, "Listening for TCP connections");

        let weak = Arc::downgrade(&self.inner);
        let handle = thread::Builder::new()
            .name("tcp-accept".into())
            .spawn(move || accept_loop(weak, listener))?;
        Ok((local, vec![handle]))
    }

    fn write_session(&self, peer: &PeerId, session: &TcpPeer, data: &[u8]) -> Result<usize> {
        let mut writer = lock(&session.writer);
        let stream = writer.as_mut().ok_or(CommError::NotConnected)?;
        let sent = stream.write(data)?;
        trace!(peer, requested = data.len(), sent, "Data sent");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn loopback() -> ServerConfig {
        ServerConfig::new(0).with_bind_address("127.0.0.1".parse().unwrap())
    }

    #[test]
    fn test_bind_conflict_is_reported() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = taken.local_addr().unwrap().port();

        let server = TcpServer::new(loopback());
        server.core().update_config(|c| c.port = port);
        let err = server.start().unwrap_err();
        assert!(matches!(
            err,
            CommError::Bind {
                reason: BindReason::AddressInUse,
                ..
            }
        ));
        assert!(!server.is_running());
    }

    #[test]
    fn test_peer_ids_follow_accept_order() {
        let server = TcpServer::new(loopback());
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let _a = TcpStream::connect(addr).unwrap();
        let _b = TcpStream::connect(addr).unwrap();
        for _ in 0..200 {
            if server.peer_count() == 2 {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }

        let mut ids = server.peers();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2]);
        server.stop();
    }

    #[test]
    fn test_stop_joins_worker_of_removed_peer() {
        let server = TcpServer::new(loopback());
        server.start().unwrap();
        let addr = server.local_addr().unwrap();

        let mut client = TcpStream::connect(addr).unwrap();
        for _ in 0..200 {
            let spawned = server
                .core()
                .session(&1)
                .is_ok_and(|peer| lock(&peer.worker).is_some());
            if spawned {
                break;
            }
            thread::sleep(Duration::from_millis(5));
        }
        assert!(server.remove_peer(&1));
        assert_eq!(server.peer_count(), 0);
        assert_eq!(server.core().detached_workers(), 1);

        server.stop();
        assert_eq!(server.core().detached_workers(), 0);

        // The worker closed its end before stop() returned.
        client
            .set_read_timeout(Some(Duration::from_secs(1)))
            .unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_config_setters() {
        let server = TcpServer::bind_port(0);
        server.set_nodelay(true);
        server.set_quickack(true);
        let config = server.core().config();
        assert!(config.nodelay);
        assert!(config.quickack);
    }
}
