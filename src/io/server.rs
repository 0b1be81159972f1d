//! Server framework shared by the TCP and UDP servers
//!
//! A server owns a socket, one service thread (accept or receive loop) and,
//! for TCP, one worker thread per peer. Every tracked peer has a
//! [`ByteQueue`] that accumulates whatever it sent, so received data can be
//! consumed either from callbacks or later through [`Server::read_bytes`].
//!
//! # Lifecycle
//!
//! `start` binds and spawns the service thread; `stop` clears the running
//! flag, joins every thread it spawned and releases the socket. Both are
//! serialized by a lifecycle lock. Loops poll the running flag between
//! blocking calls that are bounded by [`ServerConfig::poll_interval`], so a
//! stop completes within roughly one poll interval even while peers are idle.
//!
//! # Callbacks
//!
//! Two optional single-slot callbacks are dispatched from service threads:
//! a data callback for every received chunk and a new-peer callback for
//! every newly tracked peer. Setting one replaces the previous closure.
//! Callbacks run after the peer's queue lock has been released, so they may
//! call [`Server::read_bytes`] or [`Server::send_to`] freely. They must not
//! call [`Server::stop`] on the server that invoked them.
//!
//! # Examples
//!
//! ```no_run
//! use comms_rust::io::{Server, ServerConfig, TcpServer};
//!
//! let server = TcpServer::new(ServerConfig::new(5000));
//! server.set_data_callback(|server, data, peer| {
//!     let _ = server.send_to(peer, data);
//! });
//! server.start()?;
//! # Ok::<(), comms_rust::error::CommError>(())
//! ```

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::error::{CommError, Result};
use crate::io::common::{join_thread, lock, read_lock, write_lock};
use crate::io::queue::{ByteQueue, QueueStats};

/// Sleep between queue checks of a blocking [`Server::read_bytes`]
const READ_POLL: Duration = Duration::from_millis(1);

/// Server settings
///
/// # Examples
///
/// ```
/// use comms_rust::io::ServerConfig;
/// use std::time::Duration;
///
/// let config = ServerConfig::new(5000)
///     .with_max_connections(32)
///     .with_nodelay(true)
///     .with_poll_interval(Duration::from_millis(20));
/// assert_eq!(config.port, 5000);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Local address to bind (all interfaces by default)
    pub bind_address: IpAddr,
    /// Local port; 0 lets the OS pick one
    pub port: u16,
    /// Listen backlog for TCP
    pub max_connections: u32,
    /// Disable Nagle's algorithm on accepted TCP connections
    pub nodelay: bool,
    /// Enable TCP_QUICKACK on accepted TCP connections (Linux only)
    pub quickack: bool,
    /// Upper bound on each blocking receive in service threads
    pub poll_interval: Duration,
    /// Sleep after a would-block accept or receive
    pub idle_backoff: Duration,
    /// Size of each receive performed by a TCP peer worker
    pub recv_chunk: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 0,
            max_connections: 10,
            nodelay: false,
            quickack: false,
            poll_interval: Duration::from_millis(50),
            idle_backoff: Duration::from_millis(5),
            recv_chunk: 1024,
        }
    }
}

impl ServerConfig {
    /// Default settings listening on `port`
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Default::default()
        }
    }

    /// Bind to a specific local address
    pub fn with_bind_address(mut self, addr: IpAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Set the TCP listen backlog
    pub fn with_max_connections(mut self, max_connections: u32) -> Self {
        self.max_connections = max_connections;
        self
    }

    /// Set TCP_NODELAY for accepted connections
    pub fn with_nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = nodelay;
        self
    }

    /// Set TCP_QUICKACK for accepted connections
    pub fn with_quickack(mut self, quickack: bool) -> Self {
        self.quickack = quickack;
        self
    }

    /// Set the bound on blocking receives in service threads
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    /// Set the sleep after a would-block accept or receive
    pub fn with_idle_backoff(mut self, idle_backoff: Duration) -> Self {
        self.idle_backoff = idle_backoff;
        self
    }

    /// Set the receive chunk size for TCP peer workers
    pub fn with_recv_chunk(mut self, recv_chunk: usize) -> Self {
        self.recv_chunk = recv_chunk.max(1);
        self
    }

    pub(crate) fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.bind_address, self.port)
    }

    /// Read timeout for service sockets; a zero interval blocks
    pub(crate) fn read_timeout(&self) -> Option<Duration> {
        (!self.poll_interval.is_zero()).then_some(self.poll_interval)
    }
}

/// Data callback: server, received chunk, peer that sent it
pub type DataCallback<S> = Arc<dyn Fn(&S, &[u8], &<S as Server>::Peer) + Send + Sync>;

/// New-peer callback: server, remote address, peer handle
pub type NewPeerCallback<S> = Arc<dyn Fn(&S, SocketAddr, &<S as Server>::Peer) + Send + Sync>;

/// Per-peer state tracked by a server
pub trait PeerSession: Send + Sync {
    /// Queue of bytes received from this peer
    fn queue(&self) -> &ByteQueue;

    /// Remote address of the peer
    fn remote_addr(&self) -> SocketAddr;

    /// Whether the peer can still send or receive
    fn is_open(&self) -> bool;

    /// Hand over the peer's worker thread for joining, if it has one
    fn take_worker(&self) -> Option<JoinHandle<()>> {
        None
    }
}

struct Registry<S: Server> {
    peers: HashMap<S::Peer, Arc<S::Session>>,
    on_data: Option<DataCallback<S>>,
    on_new_peer: Option<NewPeerCallback<S>>,
}

/// State every server variant composes
pub struct ServerCore<S: Server> {
    name: &'static str,
    config: RwLock<ServerConfig>,
    running: AtomicBool,
    // Service threads of the current run; the mutex also serializes start/stop.
    lifecycle: Mutex<Vec<JoinHandle<()>>>,
    // Workers of peers removed while still connected; joined by stop().
    detached: Mutex<Vec<JoinHandle<()>>>,
    // Tracked peers and both callback slots share the server-wide lock.
    registry: RwLock<Registry<S>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl<S: Server> ServerCore<S> {
    pub(crate) fn new(name: &'static str, config: ServerConfig) -> Self {
        ServerCore {
            name,
            config: RwLock::new(config),
            running: AtomicBool::new(false),
            lifecycle: Mutex::new(Vec::new()),
            detached: Mutex::new(Vec::new()),
            registry: RwLock::new(Registry {
                peers: HashMap::new(),
                on_data: None,
                on_new_peer: None,
            }),
            local_addr: Mutex::new(None),
        }
    }

    /// Server kind used in log records
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Snapshot of the current settings
    pub fn config(&self) -> ServerConfig {
        read_lock(&self.config).clone()
    }

    /// Change settings; socket-level ones apply from the next `start`
    pub fn update_config(&self, f: impl FnOnce(&mut ServerConfig)) {
        f(&mut write_lock(&self.config));
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub(crate) fn detached_workers(&self) -> usize {
        lock(&self.detached).len()
    }

    pub(crate) fn session(&self, peer: &S::Peer) -> Result<Arc<S::Session>> {
        read_lock(&self.registry)
            .peers
            .get(peer)
            .cloned()
            .ok_or_else(|| CommError::UnknownPeer(format!("{peer:?}")))
    }

    pub(crate) fn sessions(&self) -> Vec<(S::Peer, Arc<S::Session>)> {
        read_lock(&self.registry)
            .peers
            .iter()
            .map(|(peer, session)| (peer.clone(), Arc::clone(session)))
            .collect()
    }

    pub(crate) fn register(&self, peer: S::Peer, session: Arc<S::Session>) {
        write_lock(&self.registry).peers.insert(peer, session);
    }

    /// Look up `peer`, creating its session on first sight
    ///
    /// Returns the session and whether it was created by this call.
    pub(crate) fn get_or_register(
        &self,
        peer: &S::Peer,
        create: impl FnOnce() -> S::Session,
    ) -> (Arc<S::Session>, bool) {
        if let Some(session) = read_lock(&self.registry).peers.get(peer) {
            return (Arc::clone(session), false);
        }
        let mut registry = write_lock(&self.registry);
        match registry.peers.get(peer) {
            Some(session) => (Arc::clone(session), false),
            None => {
                let session = Arc::new(create());
                registry.peers.insert(peer.clone(), Arc::clone(&session));
                (session, true)
            }
        }
    }

    /// Invoke the data callback; returns false when none is registered
    pub(crate) fn dispatch_data(&self, server: &S, data: &[u8], peer: &S::Peer) -> bool {
        let callback = read_lock(&self.registry).on_data.clone();
        match callback {
            Some(callback) => {
                callback(server, data, peer);
                true
            }
            None => false,
        }
    }

    pub(crate) fn dispatch_new_peer(&self, server: &S, addr: SocketAddr, peer: &S::Peer) {
        let callback = read_lock(&self.registry).on_new_peer.clone();
        if let Some(callback) = callback {
            callback(server, addr, peer);
        }
    }
}

impl<S: Server> Drop for ServerCore<S> {
    fn drop(&mut self) {
        // Detached service threads notice this on their next poll.
        self.running.store(false, Ordering::Release);
    }
}

impl<S: Server> fmt::Debug for ServerCore<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerCore")
            .field("name", &self.name)
            .field("running", &self.is_running())
            .field("local_addr", &*lock(&self.local_addr))
            .field("peers", &read_lock(&self.registry).peers.len())
            .finish()
    }
}

/// Concurrent server over a connection-oriented or datagram socket
///
/// Implementors supply the socket setup ([`Server::listen`]) and the way a
/// chunk reaches one peer ([`Server::write_session`]); lifecycle, peer
/// tracking, queues and callbacks are provided.
pub trait Server: Send + Sync + Sized + 'static {
    /// Handle identifying a tracked peer
    type Peer: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static;
    /// Per-peer state
    type Session: PeerSession + 'static;

    /// Shared server state
    fn core(&self) -> &ServerCore<Self>;

    /// Create and bind the socket, then spawn the service thread(s)
    ///
    /// Called by [`Server::start`] with the running flag already set.
    /// Returns the bound address and the threads `stop` must join.
    fn listen(&self) -> Result<(SocketAddr, Vec<JoinHandle<()>>)>;

    /// Send `data` to one tracked peer
    fn write_session(&self, peer: &Self::Peer, session: &Self::Session, data: &[u8])
        -> Result<usize>;

    /// Release the socket after every thread has been joined
    fn on_stopped(&self) {}

    /// Bind and start serving
    ///
    /// # Errors
    ///
    /// - [`CommError::AlreadyRunning`] - the server is already started
    /// - [`CommError::SocketCreate`] / [`CommError::Bind`] - socket setup failed;
    ///   the server stays stopped
    fn start(&self) -> Result<()> {
        let core = self.core();
        let mut threads = lock(&core.lifecycle);
        if core.is_running() {
            return Err(CommError::AlreadyRunning);
        }

        core.running.store(true, Ordering::Release);
        match self.listen() {
            Ok((addr, handles)) => {
                *lock(&core.local_addr) = Some(addr);
                threads.extend(handles);
                info!(server = core.name, %addr, "Server started");
                Ok(())
            }
            Err(e) => {
                core.running.store(false, Ordering::Release);
                error!(server = core.name, error = %e, "Failed to start server");
                Err(e)
            }
        }
    }

    /// Stop serving and join every thread; a no-op when not running
    ///
    /// Tracked peers and their queued data are kept, so `read_bytes` keeps
    /// working after a stop.
    fn stop(&self) {
        let core = self.core();
        let mut threads = lock(&core.lifecycle);
        if !core.running.swap(false, Ordering::AcqRel) {
            return;
        }

        debug!(server = core.name, "Waiting for threads to join");
        // Service threads first: once they are gone no new worker can appear.
        for handle in threads.drain(..) {
            join_thread(handle);
        }
        let workers: Vec<_> = core
            .sessions()
            .into_iter()
            .filter_map(|(_, session)| session.take_worker())
            .collect();
        for handle in workers {
            join_thread(handle);
        }
        loop {
            let removed: Vec<_> = lock(&core.detached).drain(..).collect();
            if removed.is_empty() {
                break;
            }
            for handle in removed {
                join_thread(handle);
            }
        }

        self.on_stopped();
        *lock(&core.local_addr) = None;
        info!(server = core.name, "Server stopped");
    }

    /// Whether the server is accepting and receiving
    fn is_running(&self) -> bool {
        self.core().is_running()
    }

    /// Bound local address while running
    fn local_addr(&self) -> Option<SocketAddr> {
        *lock(&self.core().local_addr)
    }

    /// Send `data` to every open peer
    ///
    /// A failure on one peer is logged and does not stop the others.
    fn broadcast(&self, data: &[u8]) -> Result<()> {
        for (peer, session) in self.core().sessions() {
            if !session.is_open() {
                continue;
            }
            if let Err(e) = self.write_session(&peer, &session, data) {
                warn!(server = self.core().name, ?peer, error = %e, "Broadcast failed");
            }
        }
        Ok(())
    }

    /// Send `data` to one tracked peer
    ///
    /// # Errors
    ///
    /// - [`CommError::UnknownPeer`] - `peer` is not tracked
    fn send_to(&self, peer: &Self::Peer, data: &[u8]) -> Result<usize> {
        let session = self.core().session(peer)?;
        self.write_session(peer, &session, data)
    }

    /// Replace the data callback
    fn set_data_callback<F>(&self, callback: F)
    where
        F: Fn(&Self, &[u8], &Self::Peer) + Send + Sync + 'static,
    {
        write_lock(&self.core().registry).on_data = Some(Arc::new(callback));
    }

    /// Remove the data callback
    fn clear_data_callback(&self) {
        write_lock(&self.core().registry).on_data = None;
    }

    /// Replace the new-peer callback
    fn set_new_peer_callback<F>(&self, callback: F)
    where
        F: Fn(&Self, SocketAddr, &Self::Peer) + Send + Sync + 'static,
    {
        write_lock(&self.core().registry).on_new_peer = Some(Arc::new(callback));
    }

    /// Remove the new-peer callback
    fn clear_new_peer_callback(&self) {
        write_lock(&self.core().registry).on_new_peer = None;
    }

    /// Number of tracked peers
    fn peer_count(&self) -> usize {
        read_lock(&self.core().registry).peers.len()
    }

    /// Handles of every tracked peer
    fn peers(&self) -> Vec<Self::Peer> {
        read_lock(&self.core().registry).peers.keys().cloned().collect()
    }

    /// Remote address of a tracked peer
    fn peer_addr(&self, peer: &Self::Peer) -> Result<SocketAddr> {
        Ok(self.core().session(peer)?.remote_addr())
    }

    /// Whether a tracked peer is still connected
    fn is_peer_open(&self, peer: &Self::Peer) -> bool {
        self.core()
            .session(peer)
            .map(|session| session.is_open())
            .unwrap_or(false)
    }

    /// Bytes waiting in a peer's queue
    fn available(&self, peer: &Self::Peer) -> Result<usize> {
        Ok(self.core().session(peer)?.queue().len())
    }

    /// Copy queued bytes from a peer into `buf`
    ///
    /// With `blocking` the call first waits until `buf.len()` bytes are
    /// queued, the peer closes or the server stops. With `erase` the copied
    /// bytes are removed from the queue; otherwise this is a peek.
    ///
    /// # Errors
    ///
    /// - [`CommError::UnknownPeer`] - `peer` is not tracked
    fn read_bytes(
        &self,
        peer: &Self::Peer,
        buf: &mut [u8],
        blocking: bool,
        erase: bool,
    ) -> Result<usize> {
        let session = self.core().session(peer)?;
        if blocking {
            while session.queue().len() < buf.len() && session.is_open() && self.is_running() {
                thread::sleep(READ_POLL);
            }
        }
        Ok(session.queue().copy_out(buf, erase))
    }

    /// Discard everything queued for a peer
    fn clear_queue(&self, peer: &Self::Peer) -> Result<()> {
        self.core().session(peer)?.queue().clear();
        Ok(())
    }

    /// Counters of a peer's queue
    fn queue_stats(&self, peer: &Self::Peer) -> Result<QueueStats> {
        Ok(self.core().session(peer)?.queue().stats())
    }

    /// Stop tracking a peer and drop its queue
    ///
    /// Returns whether the peer was tracked. A TCP peer that is still
    /// connected keeps being served by its worker until it disconnects or
    /// the server stops; `stop()` joins that worker.
    fn remove_peer(&self, peer: &Self::Peer) -> bool {
        let removed = write_lock(&self.core().registry).peers.remove(peer);
        match removed {
            Some(session) => {
                debug!(server = self.core().name, ?peer, "Peer removed");
                if let Some(handle) = session.take_worker() {
                    if handle.is_finished() {
                        join_thread(handle);
                    } else {
                        lock(&self.core().detached).push(handle);
                    }
                }
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ServerConfig::default();
        assert_eq!(config.bind_address, IpAddr::V4(Ipv4Addr::UNSPECIFIED));
        assert_eq!(config.max_connections, 10);
        assert!(!config.nodelay);
        assert!(!config.quickack);
        assert_eq!(config.read_timeout(), Some(Duration::from_millis(50)));
    }

    #[test]
    fn test_zero_poll_interval_blocks() {
        let config = ServerConfig::new(5000).with_poll_interval(Duration::ZERO);
        assert_eq!(config.read_timeout(), None);
        assert_eq!(config.socket_addr(), "0.0.0.0:5000".parse().unwrap());
    }

    #[test]
    fn test_recv_chunk_never_zero() {
        assert_eq!(ServerConfig::new(1).with_recv_chunk(0).recv_chunk, 1);
    }
}
