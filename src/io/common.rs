//! Common helpers shared by clients and servers
//!
//! Host resolution, socket options std does not expose, the transient-error
//! test used by polling loops, and poison-tolerant locking.

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::AsRawFd;
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::thread::{self, JoinHandle};

use tracing::{trace, warn};

use crate::error::{CommError, Result};

/// Resolve `host:port`, IPv4 addresses first
pub(crate) fn resolve(host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    let mut addrs: Vec<SocketAddr> = (host, port)
        .to_socket_addrs()
        .map_err(|_| CommError::HostResolution(host.to_string()))?
        .collect();
    if addrs.is_empty() {
        return Err(CommError::HostResolution(host.to_string()));
    }
    addrs.sort_by_key(|addr| !addr.is_ipv4());
    trace!(host, port, resolved = ?addrs, "Resolved host");
    Ok(addrs)
}

/// Would-block style errors that polling loops retry instead of surfacing
pub(crate) fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut | io::ErrorKind::Interrupted
    )
}

/// Errors that mean the OS could not create a socket at all
pub(crate) fn is_socket_creation_failure(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE)
            | Some(libc::ENFILE)
            | Some(libc::ENOBUFS)
            | Some(libc::ENOMEM)
            | Some(libc::EAFNOSUPPORT)
            | Some(libc::EPROTONOSUPPORT)
    )
}

fn set_int_option<S: AsRawFd>(
    socket: &S,
    level: libc::c_int,
    name: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let fd = socket.as_raw_fd();

    unsafe {
        let ret = libc::setsockopt(
            fd,
            level,
            name,
            &value as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );

        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
    }

    Ok(())
}

/// Enable or disable TCP_QUICKACK (delayed ACKs) on a socket
#[cfg(target_os = "linux")]
pub(crate) fn set_quickack<S: AsRawFd>(socket: &S, enabled: bool) -> io::Result<()> {
    set_int_option(socket, libc::IPPROTO_TCP, libc::TCP_QUICKACK, enabled as libc::c_int)
}

#[cfg(not(target_os = "linux"))]
pub(crate) fn set_quickack<S: AsRawFd>(_socket: &S, _enabled: bool) -> io::Result<()> {
    Ok(())
}

/// Set the size of the socket receive buffer (SO_RCVBUF)
pub(crate) fn set_recv_buffer_size<S: AsRawFd>(socket: &S, size: usize) -> io::Result<()> {
    set_int_option(socket, libc::SOL_SOCKET, libc::SO_RCVBUF, size as libc::c_int)
}

/// Set the size of the socket send buffer (SO_SNDBUF)
pub(crate) fn set_send_buffer_size<S: AsRawFd>(socket: &S, size: usize) -> io::Result<()> {
    set_int_option(socket, libc::SOL_SOCKET, libc::SO_SNDBUF, size as libc::c_int)
}

/// Re-issue `listen()` so the configured backlog replaces std's default
pub(crate) fn set_backlog<S: AsRawFd>(socket: &S, backlog: u32) -> io::Result<()> {
    let backlog = backlog.min(libc::c_int::MAX as u32) as libc::c_int;
    if unsafe { libc::listen(socket.as_raw_fd(), backlog) } != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn read_lock<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) fn write_lock<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(PoisonError::into_inner)
}

/// Join a service thread unless it is the calling thread
///
/// A callback that stops its own server runs on one of the threads being
/// joined; that thread is left to finish on its own.
pub(crate) fn join_thread(handle: JoinHandle<()>) {
    if handle.thread().id() == thread::current().id() {
        return;
    }
    let name = handle.thread().name().map(str::to_owned);
    if handle.join().is_err() {
        warn!(thread = ?name, "Service thread panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::UdpSocket;

    #[test]
    fn test_resolve_localhost_prefers_ipv4() {
        let addrs = resolve("127.0.0.1", 5000).unwrap();
        assert_eq!(addrs[0], "127.0.0.1:5000".parse().unwrap());
    }

    #[test]
    fn test_resolve_unknown_host() {
        let err = resolve("host.invalid", 5000).unwrap_err();
        assert!(matches!(err, CommError::HostResolution(_)));
    }

    #[test]
    fn test_transient_kinds() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::TimedOut)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::ConnectionReset)));
    }

    #[test]
    fn test_buffer_size_options() {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        set_recv_buffer_size(&socket, 64 * 1024).unwrap();
        set_send_buffer_size(&socket, 64 * 1024).unwrap();
    }
}
