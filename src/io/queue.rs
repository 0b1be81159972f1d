//! Per-peer FIFO of received bytes awaiting the application
//!
//! Each peer owns one [`ByteQueue`] guarded by its own mutex, so reads on
//! different peers never contend.

use std::sync::Mutex;

use bytes::{Buf, BytesMut};

use crate::io::common::lock;

/// Statistics for a byte queue
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Total bytes appended
    pub received: u64,
    /// Total bytes removed by consuming reads or clears
    pub consumed: u64,
    /// Bytes currently queued
    pub current_size: usize,
    /// Largest size the queue has reached
    pub peak_size: usize,
}

#[derive(Default)]
struct Inner {
    buf: BytesMut,
    stats: QueueStats,
}

/// FIFO byte buffer with its own lock
#[derive(Default)]
pub struct ByteQueue {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for ByteQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteQueue")
            .field("stats", &lock(&self.inner).stats)
            .finish()
    }
}

impl ByteQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Append bytes, returning the queue length afterwards
    pub fn push(&self, data: &[u8]) -> usize {
        let mut inner = lock(&self.inner);
        inner.buf.extend_from_slice(data);
        let len = inner.buf.len();
        inner.stats.received += data.len() as u64;
        inner.stats.current_size = len;
        inner.stats.peak_size = inner.stats.peak_size.max(len);
        len
    }

    /// Bytes currently queued
    pub fn len(&self) -> usize {
        lock(&self.inner).buf.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy up to `out.len()` bytes from the front of the queue
    ///
    /// With `erase` the copied prefix is removed (consuming read); otherwise
    /// the queue is left untouched (peek).
    pub fn copy_out(&self, out: &mut [u8], erase: bool) -> usize {
        let mut inner = lock(&self.inner);
        let n = out.len().min(inner.buf.len());
        out[..n].copy_from_slice(&inner.buf[..n]);
        if erase {
            inner.buf.advance(n);
            inner.stats.consumed += n as u64;
            inner.stats.current_size = inner.buf.len();
        }
        n
    }

    /// Drop everything queued
    pub fn clear(&self) {
        let mut inner = lock(&self.inner);
        inner.stats.consumed += inner.buf.len() as u64;
        inner.buf.clear();
        inner.stats.current_size = 0;
    }

    /// Snapshot of the queue statistics
    pub fn stats(&self) -> QueueStats {
        lock(&self.inner).stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peek_leaves_bytes() {
        let queue = ByteQueue::new();
        queue.push(b"hello");

        let mut out = [0u8; 3];
        assert_eq!(queue.copy_out(&mut out, false), 3);
        assert_eq!(&out, b"hel");
        assert_eq!(queue.len(), 5);
    }

    #[test]
    fn test_consuming_read_removes_prefix() {
        let queue = ByteQueue::new();
        queue.push(b"hello");
        queue.push(b" world");

        let mut out = [0u8; 6];
        assert_eq!(queue.copy_out(&mut out, true), 6);
        assert_eq!(&out, b"hello ");

        let mut rest = [0u8; 16];
        assert_eq!(queue.copy_out(&mut rest, true), 5);
        assert_eq!(&rest[..5], b"world");
        assert!(queue.is_empty());
    }

    #[test]
    fn test_stats_track_traffic() {
        let queue = ByteQueue::new();
        queue.push(&[0u8; 10]);
        let mut out = [0u8; 4];
        queue.copy_out(&mut out, true);
        queue.push(&[0u8; 2]);
        queue.clear();

        let stats = queue.stats();
        assert_eq!(stats.received, 12);
        assert_eq!(stats.consumed, 12);
        assert_eq!(stats.current_size, 0);
        assert_eq!(stats.peak_size, 10);
    }
}
