//! Bounded byte channel
//!
//! A fixed-capacity byte queue shared between the network side and the
//! application side. Writers wake a waiting reader once at least `trigger`
//! bytes are buffered, or immediately on [`ByteChannel::flush`]. A reader
//! whose timeout expires takes whatever is buffered, so small writes are
//! still delivered within one read timeout.
//!
//! Writes never truncate silently: bytes that cannot be queued before the
//! write timeout are reported back through [`BridgeError::ChannelFull`].

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::error::{BridgeError, Result};

struct Inner {
    buf: VecDeque<u8>,
    /// Set by `flush`, cleared by the next read
    flushed: bool,
}

pub struct ByteChannel {
    inner: Mutex<Inner>,
    capacity: usize,
    trigger: usize,
    readable: Notify,
    writable: Notify,
}

impl std::fmt::Debug for ByteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ByteChannel")
            .field("capacity", &self.capacity)
            .field("trigger", &self.trigger)
            .field("len", &self.len())
            .finish()
    }
}

impl ByteChannel {
    /// Create a channel holding at most `capacity` bytes.
    ///
    /// `trigger` is clamped into `1..=capacity`.
    pub fn new(capacity: usize, trigger: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                buf: VecDeque::with_capacity(capacity),
                flushed: false,
            }),
            capacity,
            trigger: trigger.clamp(1, capacity),
            readable: Notify::new(),
            writable: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn trigger(&self) -> usize {
        self.trigger
    }

    /// Bytes currently buffered.
    pub fn len(&self) -> usize {
        self.lock().buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Discard all buffered bytes.
    pub fn reset(&self) {
        {
            let mut inner = self.lock();
            inner.buf.clear();
            inner.flushed = false;
        }
        self.writable.notify_waiters();
    }

    /// Wake a waiting reader even if fewer than `trigger` bytes are buffered.
    pub fn flush(&self) {
        self.lock().flushed = true;
        self.readable.notify_waiters();
    }

    /// Queue all of `data`, waiting up to `timeout` for space.
    ///
    /// Returns the number of bytes written, which is always `data.len()` on
    /// success. If the deadline passes first, the bytes already queued stay
    /// queued and the shortfall is returned as `ChannelFull`.
    pub async fn send(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        let deadline = Instant::now() + timeout;
        let mut written = 0;

        while written < data.len() {
            let notified = self.writable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wake_reader = {
                let mut inner = self.lock();
                let space = self.capacity - inner.buf.len();
                let n = space.min(data.len() - written);
                inner.buf.extend(&data[written..written + n]);
                written += n;
                n > 0 && inner.buf.len() >= self.trigger
            };
            if wake_reader {
                self.readable.notify_waiters();
            }
            if written == data.len() {
                break;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return Err(BridgeError::ChannelFull {
                    written,
                    requested: data.len(),
                });
            }
        }

        Ok(written)
    }

    /// [`send`](Self::send) followed by [`flush`](Self::flush).
    pub async fn send_and_flush(&self, data: &[u8], timeout: Duration) -> Result<usize> {
        let result = self.send(data, timeout).await;
        self.flush();
        result
    }

    /// Take up to `max` bytes.
    ///
    /// Returns as soon as `trigger` bytes are buffered or a flush is pending.
    /// When `timeout` expires the call returns whatever is buffered, which may
    /// be nothing.
    pub async fn recv(&self, max: usize, timeout: Duration) -> Bytes {
        let deadline = Instant::now() + timeout;

        loop {
            let notified = self.readable.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(chunk) = self.take_if(max, |inner| {
                inner.flushed || inner.buf.len() >= self.trigger
            }) {
                return chunk;
            }

            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return self.take_if(max, |_| true).unwrap_or_default();
            }
        }
    }

    /// Take up to `max` bytes without waiting.
    pub fn try_recv(&self, max: usize) -> Bytes {
        self.take_if(max, |_| true).unwrap_or_default()
    }

    fn take_if(&self, max: usize, ready: impl Fn(&Inner) -> bool) -> Option<Bytes> {
        let chunk = {
            let mut inner = self.lock();
            if inner.buf.is_empty() || !ready(&*inner) {
                return None;
            }
            let n = max.min(inner.buf.len());
            let chunk: Vec<u8> = inner.buf.drain(..n).collect();
            if inner.buf.is_empty() {
                inner.flushed = false;
            }
            chunk
        };
        self.writable.notify_waiters();
        Some(Bytes::from(chunk))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // Critical sections never panic, so a poisoned lock still holds
        // a consistent buffer.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const SHORT: Duration = Duration::from_millis(20);

    #[tokio::test]
    async fn test_send_then_recv_above_trigger() {
        let ch = ByteChannel::new(64, 4);
        ch.send(b"hello", SHORT).await.unwrap();

        let got = ch.recv(64, Duration::from_secs(1)).await;
        assert_eq!(&got[..], b"hello");
        assert!(ch.is_empty());
    }

    #[tokio::test]
    async fn test_recv_below_trigger_returns_on_timeout() {
        let ch = ByteChannel::new(64, 15);
        ch.send(b"a", SHORT).await.unwrap();

        let start = Instant::now();
        let got = ch.recv(64, Duration::from_millis(50)).await;
        assert_eq!(&got[..], b"a");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_flush_wakes_reader_below_trigger() {
        let ch = Arc::new(ByteChannel::new(64, 15));
        let reader = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.recv(64, Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        ch.send_and_flush(b"hi", SHORT).await.unwrap();

        let got = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .expect("flush did not wake reader")
            .unwrap();
        assert_eq!(&got[..], b"hi");
    }

    #[tokio::test]
    async fn test_empty_recv_times_out_empty() {
        let ch = ByteChannel::new(8, 1);
        let got = ch.recv(8, Duration::from_millis(10)).await;
        assert!(got.is_empty());
    }

    #[tokio::test]
    async fn test_recv_respects_max() {
        let ch = ByteChannel::new(64, 1);
        ch.send(b"0123456789", SHORT).await.unwrap();

        assert_eq!(&ch.recv(4, SHORT).await[..], b"0123");
        assert_eq!(&ch.recv(4, SHORT).await[..], b"4567");
        assert_eq!(&ch.recv(4, SHORT).await[..], b"89");
    }

    #[tokio::test]
    async fn test_full_channel_reports_shortfall() {
        let ch = ByteChannel::new(8, 1);
        let err = ch.send(b"0123456789", SHORT).await.unwrap_err();

        match err {
            BridgeError::ChannelFull { written, requested } => {
                assert_eq!(written, 8);
                assert_eq!(requested, 10);
            }
            other => panic!("expected ChannelFull, got {other:?}"),
        }
        assert_eq!(ch.len(), 8);
    }

    #[tokio::test]
    async fn test_blocked_writer_resumes_when_reader_drains() {
        let ch = Arc::new(ByteChannel::new(4, 1));
        ch.send(b"abcd", SHORT).await.unwrap();

        let writer = {
            let ch = ch.clone();
            tokio::spawn(async move { ch.send(b"ef", Duration::from_secs(2)).await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(&ch.try_recv(4)[..], b"abcd");

        assert_eq!(writer.await.unwrap().unwrap(), 2);
        assert_eq!(&ch.try_recv(4)[..], b"ef");
    }

    #[tokio::test]
    async fn test_reset_discards_buffered_bytes() {
        let ch = ByteChannel::new(16, 1);
        ch.send(b"stale", SHORT).await.unwrap();
        ch.reset();

        assert!(ch.is_empty());
        assert!(ch.recv(16, Duration::from_millis(5)).await.is_empty());
    }

    #[test]
    fn test_trigger_clamped_to_capacity() {
        assert_eq!(ByteChannel::new(10, 50).trigger(), 10);
        assert_eq!(ByteChannel::new(10, 0).trigger(), 1);
    }
}
