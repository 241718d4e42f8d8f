//! Connection registry
//!
//! Bounded set of live connections shared by the listener/connector, the
//! per-connection handlers and the broadcast sender. Every mutation and every
//! broadcast snapshot takes the same lock; `count()` is a lock-free read used
//! only for early capacity checks, and admission re-checks under the lock.
//!
//! ## Connections
//!
//! A [`Connection`] is the shared handle to one socket. Its read half never
//! lives here: it is moved into the handler task that owns the receive loop.
//! The write half sits behind an async mutex so the broadcast sender can send
//! on it while the handler keeps exclusive ownership of teardown.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::Notify;
use tracing::{debug, info};

use crate::error::{BridgeError, Result};
use crate::state::{ConnectionState, StateObserver, StatePublisher};

/// Process-unique connection identity, never reused
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Shared handle to one live socket
pub struct Connection {
    id: ConnectionId,
    peer: SocketAddr,
    writer: tokio::sync::Mutex<Option<BoxWriter>>,
    send_timeout: Duration,
    closing: AtomicBool,
    closing_notify: Notify,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .field("closing", &self.is_closing())
            .finish()
    }
}

impl Connection {
    pub fn new(
        peer: SocketAddr,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        send_timeout: Duration,
    ) -> Self {
        Self {
            id: ConnectionId::next(),
            peer,
            writer: tokio::sync::Mutex::new(Some(Box::new(writer))),
            send_timeout,
            closing: AtomicBool::new(false),
            closing_notify: Notify::new(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    /// Move to `Closing` and wake whoever waits in [`closed`](Self::closed).
    pub fn mark_closing(&self) {
        self.closing.store(true, Ordering::Release);
        self.closing_notify.notify_waiters();
    }

    /// Resolve once the connection is marked `Closing`.
    pub async fn closed(&self) {
        loop {
            let notified = self.closing_notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_closing() {
                return;
            }
            notified.await;
        }
    }

    /// Write the whole payload, bounded by the send timeout.
    pub async fn send(&self, data: &[u8]) -> io::Result<()> {
        if self.is_closing() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "connection closing"));
        }

        let mut guard = self.writer.lock().await;
        let writer = guard
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "socket closed"))?;

        let write = async {
            writer.write_all(data).await?;
            writer.flush().await
        };
        match tokio::time::timeout(self.send_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "send timed out")),
        }
    }

    /// Shut down and release the write half.
    ///
    /// Called by the owning task after the registry entry is gone.
    pub async fn shutdown(&self) {
        self.mark_closing();
        let writer = self.writer.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.shutdown().await {
                debug!(conn = %self.id, error = %e, "Socket shutdown failed");
            }
        }
    }
}

/// Result of a successful [`ConnectionRegistry::add`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    /// Registry size after the add
    pub count: usize,
    /// True on the 0 → 1 transition
    pub first: bool,
    /// Sender epoch this connection belongs to
    pub epoch: u64,
}

struct Inner {
    conns: Vec<Arc<Connection>>,
    epoch: u64,
}

/// Bounded registry of live connections
pub struct ConnectionRegistry {
    inner: Mutex<Inner>,
    count: AtomicUsize,
    capacity: usize,
    publisher: StatePublisher,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("count", &self.count())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl ConnectionRegistry {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                conns: Vec::with_capacity(capacity),
                epoch: 0,
            }),
            count: AtomicUsize::new(0),
            capacity,
            publisher: StatePublisher::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lock-free size. May lag a concurrent add/remove.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.count() == 0
    }

    pub fn is_full(&self) -> bool {
        self.count() >= self.capacity
    }

    /// Admit a connection if there is room.
    pub fn add(&self, conn: Arc<Connection>) -> Result<Admission> {
        let id = conn.id();
        let admission = {
            let mut inner = self.lock();
            if inner.conns.iter().any(|c| c.id() == id) {
                return Err(BridgeError::AlreadyRegistered(id));
            }
            if inner.conns.len() >= self.capacity {
                return Err(BridgeError::CapacityExceeded { max: self.capacity });
            }

            inner.conns.push(conn);
            let count = inner.conns.len();
            let first = count == 1;
            if first {
                inner.epoch += 1;
            }
            self.count.store(count, Ordering::Release);
            self.publisher.publish(count);

            Admission {
                count,
                first,
                epoch: inner.epoch,
            }
        };

        info!(conn = %id, count = admission.count, "Connection registered");
        Ok(admission)
    }

    /// Remove a connection and mark it `Closing`.
    ///
    /// The socket itself is closed by the task that owns it.
    pub fn remove(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        let (conn, count) = {
            let mut inner = self.lock();
            let Some(pos) = inner.conns.iter().position(|c| c.id() == id) else {
                return Err(BridgeError::NotFound(id));
            };

            let conn = inner.conns.swap_remove(pos);
            let count = inner.conns.len();
            self.count.store(count, Ordering::Release);
            self.publisher.publish(count);
            (conn, count)
        };

        conn.mark_closing();
        info!(conn = %id, count, "Connection removed");
        Ok(conn)
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().conns.iter().any(|c| c.id() == id)
    }

    /// Current members, taken under the registry lock.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        self.lock().conns.clone()
    }

    /// Whether a broadcast sender started for `epoch` should keep running.
    pub fn sender_should_run(&self, epoch: u64) -> bool {
        let inner = self.lock();
        !inner.conns.is_empty() && inner.epoch == epoch
    }

    pub fn epoch(&self) -> u64 {
        self.lock().epoch
    }

    pub fn state(&self) -> ConnectionState {
        self.publisher.current()
    }

    pub fn subscribe(&self) -> StateObserver {
        self.publisher.subscribe()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}
