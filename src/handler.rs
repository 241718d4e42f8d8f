//! Per-connection handler
//!
//! Owns the read half of one socket. Received bytes are forwarded into the
//! inbound channel; when the loop ends the handler deregisters its
//! connection first and only then closes the socket, so the broadcast sender
//! can never pick up a half-closed connection from a snapshot.

use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::channel::ByteChannel;
use crate::config::BridgeConfig;
use crate::error::{classify, BridgeError, ErrorClass};
use crate::registry::{Connection, ConnectionRegistry};
use crate::stats::BridgeStats;

/// Receive-loop tuning
#[derive(Debug, Clone, Copy)]
pub struct HandlerSettings {
    pub recv_buffer_size: usize,
    pub recv_timeout: Duration,
    pub channel_write_timeout: Duration,
    pub max_consecutive_errors: u32,
}

impl HandlerSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            recv_buffer_size: config.socket.recv_buffer_size,
            recv_timeout: Duration::from_secs(config.socket.recv_timeout_s),
            channel_write_timeout: Duration::from_millis(config.channels.channel_write_timeout_ms),
            max_consecutive_errors: config.socket.max_consecutive_errors,
        }
    }
}

/// Why a receive loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// recv returned 0
    PeerClosed,
    /// Removed from the registry by another task
    Evicted,
    /// Non-retryable socket error
    Fatal(io::ErrorKind),
    /// Consecutive retryable errors exceeded the threshold
    TooManyErrors(u32),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => write!(f, "peer closed the connection"),
            Self::Evicted => write!(f, "removed from registry"),
            Self::Fatal(kind) => write!(f, "fatal socket error ({})", kind),
            Self::TooManyErrors(n) => write!(f, "{} consecutive receive errors", n),
        }
    }
}

/// Receive loop for one connection
pub struct Handler<R> {
    conn: Arc<Connection>,
    reader: R,
    registry: Arc<ConnectionRegistry>,
    inbound: Arc<ByteChannel>,
    stats: Arc<BridgeStats>,
    settings: HandlerSettings,
}

impl<R> Handler<R>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(
        conn: Arc<Connection>,
        reader: R,
        registry: Arc<ConnectionRegistry>,
        inbound: Arc<ByteChannel>,
        stats: Arc<BridgeStats>,
        settings: HandlerSettings,
    ) -> Self {
        Self {
            conn,
            reader,
            registry,
            inbound,
            stats,
            settings,
        }
    }

    pub fn spawn(self) -> JoinHandle<DisconnectReason> {
        tokio::spawn(self.run())
    }

    /// Run until the peer goes away, then deregister and close.
    pub async fn run(self) -> DisconnectReason {
        let Handler {
            conn,
            mut reader,
            registry,
            inbound,
            stats,
            settings,
        } = self;

        stats.handler_started();
        let id = conn.id();
        debug!(conn = %id, peer = %conn.peer(), "Receiver started");

        let mut buf = vec![0u8; settings.recv_buffer_size.max(1)];
        let mut consecutive_errors = 0u32;

        let reason = loop {
            let read = tokio::select! {
                biased;
                _ = conn.closed() => break DisconnectReason::Evicted,
                read = tokio::time::timeout(settings.recv_timeout, reader.read(&mut buf)) => read,
            };

            let result = match read {
                Ok(result) => result,
                Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "receive timed out")),
            };

            match result {
                Ok(0) => break DisconnectReason::PeerClosed,
                Ok(n) => {
                    consecutive_errors = 0;
                    stats.record_received(n);
                    forward(&inbound, &stats, &buf[..n], settings.channel_write_timeout, &conn)
                        .await;
                }
                Err(e) => match classify(&e) {
                    ErrorClass::Transient => {
                        trace!(conn = %id, error = %BridgeError::TransientNetwork(e), "No data");
                        consecutive_errors = 0;
                    }
                    ErrorClass::Fatal => break DisconnectReason::Fatal(e.kind()),
                    ErrorClass::Retryable => {
                        consecutive_errors += 1;
                        warn!(conn = %id, error = %e, consecutive_errors, "Receive error");
                        if consecutive_errors > settings.max_consecutive_errors {
                            break DisconnectReason::TooManyErrors(consecutive_errors);
                        }
                    }
                },
            }
        };

        match registry.remove(id) {
            Ok(_) | Err(BridgeError::NotFound(_)) => {}
            Err(e) => warn!(conn = %id, error = %e, "Failed to deregister connection"),
        }
        conn.shutdown().await;
        drop(reader);

        info!(conn = %id, peer = %conn.peer(), %reason, "Receiver finished");
        stats.handler_finished();
        reason
    }
}

/// Push received bytes into the inbound channel, counting anything that does
/// not fit before the timeout.
async fn forward(
    inbound: &ByteChannel,
    stats: &BridgeStats,
    data: &[u8],
    timeout: Duration,
    conn: &Connection,
) {
    match inbound.send(data, timeout).await {
        Ok(_) => {}
        Err(BridgeError::ChannelFull { written, requested }) => {
            let dropped = requested - written;
            stats.record_dropped(dropped);
            warn!(conn = %conn.id(), dropped, "Inbound channel full, bytes dropped");
        }
        Err(e) => warn!(conn = %conn.id(), error = %e, "Inbound forward failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn settings() -> HandlerSettings {
        HandlerSettings {
            recv_buffer_size: 16,
            recv_timeout: Duration::from_millis(50),
            channel_write_timeout: Duration::from_millis(10),
            max_consecutive_errors: 3,
        }
    }

    struct Fixture {
        conn: Arc<Connection>,
        registry: Arc<ConnectionRegistry>,
        inbound: Arc<ByteChannel>,
        stats: Arc<BridgeStats>,
    }

    fn fixture(inbound_capacity: usize) -> Fixture {
        let conn = Arc::new(Connection::new(
            "127.0.0.1:9".parse().unwrap(),
            tokio::io::sink(),
            Duration::from_secs(1),
        ));
        let registry = Arc::new(ConnectionRegistry::new(3));
        registry.add(conn.clone()).unwrap();
        Fixture {
            conn,
            registry,
            inbound: Arc::new(ByteChannel::new(inbound_capacity, 1)),
            stats: Arc::new(BridgeStats::new()),
        }
    }

    fn handler<R: AsyncRead + Unpin + Send + 'static>(f: &Fixture, reader: R) -> Handler<R> {
        Handler::new(
            f.conn.clone(),
            reader,
            f.registry.clone(),
            f.inbound.clone(),
            f.stats.clone(),
            settings(),
        )
    }

    #[tokio::test]
    async fn test_forwards_bytes_then_deregisters_on_eof() {
        let f = fixture(64);
        let (mut peer, local) = tokio::io::duplex(64);
        let task = handler(&f, local).spawn();

        peer.write_all(b"ping").await.unwrap();
        let got = f.inbound.recv(64, Duration::from_secs(1)).await;
        assert_eq!(&got[..], b"ping");

        drop(peer);
        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::PeerClosed);
        assert_eq!(f.registry.count(), 0);
        assert!(f.conn.is_closing());
        assert_eq!(f.stats.snapshot().active_handlers, 0);
    }

    #[tokio::test]
    async fn test_single_byte_chunk_is_forwarded() {
        let f = fixture(64);
        let (mut peer, local) = tokio::io::duplex(64);
        let _task = handler(&f, local).spawn();

        peer.write_all(b"x").await.unwrap();
        let got = f.inbound.recv(64, Duration::from_secs(1)).await;
        assert_eq!(&got[..], b"x");
    }

    #[tokio::test]
    async fn test_receive_timeout_is_not_fatal() {
        let f = fixture(64);
        let (mut peer, local) = tokio::io::duplex(64);
        let task = handler(&f, local).spawn();

        // Several receive timeouts elapse before data arrives
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!task.is_finished());

        peer.write_all(b"late").await.unwrap();
        let got = f.inbound.recv(64, Duration::from_secs(1)).await;
        assert_eq!(&got[..], b"late");
        assert_eq!(f.registry.count(), 1);
    }

    #[tokio::test]
    async fn test_eviction_stops_receiver() {
        let f = fixture(64);
        let (_peer, local) = tokio::io::duplex(64);
        let task = handler(&f, local).spawn();

        f.registry.remove(f.conn.id()).unwrap();
        let reason = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reason, DisconnectReason::Evicted);
    }

    #[tokio::test]
    async fn test_full_inbound_channel_counts_dropped_bytes() {
        let f = fixture(4);
        let (mut peer, local) = tokio::io::duplex(64);
        let _task = handler(&f, local).spawn();

        peer.write_all(b"0123456789").await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(f.inbound.len(), 4);
        assert_eq!(f.stats.snapshot().inbound_bytes_dropped, 6);
        assert_eq!(f.stats.snapshot().bytes_received, 10);
    }

    /// Reader that fails with the same error forever
    struct FailingReader(io::ErrorKind);

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: std::pin::Pin<&mut Self>,
            _cx: &mut std::task::Context<'_>,
            _buf: &mut tokio::io::ReadBuf<'_>,
        ) -> std::task::Poll<io::Result<()>> {
            std::task::Poll::Ready(Err(io::Error::from(self.0)))
        }
    }

    #[tokio::test]
    async fn test_retryable_errors_hit_threshold() {
        let f = fixture(64);
        let reason = handler(&f, FailingReader(io::ErrorKind::Other)).run().await;
        assert_eq!(reason, DisconnectReason::TooManyErrors(4));
        assert_eq!(f.registry.count(), 0);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_immediately() {
        let f = fixture(64);
        let reason = handler(&f, FailingReader(io::ErrorKind::ConnectionReset)).run().await;
        assert_eq!(reason, DisconnectReason::Fatal(io::ErrorKind::ConnectionReset));
    }
}
