//! Client connector
//!
//! Keeps exactly one outbound connection alive. Connection attempts repeat
//! forever at a fixed delay. While connected, a handler task runs the
//! receive side and the connector itself drains the outbound channel onto
//! the socket until either side fails.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::bridge::Shared;
use crate::error::{BridgeError, Result};
use crate::handler::{DisconnectReason, Handler};
use crate::registry::Connection;
use crate::socket;

pub struct Connector {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connector")
            .field("server_address", &self.shared.config.client.server_address)
            .finish()
    }
}

impl Connector {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Connect, serve, and reconnect forever.
    pub async fn run(self) {
        let delay = Duration::from_millis(self.shared.config.client.reconnect_delay_ms);
        info!(
            addr = %self.shared.config.client.server_address,
            reconnect_delay_ms = delay.as_millis() as u64,
            "Client connector started"
        );

        loop {
            match self.run_once().await {
                Ok(reason) => info!(%reason, "Disconnected, reconnecting"),
                Err(e) => debug!(error = %e, "Connection attempt failed"),
            }
            tokio::time::sleep(delay).await;
        }
    }

    /// One `Connecting → Connected → Disconnected` cycle.
    ///
    /// Returns once the connection is gone and its receiver task has
    /// finished, or with `ResourceCreation` if the connect itself failed.
    pub async fn run_once(&self) -> Result<DisconnectReason> {
        let shared = &self.shared;
        let addr = &shared.config.client.server_address;
        let connect_timeout = Duration::from_millis(shared.config.client.connect_timeout_ms);

        shared.stats.record_connect_attempt();
        let stream = match tokio::time::timeout(connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                shared.stats.record_connect_failure();
                return Err(BridgeError::resource("connect", e));
            }
            Err(_) => {
                shared.stats.record_connect_failure();
                let e = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
                return Err(BridgeError::resource("connect", e));
            }
        };
        let peer = stream.peer_addr().map_err(|e| {
            shared.stats.record_connect_failure();
            BridgeError::resource("connect", e)
        })?;

        if let Err(e) = socket::apply_keepalive(&stream, &shared.config.keepalive()) {
            warn!(%peer, error = %e, "Failed to configure keepalive");
        }

        shared.inbound.reset();
        shared.outbound.reset();

        let (reader, writer) = stream.into_split();
        let conn = Arc::new(Connection::new(peer, writer, shared.send_timeout()));
        self.serve(conn, reader).await
    }

    /// Register `conn`, run its receiver and drain outbound onto it until
    /// either side stops, then tear it down.
    async fn serve<R>(&self, conn: Arc<Connection>, reader: R) -> Result<DisconnectReason>
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let shared = &self.shared;
        shared.admit(conn.clone(), false)?;
        info!(conn = %conn.id(), peer = %conn.peer(), "Successfully connected");

        let receiver = Handler::new(
            conn.clone(),
            reader,
            shared.registry.clone(),
            shared.inbound.clone(),
            shared.stats.clone(),
            shared.handler_settings(),
        )
        .spawn();

        if let Err(e) = self.send_loop(&conn).await {
            warn!(error = %e, "Sender stopped");
        }

        // Wakes the receiver if it is still waiting on the socket
        match shared.registry.remove(conn.id()) {
            Ok(_) | Err(BridgeError::NotFound(_)) => {}
            Err(e) => warn!(conn = %conn.id(), error = %e, "Failed to deregister connection"),
        }
        let reason = match receiver.await {
            Ok(reason) => reason,
            Err(e) => {
                warn!(conn = %conn.id(), error = %e, "Receiver task failed");
                DisconnectReason::Evicted
            }
        };
        conn.shutdown().await;

        info!(conn = %conn.id(), %reason, "Shutting down socket and restarting");
        Ok(reason)
    }

    async fn send_loop(&self, conn: &Connection) -> Result<()> {
        let shared = &self.shared;
        let chunk = shared.config.channels.send_chunk_size;
        let read_timeout = Duration::from_millis(shared.config.channels.broadcast_read_timeout_ms);

        loop {
            if conn.is_closing() || shared.registry.is_empty() {
                return Ok(());
            }

            let payload = tokio::select! {
                biased;
                _ = conn.closed() => return Ok(()),
                payload = shared.outbound.recv(chunk, read_timeout) => payload,
            };
            if payload.is_empty() {
                continue;
            }

            if let Err(e) = conn.send(&payload).await {
                shared.stats.record_send_failure();
                return Err(BridgeError::FatalConnection {
                    conn: conn.id(),
                    reason: e.to_string(),
                });
            }
            shared.stats.record_sent(payload.len());
        }
    }
}
