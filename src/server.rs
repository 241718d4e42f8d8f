//! Server listener
//!
//! Accepts inbound connections up to the registry capacity. Excess
//! connections are closed on accept rather than queued. Each admitted socket
//! is split and its read half moved into a dedicated handler task.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::bridge::Shared;
use crate::error::{BridgeError, Result};
use crate::handler::Handler;
use crate::registry::Connection;
use crate::socket;

/// A bound listener, ready to accept
pub struct Server {
    shared: Arc<Shared>,
    listener: TcpListener,
    local_addr: SocketAddr,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .finish()
    }
}

impl Server {
    pub(crate) fn bind(shared: Arc<Shared>) -> Result<Self> {
        let addr = shared.config.listen_addr()?;
        let backlog = shared.registry.capacity();

        let listener = socket::bind_listener(addr, backlog).map_err(|e| {
            error!(%addr, error = %e, "Socket unable to bind");
            BridgeError::resource("bind listener", e)
        })?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| BridgeError::resource("read listener address", e))?;

        info!(addr = %local_addr, max_clients = backlog, "Socket listening");
        Ok(Self {
            shared,
            listener,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept forever. Accept errors are logged and retried after a pause.
    pub async fn run(self) -> Result<()> {
        let retry_delay = Duration::from_millis(self.shared.config.server.accept_retry_delay_ms);

        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!(error = %e, "Unable to accept connection");
                    tokio::time::sleep(retry_delay).await;
                    continue;
                }
            };

            if self.shared.registry.is_full() {
                self.reject(stream, peer);
                continue;
            }
            self.accept(stream, peer);
        }
    }

    fn accept(&self, stream: TcpStream, peer: SocketAddr) {
        let shared = &self.shared;

        if let Err(e) = socket::apply_keepalive(&stream, &shared.config.keepalive()) {
            warn!(%peer, error = %e, "Failed to configure keepalive");
        }

        let (reader, writer) = stream.into_split();
        let conn = Arc::new(Connection::new(peer, writer, shared.send_timeout()));

        match shared.admit(conn.clone(), true) {
            Ok(admission) => {
                shared.stats.record_accepted();
                info!(conn = %conn.id(), %peer, total = admission.count, "Client connected");
                Handler::new(
                    conn,
                    reader,
                    shared.registry.clone(),
                    shared.inbound.clone(),
                    shared.stats.clone(),
                    shared.handler_settings(),
                )
                .spawn();
            }
            Err(BridgeError::CapacityExceeded { max }) => {
                shared.stats.record_rejected();
                warn!(%peer, max, "Max client limit reached, rejecting connection");
            }
            Err(e) => {
                warn!(%peer, error = %e, "Admission failed, closing connection");
            }
        }
    }

    fn reject(&self, stream: TcpStream, peer: SocketAddr) {
        self.shared.stats.record_rejected();
        warn!(
            %peer,
            max = self.shared.registry.capacity(),
            "Max client limit reached, rejecting connection"
        );
        drop(stream);
        debug!(%peer, "Rejected socket closed");
    }
}
