//! Broadcast sender
//!
//! One task per occupancy period of the registry. It drains the outbound
//! channel and sends every payload to each registered connection in
//! snapshot order. Failed connections are collected during the pass and
//! removed afterwards, so a failure never shifts the iteration or blocks
//! delivery to the remaining connections.
//!
//! A sender is tied to the registry epoch it was spawned for and exits once
//! the registry empties or a newer epoch begins. A replacement waits for its
//! predecessor to finish before draining, so there is never more than one
//! reader on the outbound channel.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::channel::ByteChannel;
use crate::config::BridgeConfig;
use crate::error::BridgeError;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::stats::BridgeStats;

#[derive(Debug, Clone, Copy)]
pub struct SenderSettings {
    pub chunk_size: usize,
    pub read_timeout: Duration,
}

impl SenderSettings {
    pub fn from_config(config: &BridgeConfig) -> Self {
        Self {
            chunk_size: config.channels.send_chunk_size,
            read_timeout: Duration::from_millis(config.channels.broadcast_read_timeout_ms),
        }
    }
}

/// Outcome of sending one payload to a snapshot
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<ConnectionId>,
}

pub struct BroadcastSender {
    epoch: u64,
    registry: Arc<ConnectionRegistry>,
    outbound: Arc<ByteChannel>,
    stats: Arc<BridgeStats>,
    settings: SenderSettings,
}

impl BroadcastSender {
    pub fn new(
        epoch: u64,
        registry: Arc<ConnectionRegistry>,
        outbound: Arc<ByteChannel>,
        stats: Arc<BridgeStats>,
        settings: SenderSettings,
    ) -> Self {
        Self {
            epoch,
            registry,
            outbound,
            stats,
            settings,
        }
    }

    /// Spawn the sender, chained after `previous` if one is still winding down.
    pub fn spawn(self, previous: Option<JoinHandle<()>>) -> JoinHandle<()> {
        self.stats.record_sender_spawn();
        tokio::spawn(async move {
            if let Some(previous) = previous {
                if let Err(e) = previous.await {
                    warn!(error = %e, "Previous broadcast sender failed");
                }
            }
            self.run().await;
        })
    }

    pub async fn run(self) {
        info!(epoch = self.epoch, "Broadcast sender started");

        while self.registry.sender_should_run(self.epoch) {
            let payload = self
                .outbound
                .recv(self.settings.chunk_size, self.settings.read_timeout)
                .await;
            if payload.is_empty() {
                continue;
            }

            let report = broadcast(&self.registry, &self.stats, &payload).await;
            if report.delivered == 0 && report.failed.is_empty() {
                debug!(bytes = payload.len(), "No connections left, payload discarded");
            }
        }

        info!(epoch = self.epoch, "Broadcast sender finished");
    }
}

/// Send `payload` to every registered connection, then drop the ones that failed.
pub async fn broadcast(
    registry: &ConnectionRegistry,
    stats: &BridgeStats,
    payload: &[u8],
) -> BroadcastReport {
    let snapshot = registry.snapshot();
    let mut report = BroadcastReport::default();

    for conn in &snapshot {
        match conn.send(payload).await {
            Ok(()) => {
                report.delivered += 1;
                stats.record_sent(payload.len());
            }
            Err(e) => {
                warn!(conn = %conn.id(), peer = %conn.peer(), error = %e, "Send failed");
                stats.record_send_failure();
                report.failed.push(conn.id());
            }
        }
    }

    for id in &report.failed {
        // The handler may have removed it already
        match registry.remove(*id) {
            Ok(_) | Err(BridgeError::NotFound(_)) => {}
            Err(e) => warn!(conn = %id, error = %e, "Failed to remove connection"),
        }
    }

    report
}
