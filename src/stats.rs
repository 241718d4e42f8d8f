//! Bridge counters
//!
//! Lock-free counters updated from every task. Dropped inbound bytes are
//! surfaced here rather than swallowed.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Debug, Default)]
pub struct BridgeStats {
    bytes_received: AtomicU64,
    bytes_sent: AtomicU64,
    inbound_bytes_dropped: AtomicU64,
    connections_accepted: AtomicU64,
    connections_rejected: AtomicU64,
    send_failures: AtomicU64,
    connect_attempts: AtomicU64,
    connect_failures: AtomicU64,
    sender_spawns: AtomicU64,
    active_handlers: AtomicU64,
}

/// Point-in-time copy of [`BridgeStats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub inbound_bytes_dropped: u64,
    pub connections_accepted: u64,
    pub connections_rejected: u64,
    pub send_failures: u64,
    pub connect_attempts: u64,
    pub connect_failures: u64,
    pub sender_spawns: u64,
    pub active_handlers: u64,
}

impl BridgeStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_received(&self, n: usize) {
        self.bytes_received.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, n: usize) {
        self.bytes_sent.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, n: usize) {
        self.inbound_bytes_dropped.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub fn record_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.connections_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_send_failure(&self) {
        self.send_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_attempt(&self) {
        self.connect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connect_failure(&self) {
        self.connect_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_sender_spawn(&self) {
        self.sender_spawns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_started(&self) {
        self.active_handlers.fetch_add(1, Ordering::Relaxed);
    }

    pub fn handler_finished(&self) {
        self.active_handlers.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            inbound_bytes_dropped: self.inbound_bytes_dropped.load(Ordering::Relaxed),
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_rejected: self.connections_rejected.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            connect_attempts: self.connect_attempts.load(Ordering::Relaxed),
            connect_failures: self.connect_failures.load(Ordering::Relaxed),
            sender_spawns: self.sender_spawns.load(Ordering::Relaxed),
            active_handlers: self.active_handlers.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate() {
        let stats = BridgeStats::new();
        stats.record_received(10);
        stats.record_received(5);
        stats.record_dropped(3);
        stats.handler_started();
        stats.handler_started();
        stats.handler_finished();

        let snap = stats.snapshot();
        assert_eq!(snap.bytes_received, 15);
        assert_eq!(snap.inbound_bytes_dropped, 3);
        assert_eq!(snap.active_handlers, 1);
        assert_eq!(snap.bytes_sent, 0);
    }
}
