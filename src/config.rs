//! Bridge configuration

use std::fmt;
use std::net::SocketAddr;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BridgeConfig {
    #[serde(default)]
    pub bridge: ModeConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub channels: ChannelConfig,
    #[serde(default)]
    pub socket: SocketConfig,
}

/// Which side of the connection this device plays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Accept up to `max_clients` peers and broadcast to all of them
    #[default]
    Server,
    /// Keep one outbound connection alive, reconnecting forever
    Client,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Server => write!(f, "server"),
            Mode::Client => write!(f, "client"),
        }
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "server" => Ok(Mode::Server),
            "client" => Ok(Mode::Client),
            other => Err(format!("unknown mode '{}', expected 'server' or 'client'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModeConfig {
    #[serde(default)]
    pub mode: Mode,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address to bind the listener on
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Port to listen on (0 picks an ephemeral port)
    #[serde(default = "default_port")]
    pub listen_port: u16,

    /// Registry capacity; connections beyond this are closed on accept
    #[serde(default = "default_max_clients")]
    pub max_clients: usize,

    /// Pause after a failed accept before trying again
    #[serde(default = "default_accept_retry_delay")]
    pub accept_retry_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Peer to connect to, as `host:port`
    #[serde(default = "default_server_address")]
    pub server_address: String,

    /// Fixed delay between connection attempts
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_ms: u64,

    /// Upper bound on a single connect attempt
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Network → application channel capacity in bytes
    #[serde(default = "default_channel_capacity")]
    pub inbound_capacity: usize,

    /// Application → network channel capacity in bytes
    #[serde(default = "default_channel_capacity")]
    pub outbound_capacity: usize,

    /// Buffered byte count at which a waiting reader is woken
    #[serde(default = "default_trigger_threshold")]
    pub trigger_threshold: usize,

    /// Bounded wait when forwarding received bytes into a full inbound channel
    #[serde(default = "default_channel_write_timeout")]
    pub channel_write_timeout_ms: u64,

    /// Bounded wait for one outbound payload
    #[serde(default = "default_broadcast_read_timeout")]
    pub broadcast_read_timeout_ms: u64,

    /// Largest payload drained from the outbound channel at once
    #[serde(default = "default_send_chunk_size")]
    pub send_chunk_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SocketConfig {
    /// Seconds of idleness before the first keepalive probe
    #[serde(default = "default_keepalive_idle")]
    pub keepalive_idle_s: u64,

    /// Seconds between keepalive probes
    #[serde(default = "default_keepalive_interval")]
    pub keepalive_interval_s: u64,

    /// Unanswered probes before the peer is declared dead
    #[serde(default = "default_keepalive_probe_count")]
    pub keepalive_probe_count: u32,

    /// A receive with no data for this long counts as transient
    #[serde(default = "default_recv_timeout")]
    pub recv_timeout_s: u64,

    /// Upper bound on a single send; exceeding it is fatal for the connection
    #[serde(default = "default_send_timeout")]
    pub send_timeout_ms: u64,

    /// Transfer buffer size for one receive call
    #[serde(default = "default_recv_buffer_size")]
    pub recv_buffer_size: usize,

    /// Consecutive non-transient receive errors tolerated before teardown
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

// Defaults
fn default_listen_address() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_max_clients() -> usize { 3 }
fn default_accept_retry_delay() -> u64 { 1000 }
fn default_server_address() -> String { "192.168.0.100:8080".to_string() }
fn default_reconnect_delay() -> u64 { 500 }
fn default_connect_timeout() -> u64 { 5000 }
fn default_channel_capacity() -> usize { 500 }
fn default_trigger_threshold() -> usize { 15 }
fn default_channel_write_timeout() -> u64 { 10 }
fn default_broadcast_read_timeout() -> u64 { 100 }
fn default_send_chunk_size() -> usize { 100 }
fn default_keepalive_idle() -> u64 { 5 }
fn default_keepalive_interval() -> u64 { 3 }
fn default_keepalive_probe_count() -> u32 { 3 }
fn default_recv_timeout() -> u64 { 30 }
fn default_send_timeout() -> u64 { 5000 }
fn default_recv_buffer_size() -> usize { 128 }
fn default_max_consecutive_errors() -> u32 { 3 }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_address: default_listen_address(),
            listen_port: default_port(),
            max_clients: default_max_clients(),
            accept_retry_delay_ms: default_accept_retry_delay(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            server_address: default_server_address(),
            reconnect_delay_ms: default_reconnect_delay(),
            connect_timeout_ms: default_connect_timeout(),
        }
    }
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            inbound_capacity: default_channel_capacity(),
            outbound_capacity: default_channel_capacity(),
            trigger_threshold: default_trigger_threshold(),
            channel_write_timeout_ms: default_channel_write_timeout(),
            broadcast_read_timeout_ms: default_broadcast_read_timeout(),
            send_chunk_size: default_send_chunk_size(),
        }
    }
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            keepalive_idle_s: default_keepalive_idle(),
            keepalive_interval_s: default_keepalive_interval(),
            keepalive_probe_count: default_keepalive_probe_count(),
            recv_timeout_s: default_recv_timeout(),
            send_timeout_ms: default_send_timeout(),
            recv_buffer_size: default_recv_buffer_size(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

impl BridgeConfig {
    /// Parse a TOML document. Missing sections and fields take defaults.
    pub fn from_toml(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Load from a file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            tracing::info!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        Self::from_toml(&content)
            .with_context(|| format!("Failed to parse config {}", path.display()))
    }

    pub fn mode(&self) -> Mode {
        self.bridge.mode
    }

    /// Reject configurations the bridge cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let nonzero = [
            ("max_clients", self.server.max_clients),
            ("inbound_capacity", self.channels.inbound_capacity),
            ("outbound_capacity", self.channels.outbound_capacity),
            ("trigger_threshold", self.channels.trigger_threshold),
            ("send_chunk_size", self.channels.send_chunk_size),
            ("recv_buffer_size", self.socket.recv_buffer_size),
        ];
        for (name, value) in nonzero {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        // A zero wait turns the receive and drain loops into busy polls
        let timeouts = [
            ("recv_timeout_s", self.socket.recv_timeout_s),
            ("send_timeout_ms", self.socket.send_timeout_ms),
            ("channel_write_timeout_ms", self.channels.channel_write_timeout_ms),
            ("broadcast_read_timeout_ms", self.channels.broadcast_read_timeout_ms),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(ConfigError::Zero(name));
            }
        }

        let trigger = self.channels.trigger_threshold;
        for (channel, capacity) in [
            ("inbound", self.channels.inbound_capacity),
            ("outbound", self.channels.outbound_capacity),
        ] {
            if trigger > capacity {
                return Err(ConfigError::TriggerAboveCapacity {
                    channel,
                    trigger,
                    capacity,
                });
            }
        }

        if self.mode() == Mode::Client && self.client.server_address.rsplit_once(':').is_none() {
            return Err(ConfigError::InvalidAddress(self.client.server_address.clone()));
        }

        Ok(())
    }

    /// Local address the server listener binds to.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = format!("{}:{}", self.server.listen_address, self.server.listen_port);
        addr.parse().map_err(|_| ConfigError::InvalidAddress(addr))
    }

    pub fn keepalive(&self) -> KeepaliveParams {
        KeepaliveParams {
            idle: Duration::from_secs(self.socket.keepalive_idle_s),
            interval: Duration::from_secs(self.socket.keepalive_interval_s),
            probe_count: self.socket.keepalive_probe_count,
        }
    }
}

/// TCP keepalive tuning applied to every connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KeepaliveParams {
    pub idle: Duration,
    pub interval: Duration,
    pub probe_count: u32,
}

impl KeepaliveParams {
    /// Worst-case time to detect a silently dead peer.
    pub fn detection_latency(&self) -> Duration {
        self.idle + self.interval * self.probe_count
    }
}
