//! Error taxonomy for the bridge
//!
//! Errors are resolved by the task that owns the affected resource. A fatal
//! error on one connection tears down exactly that connection and is never
//! propagated to other connections or to the channel consumers.

use std::io;

use crate::registry::ConnectionId;

/// Bridge errors
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    /// Admission denied because the registry is full
    #[error("Capacity exceeded: registry holds {max} connections")]
    CapacityExceeded { max: usize },

    /// Connection not present in the registry
    #[error("Connection {0} not found")]
    NotFound(ConnectionId),

    /// Connection is already registered
    #[error("Connection {0} already registered")]
    AlreadyRegistered(ConnectionId),

    /// Retryable I/O condition (would-block, receive timeout)
    #[error("Transient network error: {0}")]
    TransientNetwork(#[source] io::Error),

    /// Peer closed, unrecoverable send, or error threshold exceeded
    #[error("Fatal error on connection {conn}: {reason}")]
    FatalConnection { conn: ConnectionId, reason: String },

    /// Socket, bind, listen or connect failure
    #[error("Failed to {op}: {source}")]
    ResourceCreation {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    /// Bounded channel write did not complete before its timeout
    #[error("Channel full: wrote {written} of {requested} bytes")]
    ChannelFull { written: usize, requested: usize },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl BridgeError {
    /// Wrap an I/O error raised while creating a socket resource.
    pub fn resource(op: &'static str, source: io::Error) -> Self {
        Self::ResourceCreation { op, source }
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),

    #[error("trigger_threshold ({trigger}) exceeds {channel} capacity ({capacity})")]
    TriggerAboveCapacity {
        channel: &'static str,
        trigger: usize,
        capacity: usize,
    },

    #[error("Invalid server address: {0}")]
    InvalidAddress(String),
}

pub type Result<T> = std::result::Result<T, BridgeError>;

/// How a failed socket operation should be treated by its owning loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// No data right now; not counted against the error threshold
    Transient,
    /// Unexpected but possibly recoverable; counted against the threshold
    Retryable,
    /// The connection is gone
    Fatal,
}

/// Classify an I/O error from a stream socket.
pub fn classify(err: &io::Error) -> ErrorClass {
    use io::ErrorKind::*;

    match err.kind() {
        WouldBlock | TimedOut => ErrorClass::Transient,
        ConnectionReset | ConnectionAborted | BrokenPipe | NotConnected | UnexpectedEof
        | WriteZero => ErrorClass::Fatal,
        _ => ErrorClass::Retryable,
    }
}
