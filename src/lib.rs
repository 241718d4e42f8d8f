//! socket-bridge: TCP transport bridge between network peers and an
//! application's byte channels
//!
//! In server mode the bridge accepts up to `max_clients` peers, forwards
//! everything they send into one inbound channel, and broadcasts everything
//! the application writes to the outbound channel to all of them. In client
//! mode it keeps a single outbound connection alive and reconnects forever.
//!
//! The application only ever sees [`AppEndpoints`]: two bounded
//! [`ByteChannel`]s and a [`StateObserver`] carrying `{count, connected}`.

pub mod bridge;
pub mod broadcast;
pub mod channel;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod registry;
pub mod server;
pub mod socket;
pub mod state;
pub mod stats;

pub use bridge::{AppEndpoints, Bridge, StartupHook};
pub use channel::ByteChannel;
pub use client::Connector;
pub use config::{BridgeConfig, KeepaliveParams, Mode};
pub use error::{BridgeError, ConfigError, ErrorClass, Result};
pub use handler::DisconnectReason;
pub use registry::{ConnectionId, ConnectionRegistry};
pub use server::Server;
pub use state::{ConnectionState, StateObserver};
pub use stats::StatsSnapshot;
