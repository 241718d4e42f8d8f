//! Bridge assembly
//!
//! [`Bridge`] owns everything the two modes share: the registry, both byte
//! channels, the stats, and the startup hook. Server and client mode differ
//! only in who creates connections and who drains the outbound channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::info;

use crate::broadcast::{BroadcastSender, SenderSettings};
use crate::channel::ByteChannel;
use crate::client::Connector;
use crate::config::{BridgeConfig, Mode};
use crate::error::Result;
use crate::handler::HandlerSettings;
use crate::registry::{Admission, Connection, ConnectionRegistry};
use crate::server::Server;
use crate::state::StateObserver;
use crate::stats::{BridgeStats, StatsSnapshot};

/// Invoked on every 0 → 1 connection transition so the application layer
/// can reinitialize its protocol state.
pub trait StartupHook: Send + Sync + 'static {
    fn on_first_connection(&self);
}

impl<F> StartupHook for F
where
    F: Fn() + Send + Sync + 'static,
{
    fn on_first_connection(&self) {
        self()
    }
}

/// What the application layer holds on to
#[derive(Debug, Clone)]
pub struct AppEndpoints {
    /// Bytes received from the network
    pub inbound: Arc<ByteChannel>,
    /// Bytes to send to the network (to every client in server mode)
    pub outbound: Arc<ByteChannel>,
    /// Latest `{count, connected}`
    pub state: StateObserver,
}

pub(crate) struct Shared {
    pub(crate) config: BridgeConfig,
    pub(crate) registry: Arc<ConnectionRegistry>,
    pub(crate) inbound: Arc<ByteChannel>,
    pub(crate) outbound: Arc<ByteChannel>,
    pub(crate) stats: Arc<BridgeStats>,
    hook: Box<dyn StartupHook>,
    sender_task: Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    pub(crate) fn handler_settings(&self) -> HandlerSettings {
        HandlerSettings::from_config(&self.config)
    }

    pub(crate) fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.config.socket.send_timeout_ms)
    }

    /// Register a new connection and run the first-connection side effects.
    ///
    /// With `fan_out` set (server mode) the first connection also resets the
    /// outbound channel and starts a fresh broadcast sender.
    pub(crate) fn admit(&self, conn: Arc<Connection>, fan_out: bool) -> Result<Admission> {
        let admission = self.registry.add(conn)?;

        if admission.first {
            self.hook.on_first_connection();
            if fan_out {
                self.outbound.reset();
                self.spawn_sender(admission.epoch);
            }
        }

        Ok(admission)
    }

    fn spawn_sender(&self, epoch: u64) {
        let mut slot = self.sender_task.lock().unwrap_or_else(|e| e.into_inner());
        let previous = slot.take();
        let sender = BroadcastSender::new(
            epoch,
            self.registry.clone(),
            self.outbound.clone(),
            self.stats.clone(),
            SenderSettings::from_config(&self.config),
        );
        *slot = Some(sender.spawn(previous));
    }

    fn sender_active(&self) -> bool {
        self.sender_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|task| !task.is_finished())
    }
}

/// TCP bridge between network peers and the application's byte channels
#[derive(Clone)]
pub struct Bridge {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("mode", &self.shared.config.mode())
            .field("registry", &self.shared.registry)
            .finish()
    }
}

impl Bridge {
    /// Validate `config` and build the bridge.
    pub fn new(config: BridgeConfig, hook: impl StartupHook) -> Result<Self> {
        config.validate()?;

        let capacity = match config.mode() {
            Mode::Server => config.server.max_clients,
            Mode::Client => 1,
        };
        let trigger = config.channels.trigger_threshold;

        let shared = Shared {
            registry: Arc::new(ConnectionRegistry::new(capacity)),
            inbound: Arc::new(ByteChannel::new(config.channels.inbound_capacity, trigger)),
            outbound: Arc::new(ByteChannel::new(config.channels.outbound_capacity, trigger)),
            stats: Arc::new(BridgeStats::new()),
            hook: Box::new(hook),
            sender_task: Mutex::new(None),
            config,
        };

        Ok(Self {
            shared: Arc::new(shared),
        })
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.shared.config
    }

    pub fn endpoints(&self) -> AppEndpoints {
        AppEndpoints {
            inbound: self.shared.inbound.clone(),
            outbound: self.shared.outbound.clone(),
            state: self.shared.registry.subscribe(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.shared.registry
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.shared.stats.snapshot()
    }

    /// Whether a broadcast sender task is currently alive.
    pub fn sender_active(&self) -> bool {
        self.shared.sender_active()
    }

    /// Bind the server listener. Failure here is fatal for server mode.
    pub fn bind(&self) -> Result<Server> {
        Server::bind(self.shared.clone())
    }

    pub fn connector(&self) -> Connector {
        Connector::new(self.shared.clone())
    }

    /// Run in the configured mode. Only returns on a fatal listener error.
    pub async fn run(self) -> Result<()> {
        info!(mode = %self.shared.config.mode(), "Starting bridge");
        match self.shared.config.mode() {
            Mode::Server => self.bind()?.run().await,
            Mode::Client => {
                self.connector().run().await;
                Ok(())
            }
        }
    }
}
