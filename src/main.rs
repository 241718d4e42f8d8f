//! socket-bridge daemon
//!
//! Runs the bridge in server or client mode and stands in for the
//! application layer: stdin is written to the outbound channel and whatever
//! arrives on the inbound channel is written to stdout.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, error, info, warn};

use socket_bridge::{Bridge, BridgeConfig, ByteChannel, Mode, StateObserver};

#[derive(Parser)]
#[command(name = "socket-bridge")]
#[command(about = "TCP bridge between network peers and local byte channels")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "socket-bridge.toml")]
    config: PathBuf,

    /// Operating mode (overrides config file)
    #[arg(long, env = "BRIDGE_MODE")]
    mode: Option<Mode>,

    /// Listen port in server mode (overrides config file)
    #[arg(long, env = "BRIDGE_LISTEN_PORT")]
    listen_port: Option<u16>,

    /// Peer address in client mode (overrides config file)
    #[arg(long, env = "BRIDGE_SERVER_ADDRESS")]
    server_address: Option<String>,

    /// Maximum concurrent clients in server mode (overrides config file)
    #[arg(long, env = "BRIDGE_MAX_CLIENTS")]
    max_clients: Option<usize>,

    /// Interval for logging traffic counters, in seconds (0 disables)
    #[arg(long, default_value = "30")]
    stats_interval: u64,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("socket_bridge=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    info!(config = %cli.config.display(), "Starting socket-bridge");

    let mut config = BridgeConfig::load(&cli.config)?;
    if let Some(mode) = cli.mode {
        config.bridge.mode = mode;
    }
    if let Some(port) = cli.listen_port {
        config.server.listen_port = port;
    }
    if let Some(addr) = cli.server_address {
        config.client.server_address = addr;
    }
    if let Some(max) = cli.max_clients {
        config.server.max_clients = max;
    }

    let bridge = Bridge::new(config, || info!("First peer connected, resetting session"))?;
    let endpoints = bridge.endpoints();

    tokio::spawn(log_state(endpoints.state.clone()));
    tokio::spawn(pump_inbound(endpoints.inbound.clone()));
    tokio::spawn(pump_stdin(endpoints.outbound.clone()));
    if cli.stats_interval > 0 {
        tokio::spawn(log_stats(bridge.clone(), Duration::from_secs(cli.stats_interval)));
    }

    tokio::select! {
        result = bridge.run() => {
            if let Err(e) = &result {
                error!(error = %e, "Bridge stopped");
            }
            result?;
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    Ok(())
}

async fn log_state(mut state: StateObserver) {
    while let Some(current) = state.changed().await {
        info!(count = current.count, connected = current.connected, "Connection state changed");
    }
}

async fn pump_inbound(inbound: Arc<ByteChannel>) {
    let mut stdout = tokio::io::stdout();
    loop {
        let chunk = inbound.recv(256, Duration::from_millis(100)).await;
        if chunk.is_empty() {
            continue;
        }
        let written = async {
            stdout.write_all(&chunk).await?;
            stdout.flush().await
        };
        if let Err(e) = written.await {
            warn!(error = %e, "stdout closed");
            return;
        }
    }
}

async fn pump_stdin(outbound: Arc<ByteChannel>) {
    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 256];
    loop {
        match stdin.read(&mut buf).await {
            Ok(0) => {
                debug!("stdin closed");
                return;
            }
            Ok(n) => {
                if let Err(e) = outbound.send_and_flush(&buf[..n], Duration::from_millis(100)).await {
                    warn!(error = %e, "Outbound channel full");
                }
            }
            Err(e) => {
                warn!(error = %e, "stdin read failed");
                return;
            }
        }
    }
}

async fn log_stats(bridge: Bridge, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let stats = bridge.stats();
        debug!(
            received = stats.bytes_received,
            sent = stats.bytes_sent,
            dropped = stats.inbound_bytes_dropped,
            clients = bridge.registry().count(),
            "Traffic"
        );
    }
}
