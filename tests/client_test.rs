//! Client mode integration tests over loopback sockets

use std::time::Duration;

use socket_bridge::{Bridge, BridgeConfig, ConnectionState, Mode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::time::timeout;

const WAIT: Duration = Duration::from_secs(2);

fn client_config(server_address: String) -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.bridge.mode = Mode::Client;
    config.client.server_address = server_address;
    config.client.reconnect_delay_ms = 5;
    config.client.connect_timeout_ms = 500;
    config.channels.trigger_threshold = 1;
    config.channels.broadcast_read_timeout_ms = 10;
    config
}

#[tokio::test]
async fn test_reconnects_after_server_closes() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let mut config = client_config(addr.to_string());
    // Long enough to observe the disconnected state before the next attempt
    config.client.reconnect_delay_ms = 300;
    let bridge = Bridge::new(config, || {}).unwrap();
    let mut state = bridge.endpoints().state;
    tokio::spawn(bridge.connector().run());

    let (first, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    timeout(WAIT, state.wait_for(|s| s.connected)).await.unwrap().unwrap();
    assert_eq!(bridge.registry().count(), 1);

    drop(first);
    let down = timeout(WAIT, state.wait_for(|s| !s.connected)).await.unwrap().unwrap();
    assert_eq!(down, ConnectionState { count: 0, connected: false });

    let (_second, _) = timeout(WAIT, listener.accept())
        .await
        .expect("connector did not reconnect")
        .unwrap();
    timeout(WAIT, state.wait_for(|s| s.connected)).await.unwrap().unwrap();
    assert!(bridge.stats().connect_attempts >= 2);
}

#[tokio::test]
async fn test_unreachable_server_does_not_leak() {
    let addr = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap()
    };
    let bridge = Bridge::new(client_config(addr.to_string()), || {}).unwrap();
    let task = tokio::spawn(bridge.connector().run());

    timeout(Duration::from_secs(10), async {
        while bridge.stats().connect_failures < 100 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("connector stalled");
    task.abort();

    let stats = bridge.stats();
    assert!(stats.connect_attempts >= 100);
    assert_eq!(stats.active_handlers, 0);
    assert_eq!(bridge.registry().count(), 0);
    assert!(!bridge.endpoints().state.current().connected);
}

#[tokio::test]
async fn test_bytes_flow_both_ways() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let bridge = Bridge::new(client_config(addr.to_string()), || {}).unwrap();
    let endpoints = bridge.endpoints();
    let mut state = endpoints.state.clone();
    tokio::spawn(bridge.clone().run());

    let (mut peer, _) = timeout(WAIT, listener.accept()).await.unwrap().unwrap();
    timeout(WAIT, state.wait_for(|s| s.connected)).await.unwrap().unwrap();

    peer.write_all(b"downlink").await.unwrap();
    let got = endpoints.inbound.recv(64, WAIT).await;
    assert_eq!(&got[..], b"downlink");

    endpoints
        .outbound
        .send_and_flush(b"uplink", Duration::from_millis(100))
        .await
        .unwrap();
    let mut buf = [0u8; 6];
    timeout(WAIT, peer.read_exact(&mut buf)).await.unwrap().unwrap();
    assert_eq!(&buf, b"uplink");
}
