//! Config loading and defaults integration tests

use std::io::Write;

use socket_bridge::{Bridge, BridgeConfig, BridgeError, ConfigError, Mode};

#[test]
fn test_full_config_file_parses() {
    let toml_str = r#"
[bridge]
mode = "client"

[server]
listen_address = "127.0.0.1"
listen_port = 9100
max_clients = 5

[client]
server_address = "10.1.2.3:9100"
reconnect_delay_ms = 250

[channels]
inbound_capacity = 1024
outbound_capacity = 2048
trigger_threshold = 32

[socket]
keepalive_idle_s = 10
recv_timeout_s = 60
"#;

    let mut file = tempfile::NamedTempFile::new().expect("temp file");
    file.write_all(toml_str.as_bytes()).unwrap();

    let config = BridgeConfig::load(file.path()).expect("load config");
    assert_eq!(config.mode(), Mode::Client);
    assert_eq!(config.server.listen_port, 9100);
    assert_eq!(config.server.max_clients, 5);
    assert_eq!(config.client.server_address, "10.1.2.3:9100");
    assert_eq!(config.client.reconnect_delay_ms, 250);
    assert_eq!(config.channels.outbound_capacity, 2048);
    assert_eq!(config.channels.trigger_threshold, 32);
    assert_eq!(config.socket.keepalive_idle_s, 10);
    // Untouched keys keep their defaults
    assert_eq!(config.socket.keepalive_probe_count, 3);
    assert_eq!(config.channels.send_chunk_size, 100);
    assert!(config.validate().is_ok());
}

#[test]
fn test_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = BridgeConfig::load(&dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.mode(), Mode::Server);
    assert_eq!(config.server.max_clients, 3);
    assert_eq!(config.client.server_address, "192.168.0.100:8080");
}

#[test]
fn test_malformed_file_is_an_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[bridge]\nmode = \"mesh\"\n").unwrap();
    assert!(BridgeConfig::load(file.path()).is_err());
}

#[test]
fn test_bridge_rejects_invalid_config() {
    let mut config = BridgeConfig::default();
    config.channels.inbound_capacity = 0;

    let err = Bridge::new(config, || {}).unwrap_err();
    assert!(matches!(
        err,
        BridgeError::Config(ConfigError::Zero("inbound_capacity"))
    ));
}

#[test]
fn test_bridge_rejects_zero_timeouts() {
    let mut config = BridgeConfig::default();
    config.socket.recv_timeout_s = 0;
    assert!(matches!(
        Bridge::new(config, || {}).unwrap_err(),
        BridgeError::Config(ConfigError::Zero("recv_timeout_s"))
    ));

    let mut config = BridgeConfig::default();
    config.channels.broadcast_read_timeout_ms = 0;
    assert!(matches!(
        Bridge::new(config, || {}).unwrap_err(),
        BridgeError::Config(ConfigError::Zero("broadcast_read_timeout_ms"))
    ));
}
