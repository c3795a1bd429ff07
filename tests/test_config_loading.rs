//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading and error handling.

use iotlink_bridge::config::{BridgeConfig, ConfigError, ConfigWatcher};
use iotlink_bridge::transport::mqtt::connection::validate_transport;
use iotlink_bridge::transport::mqtt::{BrokerEndpoint, MqttError};
use std::io::Write;
use std::path::Path;
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio_util::sync::CancellationToken;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt]
prefix = "iotlink/workgroup/desktop"
global_prefix = "iotlink/all"

[mqtt.tcp]
enabled = true
hostname = "broker.local"
port = 8883
secure = true

[mqtt.credentials]
username = "bridge"
password = "secret"

[mqtt.lwt]
enabled = true
connect_message = "ONLINE"
disconnect_message = "OFFLINE"

[relay]
port = 9800

[monitors]
interval_secs = 10
"#
    )
    .unwrap();

    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.mqtt.prefix, "iotlink/workgroup/desktop");
    assert_eq!(config.mqtt.lwt.connect_message, "ONLINE");
    assert_eq!(config.relay.port, 9800);
    assert_eq!(config.monitors.interval_secs, 10);
    assert_eq!(
        validate_transport(&config.mqtt).unwrap(),
        BrokerEndpoint::Tcp {
            host: "broker.local".to_string(),
            port: 8883,
            secure: true,
        }
    );
}

#[test]
fn test_ambiguous_transport_loads_but_fails_validation() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(
        temp_file,
        r#"
[mqtt.tcp]
enabled = true
hostname = "localhost"

[mqtt.websocket]
enabled = true
uri = "localhost:8083/mqtt"
"#
    )
    .unwrap();

    // Semantic validation belongs to the broker connection, not to loading
    let config = BridgeConfig::load_from_file(temp_file.path()).unwrap();
    assert!(matches!(
        validate_transport(&config.mqtt),
        Err(MqttError::AmbiguousTransport)
    ));
}

#[test]
fn test_missing_file_is_read_error() {
    let result = BridgeConfig::load_from_file(Path::new("/nonexistent/iotlink.toml"));
    assert!(matches!(result, Err(ConfigError::FileRead(_))));
}

#[test]
fn test_invalid_toml_is_parse_error() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[mqtt\nprefix = ").unwrap();

    let result = BridgeConfig::load_from_file(temp_file.path());
    assert!(matches!(result, Err(ConfigError::TomlParse(_))));
}

#[tokio::test]
async fn test_watcher_delivers_reloaded_config() {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "[relay]\nport = 9800").unwrap();

    let cancel = CancellationToken::new();
    let mut reloads = ConfigWatcher::new(temp_file.path())
        .with_settle_delay(Duration::from_millis(50))
        .spawn(cancel.clone())
        .expect("watcher should start");

    std::fs::write(temp_file.path(), "[relay]\nport = 9801\n").unwrap();

    let config = tokio::time::timeout(Duration::from_secs(5), reloads.recv())
        .await
        .expect("reload should be delivered")
        .expect("watcher should still be running");
    assert_eq!(config.relay.port, 9801);

    cancel.cancel();
}
