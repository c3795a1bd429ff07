//! Configuration system for the IOTLink bridge
//!
//! The configuration is a single TOML document. Only syntactic problems are
//! reported at load time; the broker section is validated semantically by the
//! connection manager when it is initialized, so a bad broker section disables
//! the broker subsystem instead of preventing the service from starting.

use notify::{Event, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Main bridge configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct BridgeConfig {
    #[serde(default)]
    pub mqtt: MqttSection,
    #[serde(default)]
    pub relay: RelaySection,
    #[serde(default)]
    pub monitors: MonitorsSection,
}

/// MQTT broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    /// Plain TCP (optionally TLS) transport
    pub tcp: Option<TcpSection>,
    /// WebSocket transport
    pub websocket: Option<WebSocketSection>,
    pub credentials: Option<CredentialsSection>,
    /// Explicit client identifier; the machine name is used when empty
    pub client_id: Option<String>,
    #[serde(default = "default_true")]
    pub clean_session: bool,
    /// Root of every machine-addressed topic
    #[serde(default = "default_prefix")]
    pub prefix: String,
    /// Root of every broadcast topic
    #[serde(default = "default_global_prefix")]
    pub global_prefix: String,
    #[serde(default)]
    pub messages: MessageSettings,
    #[serde(default)]
    pub lwt: LwtSection,
    #[serde(default)]
    pub discovery: DiscoverySection,
}

impl Default for MqttSection {
    fn default() -> Self {
        Self {
            tcp: None,
            websocket: None,
            credentials: None,
            client_id: None,
            clean_session: true,
            prefix: default_prefix(),
            global_prefix: default_global_prefix(),
            messages: MessageSettings::default(),
            lwt: LwtSection::default(),
            discovery: DiscoverySection::default(),
        }
    }
}

impl MqttSection {
    /// TCP section, only when enabled
    pub fn enabled_tcp(&self) -> Option<&TcpSection> {
        self.tcp.as_ref().filter(|tcp| tcp.enabled)
    }

    /// WebSocket section, only when enabled
    pub fn enabled_websocket(&self) -> Option<&WebSocketSection> {
        self.websocket.as_ref().filter(|ws| ws.enabled)
    }

    /// Whether connect/disconnect announcements are configured
    pub fn lwt_enabled(&self) -> bool {
        self.lwt.enabled
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TcpSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub hostname: String,
    #[serde(default = "default_mqtt_port")]
    pub port: u16,
    #[serde(default)]
    pub secure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WebSocketSection {
    #[serde(default)]
    pub enabled: bool,
    /// Broker address without scheme, e.g. `broker.local:8083/mqtt`
    #[serde(default)]
    pub uri: String,
    #[serde(default)]
    pub secure: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct CredentialsSection {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Delivery settings applied to a class of outbound messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
pub struct MessageSettings {
    /// MQTT QoS level (0, 1 or 2)
    #[serde(default)]
    pub qos: u8,
    #[serde(default)]
    pub retain: bool,
}

/// Connect/disconnect announcement ("last will") settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LwtSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_lwt_qos")]
    pub qos: u8,
    #[serde(default = "default_true")]
    pub retain: bool,
    #[serde(default = "default_connect_message")]
    pub connect_message: String,
    #[serde(default = "default_disconnect_message")]
    pub disconnect_message: String,
}

impl Default for LwtSection {
    fn default() -> Self {
        Self {
            enabled: false,
            qos: default_lwt_qos(),
            retain: true,
            connect_message: default_connect_message(),
            disconnect_message: default_disconnect_message(),
        }
    }
}

impl LwtSection {
    pub fn settings(&self) -> MessageSettings {
        MessageSettings {
            qos: self.qos,
            retain: self.retain,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DiscoverySection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_discovery_prefix")]
    pub topic_prefix: String,
    /// Use the domain-qualified machine name in entity names
    #[serde(default)]
    pub domain_prefix: bool,
}

impl Default for DiscoverySection {
    fn default() -> Self {
        Self {
            enabled: false,
            topic_prefix: default_discovery_prefix(),
            domain_prefix: false,
        }
    }
}

/// Local relay server section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelaySection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_relay_port")]
    pub port: u16,
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_relay_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MonitorsSection {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_monitor_interval")]
    pub interval_secs: u64,
}

impl Default for MonitorsSection {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_monitor_interval(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_prefix() -> String {
    "iotlink".to_string()
}

fn default_global_prefix() -> String {
    "iotlink/all".to_string()
}

fn default_mqtt_port() -> u16 {
    1883
}

fn default_lwt_qos() -> u8 {
    1
}

fn default_connect_message() -> String {
    "ON".to_string()
}

fn default_disconnect_message() -> String {
    "OFF".to_string()
}

fn default_discovery_prefix() -> String {
    "homeassistant".to_string()
}

fn default_relay_port() -> u16 {
    9799
}

fn default_monitor_interval() -> u64 {
    30
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Failed to watch config file: {0}")]
    Watch(#[from] notify::Error),
}

impl BridgeConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: BridgeConfig = toml::from_str(content)?;

        if config.monitors.interval_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "monitors.interval_secs must be greater than zero".to_string(),
            ));
        }

        Ok(config)
    }

    /// Create a test configuration for unit testing
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[mqtt]
prefix = "iotlink/workgroup/desktop"
global_prefix = "iotlink/all"

[mqtt.tcp]
enabled = true
hostname = "localhost"
port = 1883

[mqtt.lwt]
enabled = true

[mqtt.discovery]
enabled = true
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

/// Delay between a file change and the reload, so writers can finish
const RELOAD_SETTLE_DELAY: Duration = Duration::from_secs(3);

/// Watches the configuration file and publishes every successful reload.
///
/// The watcher is re-armed after each reload, including failed ones.
pub struct ConfigWatcher {
    path: PathBuf,
    settle_delay: Duration,
}

impl ConfigWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            settle_delay: RELOAD_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, settle_delay: Duration) -> Self {
        self.settle_delay = settle_delay;
        self
    }

    /// Start watching; reloads are delivered on the returned receiver until
    /// `cancel` fires or the receiver is dropped
    pub fn spawn(
        self,
        cancel: CancellationToken,
    ) -> Result<mpsc::Receiver<BridgeConfig>, ConfigError> {
        let (tx, rx) = mpsc::channel(4);
        let (change_tx, mut changes) = mpsc::unbounded_channel();

        let file_name = self.path.file_name().map(OsStr::to_os_string);
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| match result {
                Ok(event) if touches_file(&event, file_name.as_deref()) => {
                    let _ = change_tx.send(());
                }
                Ok(_) => {}
                Err(e) => warn!("Configuration watcher error: {}", e),
            })?;

        // Editors often replace the file, so watch its directory
        watcher.watch(&watch_dir(&self.path), RecursiveMode::NonRecursive)?;
        debug!("Adding file watcher for {}", self.path.display());

        tokio::spawn(async move {
            let _watcher = watcher;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    change = changes.recv() => {
                        if change.is_none() {
                            break;
                        }
                    }
                }

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.settle_delay) => {}
                }

                // A burst of writes reloads once
                while changes.try_recv().is_ok() {}

                match BridgeConfig::load_from_file(&self.path) {
                    Ok(config) => {
                        info!("Configuration file {} reloaded", self.path.display());
                        if tx.send(config).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        error!(
                            "Error while reloading configuration file {}: {}",
                            self.path.display(),
                            e
                        );
                    }
                }
            }

            debug!("Stopped file watcher for {}", self.path.display());
        });

        Ok(rx)
    }
}

fn touches_file(event: &Event, file_name: Option<&OsStr>) -> bool {
    let Some(file_name) = file_name else {
        return false;
    };

    (event.kind.is_modify() || event.kind.is_create())
        && event
            .paths
            .iter()
            .any(|path| path.file_name() == Some(file_name))
}

fn watch_dir(path: &Path) -> PathBuf {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_document() {
        let config = BridgeConfig::from_toml_str("").unwrap();

        assert_eq!(config.mqtt.prefix, "iotlink");
        assert_eq!(config.mqtt.global_prefix, "iotlink/all");
        assert!(config.mqtt.clean_session);
        assert!(config.mqtt.tcp.is_none());
        assert!(!config.mqtt.lwt.enabled);
        assert_eq!(config.mqtt.discovery.topic_prefix, "homeassistant");
        assert_eq!(config.relay.port, 9799);
        assert!(config.relay.enabled);
        assert_eq!(config.monitors.interval_secs, 30);
    }

    #[test]
    fn test_full_mqtt_section() {
        let toml_content = r#"
[mqtt]
client_id = "desktop-01"
clean_session = false
prefix = "home/desktop"

[mqtt.websocket]
enabled = true
uri = "broker.local:8083/mqtt"
secure = true

[mqtt.credentials]
username = "bridge"
password = "hunter2"

[mqtt.messages]
qos = 1
retain = true

[mqtt.lwt]
enabled = true
qos = 2
retain = false
connect_message = "online"
disconnect_message = "offline"
"#;
        let config = BridgeConfig::from_toml_str(toml_content).unwrap();

        assert_eq!(config.mqtt.client_id.as_deref(), Some("desktop-01"));
        assert!(!config.mqtt.clean_session);
        assert!(config.mqtt.enabled_tcp().is_none());
        let ws = config.mqtt.enabled_websocket().unwrap();
        assert_eq!(ws.uri, "broker.local:8083/mqtt");
        assert!(ws.secure);
        assert_eq!(config.mqtt.credentials.unwrap().username, "bridge");
        assert_eq!(config.mqtt.messages, MessageSettings { qos: 1, retain: true });
        assert_eq!(config.mqtt.lwt.settings(), MessageSettings { qos: 2, retain: false });
        assert_eq!(config.mqtt.lwt.connect_message, "online");
    }

    #[test]
    fn test_disabled_transport_is_not_reported_as_enabled() {
        let toml_content = r#"
[mqtt.tcp]
enabled = false
hostname = "localhost"
"#;
        let config = BridgeConfig::from_toml_str(toml_content).unwrap();
        assert!(config.mqtt.tcp.is_some());
        assert!(config.mqtt.enabled_tcp().is_none());
        assert_eq!(config.mqtt.tcp.unwrap().port, 1883);
    }

    #[test]
    fn test_zero_monitor_interval_rejected() {
        let result = BridgeConfig::from_toml_str("[monitors]\ninterval_secs = 0\n");
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_invalid_toml_rejected() {
        let result = BridgeConfig::from_toml_str("[mqtt\nprefix = ");
        assert!(matches!(result, Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_test_config_parses() {
        let config = BridgeConfig::test_config();
        assert!(config.mqtt.enabled_tcp().is_some());
        assert!(config.mqtt.discovery.enabled);
    }

    async fn next_port(rx: &mut mpsc::Receiver<BridgeConfig>, expected: u16) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(config) = rx.recv().await {
                if config.relay.port == expected {
                    return;
                }
            }
            panic!("watcher stopped before port {expected} was delivered");
        })
        .await
        .expect("reload should be delivered");
    }

    #[tokio::test]
    async fn test_watcher_reloads_and_rearms() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iotlink.toml");
        std::fs::write(&path, "[relay]\nport = 1000\n").unwrap();

        let cancel = CancellationToken::new();
        let mut rx = ConfigWatcher::new(&path)
            .with_settle_delay(Duration::from_millis(50))
            .spawn(cancel.clone())
            .unwrap();

        std::fs::write(&path, "[relay]\nport = 2000\n").unwrap();
        next_port(&mut rx, 2000).await;

        // A broken document is logged and the watcher keeps going
        std::fs::write(&path, "[relay\nport = ").unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(&path, "[relay]\nport = 3000\n").unwrap();
        next_port(&mut rx, 3000).await;

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_watcher_ignores_sibling_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("iotlink.toml");
        std::fs::write(&path, "[relay]\nport = 1000\n").unwrap();

        let cancel = CancellationToken::new();
        let mut rx = ConfigWatcher::new(&path)
            .with_settle_delay(Duration::from_millis(10))
            .spawn(cancel.clone())
            .unwrap();

        std::fs::write(dir.path().join("other.toml"), "[relay]\nport = 4000\n").unwrap();
        assert!(
            tokio::time::timeout(Duration::from_millis(300), rx.recv())
                .await
                .is_err()
        );

        cancel.cancel();
    }

    #[tokio::test]
    async fn test_watcher_reports_missing_directory() {
        let result = ConfigWatcher::new("/nonexistent/iotlink/iotlink.toml")
            .spawn(CancellationToken::new());
        assert!(matches!(result, Err(ConfigError::Watch(_))));
    }

    #[test]
    fn test_watch_dir_of_bare_file_name() {
        assert_eq!(watch_dir(Path::new("iotlink.toml")), PathBuf::from("."));
        assert_eq!(
            watch_dir(Path::new("config/iotlink.toml")),
            PathBuf::from("config")
        );
    }
}
