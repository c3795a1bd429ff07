//! Pure connection state management for the broker connection
//!
//! This module contains the connection state machine states, configuration
//! validation, option building and the connect backoff policy. Nothing here
//! performs I/O.

use super::message::{qos_from_level, OutboundMessage};
use crate::config::MqttSection;
use crate::platform::MachineIdentity;
use crate::protocol::full_topic_name;
use rumqttc::v5::mqttbytes::v5::LastWill;
use rumqttc::v5::MqttOptions;
use rumqttc::Transport as RumqttcTransport;
use std::time::Duration;
use thiserror::Error;
use tracing::warn;
use url::Url;

/// Topic (under the machine prefix) carrying connect/disconnect announcements
pub const LWT_TOPIC: &str = "lwt";

/// Longest wait between two connect attempts
pub const MAX_BACKOFF_SECS: u64 = 60;

/// Backoff growth per failed attempt
pub const BACKOFF_STEP_SECS: u64 = 5;

/// Connection state of the broker connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No valid configuration has been applied
    Uninitialized,
    /// A connect loop is in flight
    Connecting,
    /// ConnAck received and the event loop is running
    Connected,
    /// Initialized but not connected
    Disconnected,
}

/// Broker connection errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("MQTT is disabled: configure either a TCP or a WebSocket connection")]
    NoTransportConfigured,
    #[error("TCP and WebSocket connections cannot be enabled together")]
    AmbiguousTransport,
    #[error("MQTT TCP hostname not configured")]
    MissingHostname,
    #[error("MQTT WebSocket URI not configured")]
    MissingWebSocketUri,
    #[error("Invalid broker URL: {0}")]
    InvalidBrokerUrl(String),
    #[error("Connection failed")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("ConnAck timeout - no connection confirmation received")]
    ConnAckTimeout,
    #[error("Publishing failed")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Not connected - current state: {state:?}")]
    NotConnected { state: ConnectionState },
}

/// Where the broker lives and how to reach it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEndpoint {
    Tcp {
        host: String,
        port: u16,
        secure: bool,
    },
    WebSocket {
        uri: String,
        secure: bool,
    },
}

impl BrokerEndpoint {
    /// Human-readable broker address for diagnostics
    pub fn info(&self) -> String {
        match self {
            BrokerEndpoint::Tcp {
                host,
                port,
                secure: true,
            } => format!("tls://{host}:{port}"),
            BrokerEndpoint::Tcp { host, port, .. } => format!("tcp://{host}:{port}"),
            BrokerEndpoint::WebSocket { uri, secure: true } => format!("wss://{uri}"),
            BrokerEndpoint::WebSocket { uri, .. } => format!("ws://{uri}"),
        }
    }
}

/// Validate the transport selection of a broker section.
///
/// Exactly one of TCP or WebSocket must be enabled, with its address set.
pub fn validate_transport(config: &MqttSection) -> Result<BrokerEndpoint, MqttError> {
    match (config.enabled_tcp(), config.enabled_websocket()) {
        (None, None) => Err(MqttError::NoTransportConfigured),
        (Some(_), Some(_)) => Err(MqttError::AmbiguousTransport),
        (Some(tcp), None) => {
            if tcp.hostname.trim().is_empty() {
                return Err(MqttError::MissingHostname);
            }
            Ok(BrokerEndpoint::Tcp {
                host: tcp.hostname.trim().to_string(),
                port: tcp.port,
                secure: tcp.secure,
            })
        }
        (None, Some(ws)) => {
            let uri = ws
                .uri
                .trim()
                .trim_start_matches("wss://")
                .trim_start_matches("ws://")
                .to_string();
            if uri.is_empty() {
                return Err(MqttError::MissingWebSocketUri);
            }
            Ok(BrokerEndpoint::WebSocket {
                uri,
                secure: ws.secure,
            })
        }
    }
}

/// Client identifier: explicit when configured, otherwise the machine name
pub fn resolve_client_id(config: &MqttSection, identity: &MachineIdentity) -> String {
    config
        .client_id
        .as_deref()
        .map(str::trim)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| identity.machine_name.clone())
}

/// Build the announcement published on the LWT topic
pub fn lwt_message(config: &MqttSection, message: &str) -> OutboundMessage {
    OutboundMessage::build(
        full_topic_name(&config.prefix, LWT_TOPIC),
        message.as_bytes().to_vec(),
        &config.lwt.settings(),
    )
}

/// Pure function to configure MQTT options from a validated section
pub fn configure_mqtt_options(
    config: &MqttSection,
    endpoint: &BrokerEndpoint,
    client_id: &str,
) -> Result<MqttOptions, MqttError> {
    let mut mqtt_options = match endpoint {
        BrokerEndpoint::Tcp { host, port, secure } => {
            let mut options = MqttOptions::new(client_id, host.as_str(), *port);
            if *secure {
                options.set_transport(RumqttcTransport::tls_with_default_config());
            }
            options
        }
        BrokerEndpoint::WebSocket { uri, secure } => {
            let scheme = if *secure { "wss" } else { "ws" };
            let url = format!("{scheme}://{uri}");
            let parsed =
                Url::parse(&url).map_err(|_| MqttError::InvalidBrokerUrl(url.clone()))?;
            let port = parsed
                .port_or_known_default()
                .ok_or_else(|| MqttError::InvalidBrokerUrl(url.clone()))?;

            let mut options = MqttOptions::new(client_id, url.as_str(), port);
            if *secure {
                options.set_transport(RumqttcTransport::wss_with_default_config());
            } else {
                options.set_transport(RumqttcTransport::Ws);
            }
            options
        }
    };

    if let Some(credentials) = &config.credentials {
        if !credentials.username.trim().is_empty() {
            mqtt_options.set_credentials(&credentials.username, &credentials.password);
        }
    }

    mqtt_options.set_clean_start(config.clean_session);
    mqtt_options.set_keep_alive(Duration::from_secs(30));

    if config.lwt.enabled {
        if config.lwt.disconnect_message.trim().is_empty() {
            warn!("LWT disabled - disconnect message is empty, fix your configuration");
        } else {
            let will = lwt_message(config, &config.lwt.disconnect_message);
            let lwt = LastWill::new(
                will.topic.clone(),
                will.payload.to_vec(),
                qos_from_level(config.lwt.qos),
                will.retain,
                None,
            );
            mqtt_options.set_last_will(lwt);
        }
    }

    Ok(mqtt_options)
}

/// Delay before the next attempt after `failed_attempts` consecutive failures.
///
/// Grows linearly by five seconds per failure and is capped at one minute.
pub fn connect_backoff(failed_attempts: u32) -> Duration {
    let secs = (BACKOFF_STEP_SECS * u64::from(failed_attempts)).min(MAX_BACKOFF_SECS);
    Duration::from_secs(secs)
}
