//! Broker connection for the IOTLink bridge
//!
//! The module separates pure functions from I/O operations:
//!
//! - [`connection`] - Pure connection state, configuration validation and backoff
//! - [`message`] - Outbound and inbound message envelopes
//! - [`message_handler`] - Pure event routing and refresh interception
//! - [`client`] - Impure I/O operations and coordination
//!
//! # Usage
//!
//! ```rust,no_run
//! use iotlink_bridge::config::BridgeConfig;
//! use iotlink_bridge::platform::MachineIdentity;
//! use iotlink_bridge::transport::mqtt::BrokerConnection;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = BridgeConfig::load_from_file(std::path::Path::new("iotlink.toml"))?;
//! let broker = Arc::new(BrokerConnection::new(MachineIdentity::detect()));
//! broker.init(&config.mqtt).await?;
//! broker.connect().await;
//! broker.publish_message("stats/cpu", Some("12")).await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod message;
pub mod message_handler;

pub use client::{retry_until_connected, BrokerConnection, BrokerEvent, DisconnectReason};
pub use connection::{connect_backoff, BrokerEndpoint, ConnectionState, MqttError, LWT_TOPIC};
pub use message::{BrokerMessage, OutboundMessage};
pub use message_handler::{EventRoute, InboundAction, MessageHandler};
