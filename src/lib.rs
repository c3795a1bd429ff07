//! IOTLink bridge
//!
//! Connects a background monitoring service to an MQTT broker and relays
//! messages between that service and interactive per-user agents over a local
//! WebSocket.
//!
//! # Overview
//!
//! - [`transport::mqtt::BrokerConnection`] - the single broker connection, with
//!   connect-retry, last-will announcements, discovery and refresh handling
//! - [`relay::RelayServer`] - the loopback WebSocket relay with its username
//!   registry and broadcast/targeted request push
//! - [`monitors::MonitorService`] - periodic value and discovery publishing
//! - [`service::BridgeService`] - the composition root wiring them together
//!
//! # Quick Start
//!
//! ```rust
//! use iotlink_bridge::protocol::{decode_envelope, ClientRequest, Envelope};
//!
//! let frame = ClientRequest::Connected { username: "Alice".to_string() }.to_frame();
//! let envelope = decode_envelope(&frame).unwrap();
//! assert!(matches!(
//!     envelope,
//!     Envelope::ClientRequest(ClientRequest::Connected { .. })
//! ));
//! ```

pub mod commands;
pub mod config;
pub mod error;
pub mod monitors;
pub mod observability;
pub mod platform;
pub mod protocol;
pub mod relay;
pub mod service;
pub mod testing;
pub mod transport;

pub use config::*;
pub use error::{BridgeError, BridgeResult};
pub use platform::MachineIdentity;
pub use relay::RelayServer;
pub use service::BridgeService;
pub use transport::mqtt::{BrokerConnection, BrokerEvent};
pub use transport::BrokerPublisher;
