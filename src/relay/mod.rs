//! Local relay between the service and interactive per-user agents
//!
//! - [`registry`] - Connection ids, outbound queues and the username map
//! - [`router`] - Envelope dispatch by message and request type
//! - [`server`] - The WebSocket endpoint and request push

pub mod registry;
pub mod router;
pub mod server;

pub use registry::{normalize_username, ConnectionRegistry};
pub use router::{RelayRouter, RouteOutcome};
pub use server::{relay_filter, RelayServer};

use thiserror::Error;

/// Relay server errors
#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind relay port {port}")]
    Bind {
        port: u16,
        #[source]
        source: warp::Error,
    },
    #[error("Relay server is already running")]
    AlreadyRunning,
}
