//! Transport layer for the broker connection
//!
//! The relay, the command dispatcher and the monitor service only need to
//! publish, so they depend on [`BrokerPublisher`] rather than on the concrete
//! connection.

use crate::protocol::DiscoveryDescriptor;

pub mod mqtt;

/// Publishing half of the broker connection
///
/// This trait enables dependency injection and testing without a broker.
#[async_trait::async_trait]
pub trait BrokerPublisher: Send + Sync {
    /// Publish under the machine prefix. Never fails: skipped when not
    /// connected or when `topic` is blank, `None` publishes an empty payload.
    async fn publish_bytes(&self, topic: &str, payload: Option<&[u8]>);

    /// Announce one monitored value published on `state_topic`
    async fn publish_discovery(
        &self,
        state_topic: &str,
        monitor_key: &str,
        descriptor: &DiscoveryDescriptor,
    );

    /// Re-send the connected announcement on the last-will topic
    async fn announce_connected(&self);

    /// Check if the broker is currently connected
    fn is_connected(&self) -> bool;
}

pub use mqtt::BrokerConnection;
