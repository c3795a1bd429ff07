//! Built-in monitor describing the bridge itself

use super::{Monitor, MonitorItem};
use crate::protocol::{Component, DiscoveryDescriptor};
use crate::relay::ConnectionRegistry;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;

const CONFIG_KEY: &str = "Service";

/// Reports uptime and, when the relay runs, the number of connected agents
pub struct ServiceMonitor {
    started: Instant,
    registry: Option<Arc<ConnectionRegistry>>,
}

impl ServiceMonitor {
    pub fn new(registry: Option<Arc<ConnectionRegistry>>) -> Self {
        Self {
            started: Instant::now(),
            registry,
        }
    }
}

#[async_trait]
impl Monitor for ServiceMonitor {
    fn config_key(&self) -> &str {
        CONFIG_KEY
    }

    async fn items(&self) -> Vec<MonitorItem> {
        let mut items = vec![MonitorItem::new(
            CONFIG_KEY,
            "service/uptime",
            self.started.elapsed().as_secs(),
        )
        .with_discovery(
            DiscoveryDescriptor::new("Uptime", "Service Uptime", Component::Sensor)
                .with_unit("s")
                .with_icon("mdi:timer-outline"),
        )];

        if let Some(registry) = &self.registry {
            items.push(
                MonitorItem::new(
                    CONFIG_KEY,
                    "service/agents",
                    registry.connection_count().await,
                )
                .with_discovery(
                    DiscoveryDescriptor::new("Agents", "Connected Agents", Component::Sensor)
                        .with_icon("mdi:account-multiple"),
                ),
            );
        }

        items
    }
}
