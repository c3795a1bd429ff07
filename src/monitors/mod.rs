//! Monitor service
//!
//! Monitors produce [`MonitorItem`]s; the [`MonitorService`] publishes their
//! values on a fixed interval and announces each item's discovery document
//! once per connection (and again after every refresh request).

pub mod service_monitor;

pub use service_monitor::ServiceMonitor;

use crate::protocol::DiscoveryDescriptor;
use crate::transport::mqtt::BrokerEvent;
use crate::transport::BrokerPublisher;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// One value produced by a monitor
#[derive(Debug, Clone, PartialEq)]
pub struct MonitorItem {
    pub config_key: String,
    /// Logical topic, relative to the machine prefix
    pub topic: String,
    pub value: String,
    pub discovery: Option<DiscoveryDescriptor>,
}

impl MonitorItem {
    pub fn new(
        config_key: impl Into<String>,
        topic: impl Into<String>,
        value: impl ToString,
    ) -> Self {
        Self {
            config_key: config_key.into(),
            topic: topic.into(),
            value: value.to_string(),
            discovery: None,
        }
    }

    pub fn with_discovery(mut self, descriptor: DiscoveryDescriptor) -> Self {
        self.discovery = Some(descriptor);
        self
    }

    fn announcement_key(&self) -> String {
        format!("{}/{}", self.config_key, self.topic)
    }
}

/// A source of monitored values
#[async_trait]
pub trait Monitor: Send + Sync {
    fn config_key(&self) -> &str;

    async fn items(&self) -> Vec<MonitorItem>;
}

pub struct MonitorService {
    publisher: Arc<dyn BrokerPublisher>,
    monitors: Vec<Arc<dyn Monitor>>,
    interval: Duration,
    announced: Mutex<HashSet<String>>,
}

impl MonitorService {
    pub fn new(publisher: Arc<dyn BrokerPublisher>, interval: Duration) -> Self {
        Self {
            publisher,
            monitors: Vec::new(),
            interval,
            announced: Mutex::new(HashSet::new()),
        }
    }

    pub fn register(&mut self, monitor: Arc<dyn Monitor>) {
        debug!("Registering monitor {}", monitor.config_key());
        self.monitors.push(monitor);
    }

    pub fn monitor_count(&self) -> usize {
        self.monitors.len()
    }

    /// Forget announced items so the next tick announces them again
    pub async fn reset_discovery(&self) {
        self.announced.lock().await.clear();
    }

    /// Publish every monitor's current values; returns how many were published
    pub async fn publish_all(&self) -> usize {
        if !self.publisher.is_connected() {
            trace!("Broker not connected. Skipping monitor values");
            return 0;
        }

        let mut published = 0;
        for monitor in &self.monitors {
            for item in monitor.items().await {
                if let Some(descriptor) = &item.discovery {
                    let first_time = self.announced.lock().await.insert(item.announcement_key());
                    if first_time {
                        self.publisher
                            .publish_discovery(&item.topic, &item.config_key, descriptor)
                            .await;
                    }
                }

                self.publisher
                    .publish_bytes(&item.topic, Some(item.value.as_bytes()))
                    .await;
                published += 1;
            }
        }

        trace!("Published {} monitor values", published);
        published
    }

    /// Run until cancelled, publishing on every tick and after each
    /// connect or refresh
    pub fn spawn(
        self: Arc<Self>,
        mut events: broadcast::Receiver<BrokerEvent>,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut events_open = true;

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        self.publish_all().await;
                    }
                    event = events.recv(), if events_open => match event {
                        Ok(BrokerEvent::Connected) | Ok(BrokerEvent::RefreshRequested) => {
                            self.reset_discovery().await;
                            self.publish_all().await;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Monitor service missed {} broker events", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => events_open = false,
                    },
                }
            }

            debug!("Monitor service stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Component;
    use crate::testing::{MockMonitor, MockPublisher};

    fn cpu_monitor() -> Arc<MockMonitor> {
        Arc::new(MockMonitor::new(
            "Cpu",
            vec![
                MonitorItem::new("Cpu", "stats/cpu/usage", 12).with_discovery(
                    DiscoveryDescriptor::new("Usage", "CPU Usage", Component::Sensor)
                        .with_unit("%"),
                ),
                MonitorItem::new("Cpu", "stats/cpu/cores", 8),
            ],
        ))
    }

    #[tokio::test]
    async fn test_values_published_and_discovery_announced_once() {
        let publisher = Arc::new(MockPublisher::new());
        let mut service = MonitorService::new(publisher.clone(), Duration::from_secs(30));
        service.register(cpu_monitor());

        assert_eq!(service.publish_all().await, 2);
        assert_eq!(service.publish_all().await, 2);

        let messages = publisher.get_published_messages().await;
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0], ("stats/cpu/usage".to_string(), b"12".to_vec()));
        assert_eq!(messages[1], ("stats/cpu/cores".to_string(), b"8".to_vec()));

        let discovery = publisher.get_published_discovery().await;
        assert_eq!(discovery.len(), 1);
        assert_eq!(discovery[0].0, "stats/cpu/usage");
        assert_eq!(discovery[0].1, "Cpu");
    }

    #[tokio::test]
    async fn test_reset_announces_again() {
        let publisher = Arc::new(MockPublisher::new());
        let mut service = MonitorService::new(publisher.clone(), Duration::from_secs(30));
        service.register(cpu_monitor());

        service.publish_all().await;
        service.reset_discovery().await;
        service.publish_all().await;

        assert_eq!(publisher.get_published_discovery().await.len(), 2);
    }

    #[tokio::test]
    async fn test_nothing_published_while_disconnected() {
        let publisher = Arc::new(MockPublisher::disconnected());
        let mut service = MonitorService::new(publisher.clone(), Duration::from_secs(30));
        service.register(cpu_monitor());

        assert_eq!(service.publish_all().await, 0);

        // Discovery was not consumed while disconnected
        publisher.set_connected(true);
        service.publish_all().await;
        assert_eq!(publisher.get_published_discovery().await.len(), 1);
    }

    #[tokio::test]
    async fn test_refresh_event_triggers_announcement() {
        let publisher = Arc::new(MockPublisher::new());
        let mut service = MonitorService::new(publisher.clone(), Duration::from_secs(3600));
        service.register(cpu_monitor());
        let service = Arc::new(service);

        let (events_tx, events_rx) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let handle = service.clone().spawn(events_rx, cancel.clone());

        // First tick fires immediately
        publisher.wait_for_messages(2, Duration::from_secs(2)).await;
        events_tx.send(BrokerEvent::RefreshRequested).unwrap();
        publisher.wait_for_messages(4, Duration::from_secs(2)).await;

        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(publisher.get_published_messages().await.len(), 4);
        assert_eq!(publisher.get_published_discovery().await.len(), 2);
    }
}
