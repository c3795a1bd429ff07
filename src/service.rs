//! Bridge composition root
//!
//! [`BridgeService`] owns the broker connection, the relay server and the
//! monitor service, and wires broker events to them:
//!
//! - a lost connection starts a new connect loop
//! - broker commands are pushed down to agents
//! - connect and refresh events re-announce discovery (inside the monitor service)

use crate::commands::dispatch_command;
use crate::config::BridgeConfig;
use crate::error::BridgeResult;
use crate::monitors::{MonitorService, ServiceMonitor};
use crate::platform::MachineIdentity;
use crate::relay::RelayServer;
use crate::transport::mqtt::{BrokerConnection, BrokerEvent, DisconnectReason};
use crate::transport::BrokerPublisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct BridgeService {
    config: BridgeConfig,
    broker: Arc<BrokerConnection>,
    relay: Option<Arc<RelayServer>>,
    monitors: Arc<MonitorService>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeService {
    pub fn new(config: BridgeConfig, identity: MachineIdentity) -> Self {
        let broker = Arc::new(BrokerConnection::new(identity));
        let publisher: Arc<dyn BrokerPublisher> = broker.clone();

        let relay = config
            .relay
            .enabled
            .then(|| Arc::new(RelayServer::new(config.relay.port, publisher.clone())));

        let mut monitors = MonitorService::new(
            publisher,
            Duration::from_secs(config.monitors.interval_secs),
        );
        monitors.register(Arc::new(ServiceMonitor::new(
            relay.as_ref().map(|relay| relay.registry()),
        )));

        Self {
            config,
            broker,
            relay,
            monitors: Arc::new(monitors),
            cancel: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    pub fn broker(&self) -> Arc<BrokerConnection> {
        self.broker.clone()
    }

    pub fn relay(&self) -> Option<Arc<RelayServer>> {
        self.relay.clone()
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    /// Start the relay, the event loop, the monitors and the first connect loop.
    ///
    /// Only a relay bind failure is an error; an invalid broker section leaves
    /// the broker disabled and the rest of the service running.
    pub async fn start(&mut self) -> BridgeResult<()> {
        if let Some(relay) = &self.relay {
            relay.start().await?;
        }

        let events = self.broker.subscribe();
        self.tasks.push(tokio::spawn(run_event_loop(
            self.broker.clone(),
            self.relay.clone(),
            events,
            self.cancel.child_token(),
        )));

        if self.config.monitors.enabled {
            self.tasks.push(
                self.monitors
                    .clone()
                    .spawn(self.broker.subscribe(), self.cancel.child_token()),
            );
        }

        if let Err(e) = self.broker.init(&self.config.mqtt).await {
            warn!("MQTT disabled: {}", e);
        } else {
            self.spawn_connect();
        }

        info!("IOTLink bridge started");
        Ok(())
    }

    /// Apply a reloaded configuration to the broker connection
    pub async fn reload(&mut self, config: BridgeConfig) {
        info!("Applying reloaded configuration");
        self.broker.disconnect(false).await;

        match self.broker.init(&config.mqtt).await {
            Ok(()) => self.spawn_connect(),
            Err(e) => warn!("MQTT disabled after reload: {}", e),
        }

        if config.relay != self.config.relay || config.monitors != self.config.monitors {
            warn!("Relay and monitor settings are applied on restart only");
        }
        self.config = config;
    }

    /// Disconnect with last will, stop the relay and every background task
    pub async fn shutdown(&mut self) {
        info!("Shutting down IOTLink bridge");
        self.cancel.cancel();
        self.broker.shutdown().await;

        if let Some(relay) = &self.relay {
            relay.stop().await;
        }

        for task in self.tasks.drain(..) {
            task.abort();
        }
    }

    fn spawn_connect(&mut self) {
        self.tasks.retain(|task| !task.is_finished());

        let broker = self.broker.clone();
        self.tasks
            .push(tokio::spawn(async move { broker.connect().await }));
    }
}

async fn run_event_loop(
    broker: Arc<BrokerConnection>,
    relay: Option<Arc<RelayServer>>,
    mut events: broadcast::Receiver<BrokerEvent>,
    cancel: CancellationToken,
) {
    let mut reconnects = JoinSet::new();

    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.recv() => event,
        };

        match event {
            Ok(BrokerEvent::Disconnected(DisconnectReason::Lost(reason))) => {
                info!("Reconnecting after lost connection ({})", reason);
                while reconnects.try_join_next().is_some() {}
                let broker = broker.clone();
                reconnects.spawn(async move { broker.connect().await });
            }
            Ok(BrokerEvent::MessageReceived(message)) => {
                if let Some(relay) = &relay {
                    dispatch_command(relay, &message).await;
                }
            }
            Ok(other) => debug!("Broker event: {:?}", other),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Event loop missed {} broker events", skipped);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }

    reconnects.shutdown().await;
    debug!("Bridge event loop stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::mqtt::ConnectionState;

    fn config_without_broker() -> BridgeConfig {
        let mut config = BridgeConfig::default();
        config.relay.port = 0;
        config
    }

    #[tokio::test]
    async fn test_start_without_broker_keeps_relay_running() {
        let mut service =
            BridgeService::new(config_without_broker(), MachineIdentity::new("DESKTOP", ""));
        service.start().await.unwrap();

        assert_eq!(service.broker().state(), ConnectionState::Uninitialized);
        let relay = service.relay().expect("relay enabled by default");
        assert!(relay.is_listening());

        service.shutdown().await;
        assert!(!relay.is_listening());
    }

    #[tokio::test]
    async fn test_relay_can_be_disabled() {
        let mut config = config_without_broker();
        config.relay.enabled = false;

        let mut service = BridgeService::new(config, MachineIdentity::new("DESKTOP", ""));
        service.start().await.unwrap();
        assert!(service.relay().is_none());
        service.shutdown().await;
    }

    #[tokio::test]
    async fn test_event_loop_stops_its_reconnect_loops() {
        let broker = Arc::new(BrokerConnection::new(MachineIdentity::new("DESKTOP", "")));
        let mut mqtt = BridgeConfig::default().mqtt;
        mqtt.tcp = Some(crate::config::TcpSection {
            enabled: true,
            hostname: "127.0.0.1".to_string(),
            port: 1,
            secure: false,
        });
        broker.init(&mqtt).await.unwrap();

        let (events, receiver) = broadcast::channel(8);
        let cancel = CancellationToken::new();
        let event_loop = tokio::spawn(run_event_loop(
            broker.clone(),
            None,
            receiver,
            cancel.clone(),
        ));

        let mut state = broker.watch_state();
        events
            .send(BrokerEvent::Disconnected(DisconnectReason::Lost(
                "network down".to_string(),
            )))
            .unwrap();
        tokio::time::timeout(
            Duration::from_secs(5),
            state.wait_for(|state| *state == ConnectionState::Connecting),
        )
        .await
        .expect("a lost connection starts a reconnect loop")
        .unwrap();

        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), event_loop)
            .await
            .expect("event loop should stop")
            .unwrap();

        // The retry loop was torn down with the event loop, not left detached
        assert_eq!(broker.state(), ConnectionState::Disconnected);
    }
}
