//! Impure I/O operations for the broker connection
//!
//! [`BrokerConnection`] owns the single connection to the broker. It is created
//! once by the service's composition root, shared behind an `Arc`, and handed
//! to every component that publishes.
//!
//! State machine:
//!
//! ```text
//! Uninitialized --init--> Disconnected --connect--> Connecting --ConnAck--> Connected
//!                                            ^                                  |
//!                                            +------- connection lost ----------+
//! ```
//!
//! A failed attempt keeps the connection in `Connecting` and retries forever
//! with a linear, capped backoff. Reconnecting after a lost connection is the
//! owner's job: it observes [`BrokerEvent::Disconnected`] and calls `connect`
//! again.

use super::connection::{
    configure_mqtt_options, connect_backoff, lwt_message, resolve_client_id, validate_transport,
    BrokerEndpoint, ConnectionState, MqttError,
};
use super::message::{BrokerMessage, OutboundMessage};
use super::message_handler::{EventRoute, InboundAction, MessageHandler};
use crate::config::MqttSection;
use crate::platform::MachineIdentity;
use crate::protocol::discovery::{build_announcement, DiscoveryDescriptor};
use crate::protocol::{full_topic_name, subscription_filters};
use crate::transport::BrokerPublisher;
use async_trait::async_trait;
use rumqttc::v5::mqttbytes::QoS;
use rumqttc::v5::{AsyncClient, EventLoop, MqttOptions};
use std::fmt::Display;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};

/// How long one attempt waits for the broker's ConnAck
const CONNACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Pause after the disconnect announcement so it is flushed before closing
const LWT_FLUSH_DELAY: Duration = Duration::from_millis(500);

/// Wait between two close attempts
const DISCONNECT_RETRY_DELAY: Duration = Duration::from_secs(2);

const MAX_DISCONNECT_ATTEMPTS: u32 = 5;

/// Capacity of the client request queue and of the event channel
const REQUEST_CAPACITY: usize = 64;
const EVENT_CAPACITY: usize = 256;

/// Why the connection went down
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect` was called
    Requested,
    /// Broker or network dropped the connection
    Lost(String),
}

/// Events raised by the broker connection
#[derive(Debug, Clone, PartialEq)]
pub enum BrokerEvent {
    Connected,
    Disconnected(DisconnectReason),
    MessageReceived(BrokerMessage),
    /// A `refresh` topic was received; monitors should re-announce
    RefreshRequested,
}

/// Validated, ready-to-use broker configuration
#[derive(Debug, Clone)]
struct BrokerSettings {
    config: MqttSection,
    endpoint: BrokerEndpoint,
    options: MqttOptions,
}

/// The single connection to the broker
pub struct BrokerConnection {
    identity: MachineIdentity,
    settings: RwLock<Option<Arc<BrokerSettings>>>,
    client: Mutex<Option<AsyncClient>>,
    state_tx: watch::Sender<ConnectionState>,
    events: broadcast::Sender<BrokerEvent>,
    /// Re-entrancy guard for `connect`; not a mutex
    connecting: AtomicBool,
    disconnecting: AtomicBool,
    /// Cancels an in-flight connect loop; replaced after each cancellation
    connect_cancel: std::sync::Mutex<CancellationToken>,
    event_loop_handle: Mutex<Option<JoinHandle<()>>>,
    connack_timeout: Duration,
}

/// Retry `attempt` until it succeeds or `cancel` fires.
///
/// `attempt` receives the 1-based attempt number. After the n-th consecutive
/// failure the loop sleeps [`connect_backoff`]`(n)`. Returns `None` only when
/// cancelled.
pub async fn retry_until_connected<T, E, F, Fut>(
    mut attempt: F,
    cancel: &CancellationToken,
) -> Option<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut failures = 0u32;

    loop {
        let outcome = tokio::select! {
            _ = cancel.cancelled() => return None,
            outcome = attempt(failures + 1) => outcome,
        };

        match outcome {
            Ok(value) => return Some(value),
            Err(e) => {
                failures = failures.saturating_add(1);
                let delay = connect_backoff(failures);
                info!("Connection to the broker failed: {}", e);
                info!("Waiting {} seconds before trying again...", delay.as_secs());

                if !interruptible_sleep(cancel, delay).await {
                    return None;
                }
            }
        }
    }
}

/// Route one inbound message, intercepting refresh requests.
///
/// A refresh never reaches `MessageReceived` subscribers. It re-sends the
/// connected announcement through `publisher` on its own task, since the
/// caller is usually the transport event loop, and raises `RefreshRequested`.
pub fn route_inbound(
    publisher: Arc<dyn BrokerPublisher>,
    events: &broadcast::Sender<BrokerEvent>,
    message: BrokerMessage,
) -> InboundAction {
    let action = MessageHandler::classify(&message);
    match action {
        InboundAction::Refresh => {
            debug!("Refresh requested through {}", message.full_topic);
            tokio::spawn(async move { publisher.announce_connected().await });
            let _ = events.send(BrokerEvent::RefreshRequested);
        }
        InboundAction::Deliver => {
            let _ = events.send(BrokerEvent::MessageReceived(message));
        }
    }
    action
}

/// Clears the connect re-entrancy guard however the connect future ends,
/// including when its task is aborted mid-retry
struct ConnectingGuard<'a> {
    connection: &'a BrokerConnection,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if self.connection.state() == ConnectionState::Connecting {
            self.connection.set_state(ConnectionState::Disconnected);
        }
        self.connection.connecting.store(false, Ordering::SeqCst);
    }
}

/// Perform interruptible sleep with cancellation monitoring
/// Returns true if sleep completed, false if cancelled
async fn interruptible_sleep(cancel: &CancellationToken, delay: Duration) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(delay) => true,
    }
}

impl BrokerConnection {
    pub fn new(identity: MachineIdentity) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Uninitialized);
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            identity,
            settings: RwLock::new(None),
            client: Mutex::new(None),
            state_tx,
            events,
            connecting: AtomicBool::new(false),
            disconnecting: AtomicBool::new(false),
            connect_cancel: std::sync::Mutex::new(CancellationToken::new()),
            event_loop_handle: Mutex::new(None),
            connack_timeout: CONNACK_TIMEOUT,
        }
    }

    /// Validate the broker section and prepare transport options.
    ///
    /// Does not connect. On failure the connection stays (or becomes)
    /// uninitialized and every later operation is a logged no-op.
    pub async fn init(&self, config: &MqttSection) -> Result<(), MqttError> {
        let prepared = validate_transport(config).and_then(|endpoint| {
            let client_id = resolve_client_id(config, &self.identity);
            configure_mqtt_options(config, &endpoint, &client_id).map(|options| (endpoint, options))
        });

        let (endpoint, options) = match prepared {
            Ok(prepared) => prepared,
            Err(e) => {
                match e {
                    MqttError::MissingHostname | MqttError::MissingWebSocketUri => {
                        warn!("MQTT broker not configured yet: {}", e)
                    }
                    _ => error!("Invalid MQTT configuration: {}", e),
                }
                *self.settings.write().await = None;
                self.set_state(ConnectionState::Uninitialized);
                return Err(e);
            }
        };

        *self.settings.write().await = Some(Arc::new(BrokerSettings {
            config: config.clone(),
            endpoint,
            options,
        }));
        if self.state() != ConnectionState::Connected {
            self.set_state(ConnectionState::Disconnected);
        }

        trace!("MQTT init finished");
        Ok(())
    }

    /// Connect to the broker, retrying until connected or disconnected.
    ///
    /// Returns immediately when a connect loop is already running, when already
    /// connected, or when `init` has not succeeded. Otherwise this future only
    /// completes once the connection is up or `disconnect` cancels it, so run it
    /// on its own task.
    pub async fn connect(self: &Arc<Self>) {
        let Some(settings) = self.settings().await else {
            warn!("MQTT is disabled or not configured yet");
            return;
        };

        if self.connecting.swap(true, Ordering::SeqCst) {
            trace!("MQTT client is already connecting. Skipping");
            return;
        }
        let _guard = ConnectingGuard {
            connection: self.as_ref(),
        };

        if self.is_connected() {
            return;
        }

        let cancel = self.current_cancel_token();
        self.set_state(ConnectionState::Connecting);

        let broker_info = settings.endpoint.info();
        let result = retry_until_connected(
            |attempt| {
                let settings = settings.clone();
                let broker_info = broker_info.clone();
                let timeout = self.connack_timeout;
                async move {
                    info!(
                        "Trying to connect to broker: {} (Try: {})",
                        broker_info, attempt
                    );
                    Self::attempt_connection(&settings.options, timeout).await
                }
            },
            &cancel,
        )
        .instrument(crate::mqtt_span!(broker = %broker_info))
        .await;

        match result {
            Some((client, event_loop)) => {
                info!("Connection established successfully");
                self.on_connection_established(&settings, client, event_loop)
                    .await;
            }
            None => info!("Connect loop cancelled"),
        }
    }

    /// One connection attempt: a fresh client polled until ConnAck
    async fn attempt_connection(
        options: &MqttOptions,
        timeout: Duration,
    ) -> Result<(AsyncClient, EventLoop), MqttError> {
        let (client, mut event_loop) = AsyncClient::new(options.clone(), REQUEST_CAPACITY);

        let acknowledged = tokio::time::timeout(timeout, async {
            loop {
                let event = event_loop
                    .poll()
                    .await
                    .map_err(|e| MqttError::ConnectionFailed(Box::new(e)))?;
                if let EventRoute::ConnectionAcknowledged = MessageHandler::route_mqtt_event(&event)
                {
                    return Ok::<(), MqttError>(());
                }
            }
        })
        .await;

        match acknowledged {
            Ok(Ok(())) => Ok((client, event_loop)),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(MqttError::ConnAckTimeout),
        }
    }

    async fn on_connection_established(
        self: &Arc<Self>,
        settings: &BrokerSettings,
        client: AsyncClient,
        event_loop: EventLoop,
    ) {
        *self.client.lock().await = Some(client.clone());
        self.set_state(ConnectionState::Connected);

        let this = self.clone();
        let handle = tokio::spawn(async move { this.run_event_loop(event_loop).await });
        if let Some(previous) = self.event_loop_handle.lock().await.replace(handle) {
            previous.abort();
        }

        self.send_lwt_connect().await;
        self.emit(BrokerEvent::Connected);

        info!(
            "ALL YOUR MQTT TOPICS WILL START WITH {}",
            full_topic_name(&settings.config.prefix, "")
        );

        for filter in subscription_filters(&settings.config.prefix, &settings.config.global_prefix)
        {
            trace!("Subscribing to {}", filter);
            if let Err(e) = client.subscribe(filter.as_str(), QoS::AtMostOnce).await {
                error!("Failed to subscribe to {}: {}", filter, e);
            }
        }
    }

    /// Drive the transport until the connection ends
    async fn run_event_loop(self: Arc<Self>, mut event_loop: EventLoop) {
        debug!("MQTT event loop started");

        loop {
            match event_loop.poll().await {
                Ok(event) => match MessageHandler::route_mqtt_event(&event) {
                    EventRoute::MessageReceived {
                        topic,
                        payload,
                        content_type,
                        retain,
                    } => {
                        trace!("MQTT message received - topic: {}", topic);
                        let Some(settings) = self.settings().await else {
                            continue;
                        };
                        let message = MessageHandler::to_broker_message(
                            &topic,
                            payload,
                            content_type,
                            retain,
                            &settings.config.prefix,
                            &settings.config.global_prefix,
                        );
                        self.handle_inbound(message);
                    }
                    EventRoute::Disconnected => {
                        self.handle_connection_lost("Broker disconnected".to_string())
                            .await;
                        break;
                    }
                    EventRoute::SubscriptionConfirmed { packet_id } => {
                        debug!(target: "mqtt_transport", "Subscription confirmed: {}", packet_id);
                    }
                    EventRoute::InfrastructureEvent(event_str) => {
                        trace!(target: "mqtt_transport", "MQTT event: {}", event_str);
                    }
                    EventRoute::ConnectionAcknowledged | EventRoute::OutgoingEvent => {}
                },
                Err(e) => {
                    self.handle_connection_lost(e.to_string()).await;
                    break;
                }
            }
        }

        debug!("MQTT event loop stopped");
    }

    /// Route one inbound message to subscribers, intercepting refresh requests
    pub fn handle_inbound(self: &Arc<Self>, message: BrokerMessage) -> InboundAction {
        let publisher: Arc<dyn BrokerPublisher> = self.clone();
        route_inbound(publisher, &self.events, message)
    }

    async fn handle_connection_lost(&self, detail: String) {
        *self.client.lock().await = None;
        self.set_state(ConnectionState::Disconnected);

        let reason = if self.disconnecting.load(Ordering::SeqCst) {
            info!("MQTT disconnected");
            DisconnectReason::Requested
        } else {
            warn!("MQTT connection lost: {}", detail);
            DisconnectReason::Lost(detail)
        };
        self.emit(BrokerEvent::Disconnected(reason));
    }

    /// Disconnect from the broker.
    ///
    /// Cancels any in-flight connect loop, announces the disconnect unless
    /// `skip_last_will` is set, and retries closing while the transport still
    /// reports connected. The client is always released afterwards.
    pub async fn disconnect(&self, skip_last_will: bool) {
        self.cancel_pending_connect();

        let client = self.client.lock().await.clone();
        let Some(client) = client else {
            return;
        };

        if !self.is_connected() {
            trace!("MQTT client not connected. Skipping");
            *self.client.lock().await = None;
            return;
        }

        debug!("Disconnecting from MQTT broker");
        self.disconnecting.store(true, Ordering::SeqCst);
        let mut state_rx = self.state_tx.subscribe();
        let mut tries = 0u32;

        if !skip_last_will && self.send_lwt_disconnect().await {
            tokio::time::sleep(LWT_FLUSH_DELAY).await;
        }

        while self.is_connected() && tries < MAX_DISCONNECT_ATTEMPTS {
            tries += 1;
            trace!("Trying to disconnect from the broker (Try: {})", tries);

            if let Err(e) = client.disconnect().await {
                warn!("Disconnect request failed: {}", e);
            }

            let _ = tokio::time::timeout(
                DISCONNECT_RETRY_DELAY,
                state_rx.wait_for(|state| *state != ConnectionState::Connected),
            )
            .await;
        }

        if let Some(handle) = self.event_loop_handle.lock().await.take() {
            handle.abort();
        }
        *self.client.lock().await = None;

        if self.is_connected() {
            self.set_state(ConnectionState::Disconnected);
            self.emit(BrokerEvent::Disconnected(DisconnectReason::Requested));
        }
        self.disconnecting.store(false, Ordering::SeqCst);
        info!("MQTT client disconnected");
    }

    /// Disconnect with the last-will announcement and forget the configuration
    pub async fn shutdown(&self) {
        self.disconnect(false).await;
        *self.settings.write().await = None;
        self.set_state(ConnectionState::Uninitialized);
    }

    /// Publish text under the machine prefix; `None` publishes an empty payload
    pub async fn publish_message(&self, topic: &str, payload: Option<&str>) {
        self.publish_bytes(topic, payload.map(str::as_bytes)).await;
    }

    /// Publish bytes under the machine prefix; `None` publishes an empty payload
    pub async fn publish_bytes(&self, topic: &str, payload: Option<&[u8]>) {
        let Some(settings) = self.settings().await else {
            trace!("MQTT not configured. Skipping publish");
            return;
        };

        if !self.is_connected() {
            trace!("MQTT client not connected. Skipping publish");
            return;
        }

        if topic.trim().is_empty() {
            trace!("Empty or invalid topic name. Skipping publish");
            return;
        }

        let full_topic = full_topic_name(&settings.config.prefix, topic);
        let payload = payload.unwrap_or_default().to_vec();
        trace!("Publishing to {}: ({} bytes)", full_topic, payload.len());

        let message = OutboundMessage::build(full_topic, payload, &settings.config.messages);
        if let Err(e) = self.send(message).await {
            error!("Failed to publish message: {}", e);
        }
    }

    /// Publish the retained discovery announcement for one monitored value.
    ///
    /// `state_topic` is the logical topic the value is published on.
    pub async fn publish_discovery_message(
        &self,
        state_topic: &str,
        monitor_key: &str,
        descriptor: &DiscoveryDescriptor,
    ) {
        let Some(settings) = self.settings().await else {
            return;
        };

        let discovery = &settings.config.discovery;
        if !discovery.enabled {
            trace!("MQTT discovery disabled");
            return;
        }

        if !self.is_connected() {
            trace!("MQTT client not connected. Skipping discovery");
            return;
        }

        let announcement = build_announcement(
            &self.identity,
            discovery.domain_prefix,
            &discovery.topic_prefix,
            monitor_key,
            &full_topic_name(&settings.config.prefix, state_topic),
            descriptor,
        );

        let json = match serde_json::to_string_pretty(&announcement.document) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize discovery document: {}", e);
                return;
            }
        };

        debug!("Publishing discovery to {}", announcement.config_topic);
        let message = OutboundMessage::retained(announcement.config_topic, json);
        if let Err(e) = self.send(message).await {
            error!("Failed to publish discovery message: {}", e);
        }
    }

    async fn send(&self, message: OutboundMessage) -> Result<(), MqttError> {
        // Clone out of the lock so a full request queue never blocks the event loop
        let client = self.client.lock().await.clone();
        let client = client.ok_or(MqttError::NotConnected {
            state: self.state(),
        })?;

        client
            .publish(message.topic, message.qos, message.retain, message.payload)
            .await
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn send_lwt_connect(&self) {
        let Some(settings) = self.settings().await else {
            return;
        };
        let lwt = &settings.config.lwt;
        if !lwt.enabled || !self.is_connected() || lwt.connect_message.trim().is_empty() {
            return;
        }

        if let Err(e) = self.send(lwt_message(&settings.config, &lwt.connect_message)).await {
            warn!("Failed to send LWT connect message: {}", e);
        }
    }

    /// Queue the disconnect announcement; returns whether it was queued
    async fn send_lwt_disconnect(&self) -> bool {
        let Some(settings) = self.settings().await else {
            return false;
        };
        let lwt = &settings.config.lwt;
        if !lwt.enabled || !self.is_connected() || lwt.disconnect_message.trim().is_empty() {
            return false;
        }

        trace!("Sending LWT message before disconnecting");
        match self
            .send(lwt_message(&settings.config, &lwt.disconnect_message))
            .await
        {
            Ok(()) => true,
            Err(e) => {
                warn!("Failed to send LWT disconnect message: {}", e);
                false
            }
        }
    }

    fn emit(&self, event: BrokerEvent) {
        // No subscribers is not an error
        let _ = self.events.send(event);
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!("MQTT state {:?} -> {:?}", current, state);
            *current = state;
            true
        });
    }

    fn current_cancel_token(&self) -> CancellationToken {
        match self.connect_cancel.lock() {
            Ok(token) => token.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    fn cancel_pending_connect(&self) {
        let mut token = match self.connect_cancel.lock() {
            Ok(token) => token,
            Err(poisoned) => poisoned.into_inner(),
        };
        token.cancel();
        *token = CancellationToken::new();
    }

    async fn settings(&self) -> Option<Arc<BrokerSettings>> {
        self.settings.read().await.clone()
    }

    /// Subscribe to connection events
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    /// Watch connection state transitions
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn identity(&self) -> &MachineIdentity {
        &self.identity
    }

    /// Whether connect/disconnect announcements are enabled
    pub async fn is_last_will_enabled(&self) -> bool {
        self.settings()
            .await
            .is_some_and(|settings| settings.config.lwt_enabled())
    }

    /// Broker address for diagnostics, `None` when uninitialized
    pub async fn broker_info(&self) -> Option<String> {
        self.settings().await.map(|settings| settings.endpoint.info())
    }
}

#[async_trait]
impl BrokerPublisher for BrokerConnection {
    async fn publish_bytes(&self, topic: &str, payload: Option<&[u8]>) {
        BrokerConnection::publish_bytes(self, topic, payload).await
    }

    async fn publish_discovery(
        &self,
        state_topic: &str,
        monitor_key: &str,
        descriptor: &DiscoveryDescriptor,
    ) {
        self.publish_discovery_message(state_topic, monitor_key, descriptor)
            .await
    }

    async fn announce_connected(&self) {
        self.send_lwt_connect().await
    }

    fn is_connected(&self) -> bool {
        BrokerConnection::is_connected(self)
    }
}
