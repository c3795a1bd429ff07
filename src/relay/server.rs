//! WebSocket relay server
//!
//! Serves one WebSocket endpoint on the IPv4 loopback. Every accepted socket
//! runs its own receive loop; outbound frames go through a per-socket queue
//! drained by a writer task, so a slow or failing peer never blocks the
//! others.

use super::registry::ConnectionRegistry;
use super::router::RelayRouter;
use super::RelayError;
use crate::protocol::{decode_envelope, encode_server_request, ServerRequestType};
use crate::transport::BrokerPublisher;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn, Instrument};
use uuid::Uuid;
use warp::http::StatusCode;
use warp::ws::{Message, WebSocket, Ws};
use warp::{Filter, Reply};

/// Close status for non-text frames
const UNSUPPORTED_DATA: u16 = 1003;
const GOING_AWAY: u16 = 1001;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

/// Local relay between the service and per-user agents
pub struct RelayServer {
    port: u16,
    registry: Arc<ConnectionRegistry>,
    router: Arc<RelayRouter>,
    listening: Arc<AtomicBool>,
    shutdown: Mutex<Option<CancellationToken>>,
    server_task: Mutex<Option<JoinHandle<()>>>,
}

impl RelayServer {
    pub fn new(port: u16, publisher: Arc<dyn BrokerPublisher>) -> Self {
        let registry = Arc::new(ConnectionRegistry::new());
        let router = Arc::new(RelayRouter::new(registry.clone(), publisher));

        Self {
            port,
            registry,
            router,
            listening: Arc::new(AtomicBool::new(false)),
            shutdown: Mutex::new(None),
            server_task: Mutex::new(None),
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.registry.clone()
    }

    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// The warp filter serving the relay endpoint
    pub fn filter(&self) -> impl Filter<Extract = (warp::reply::Response,), Error = std::convert::Infallible> + Clone {
        relay_filter(self.registry.clone(), self.router.clone())
    }

    /// Bind the loopback port and serve until [`RelayServer::stop`]
    pub async fn start(&self) -> Result<SocketAddr, RelayError> {
        if self.is_listening() {
            return Err(RelayError::AlreadyRunning);
        }

        let token = CancellationToken::new();
        let shutdown = token.clone();
        let (addr, server) = warp::serve(self.filter())
            .try_bind_with_graceful_shutdown((Ipv4Addr::LOCALHOST, self.port), async move {
                shutdown.cancelled().await
            })
            .map_err(|source| RelayError::Bind {
                port: self.port,
                source,
            })?;

        self.listening.store(true, Ordering::SeqCst);
        let listening = self.listening.clone();
        let handle = tokio::spawn(async move {
            server.await;
            listening.store(false, Ordering::SeqCst);
            debug!("Relay server task finished");
        });

        *self.shutdown.lock().await = Some(token);
        *self.server_task.lock().await = Some(handle);

        info!("Relay server listening on ws://{}", addr);
        Ok(addr)
    }

    /// Close every agent connection and stop listening
    pub async fn stop(&self) {
        let Some(token) = self.shutdown.lock().await.take() else {
            return;
        };

        info!("Stopping relay server");
        self.registry.close_all(GOING_AWAY, "Server shutting down").await;
        token.cancel();

        if let Some(handle) = self.server_task.lock().await.take() {
            if tokio::time::timeout(STOP_TIMEOUT, handle).await.is_err() {
                warn!("Relay server did not stop within {:?}", STOP_TIMEOUT);
            }
        }
        self.listening.store(false, Ordering::SeqCst);
    }

    /// Push a request to agents; returns how many connections accepted it.
    ///
    /// Nothing is sent while the server is stopped. A blank or missing
    /// `username` broadcasts to every connection. A username with no registered
    /// agent is reported as an error and nothing is sent.
    pub async fn send_request(
        &self,
        kind: ServerRequestType,
        data: Value,
        username: Option<&str>,
    ) -> usize {
        if !self.is_listening() {
            trace!("Relay server is not running. Skipping {:?}", kind);
            return 0;
        }

        let frame = encode_server_request(kind, data);
        let target = username.map(str::trim).filter(|name| !name.is_empty());

        match target {
            None => {
                let delivered = self.registry.broadcast(&frame).await;
                debug!("{:?} broadcast to {} agents", kind, delivered);
                delivered
            }
            Some(username) => match self.registry.connection_for(username).await {
                Some(connection_id) => {
                    usize::from(self.registry.send_to(&connection_id, &frame).await)
                }
                None => {
                    error!("No agent connected for user {}", username);
                    0
                }
            },
        }
    }

    pub async fn connected_agents(&self) -> usize {
        self.registry.connection_count().await
    }
}

/// WebSocket upgrade on `/`; any other request gets 400
pub fn relay_filter(
    registry: Arc<ConnectionRegistry>,
    router: Arc<RelayRouter>,
) -> impl Filter<Extract = (warp::reply::Response,), Error = std::convert::Infallible> + Clone {
    let socket = warp::path::end()
        .and(warp::ws())
        .and(warp::any().map(move || registry.clone()))
        .and(warp::any().map(move || router.clone()))
        .map(|ws: Ws, registry: Arc<ConnectionRegistry>, router: Arc<RelayRouter>| {
            // Fragmented frames arrive reassembled; only memory bounds their size
            ws.max_message_size(usize::MAX)
                .max_frame_size(usize::MAX)
                .on_upgrade(move |socket| {
                    let connection_id = Uuid::new_v4().simple().to_string();
                    let span = crate::relay_span!(connection_id = %connection_id);
                    handle_socket(socket, connection_id, registry, router).instrument(span)
                })
                .into_response()
        });

    let fallback = warp::any().map(|| {
        warp::reply::with_status("WebSocket connections only", StatusCode::BAD_REQUEST)
            .into_response()
    });

    socket.or(fallback).unify()
}

async fn handle_socket(
    socket: WebSocket,
    connection_id: String,
    registry: Arc<ConnectionRegistry>,
    router: Arc<RelayRouter>,
) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();

    registry.add_connection(&connection_id, tx.clone()).await;
    info!("Agent connection {} opened", connection_id);

    let writer_registry = registry.clone();
    let writer_id = connection_id.clone();
    let send_task = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            let closing = message.is_close();
            if let Err(e) = sender.send(message).await {
                warn!("Relay send to {} failed: {}", writer_id, e);
                writer_registry.remove_connection(&writer_id).await;
                break;
            }
            if closing {
                break;
            }
        }
        let _ = sender.close().await;
    });

    while let Some(result) = receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(e) => {
                debug!("Relay connection {} read error: {}", connection_id, e);
                break;
            }
        };

        if let Ok(text) = message.to_str() {
            match decode_envelope(text) {
                Ok(envelope) => {
                    let outcome = router.route(&connection_id, envelope).await;
                    trace!("Relay frame from {} routed: {:?}", connection_id, outcome);
                }
                Err(e) => debug!("Dropping frame from {}: {}", connection_id, e),
            }
        } else if message.is_binary() {
            warn!("Binary frame from {}, closing connection", connection_id);
            let _ = tx.send(Message::close_with(
                UNSUPPORTED_DATA,
                "This server only accepts text frames",
            ));
            break;
        } else if message.is_close() {
            debug!("Close frame from {}", connection_id);
            break;
        }
    }

    registry.remove_connection(&connection_id).await;
    drop(tx);
    let _ = send_task.await;
    info!("Agent connection {} closed", connection_id);
}
