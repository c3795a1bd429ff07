//! Dispatch of decoded relay envelopes

use super::registry::ConnectionRegistry;
use crate::protocol::{ClientRequest, ClientResponse, Envelope};
use crate::transport::BrokerPublisher;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// What routing one envelope did
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteOutcome {
    Registered { username: String },
    Published { topic: String },
    AddonResponse { addon_id: String },
    /// Recognized, logged, not routed further
    Logged,
    Dropped(String),
}

/// Routes envelopes from agents to the registry or the broker
pub struct RelayRouter {
    registry: Arc<ConnectionRegistry>,
    publisher: Arc<dyn BrokerPublisher>,
}

impl RelayRouter {
    pub fn new(registry: Arc<ConnectionRegistry>, publisher: Arc<dyn BrokerPublisher>) -> Self {
        Self {
            registry,
            publisher,
        }
    }

    pub async fn route(&self, connection_id: &str, envelope: Envelope) -> RouteOutcome {
        match envelope {
            Envelope::ClientRequest(request) => self.route_request(connection_id, request).await,
            Envelope::ClientResponse(response) => self.route_response(connection_id, response),
            Envelope::ApiMessage(content) => {
                debug!("API message from {}: {}", connection_id, content);
                RouteOutcome::Logged
            }
            Envelope::Unrecognized(kind) => {
                warn!("Unknown message type from {}: {}", connection_id, kind);
                RouteOutcome::Dropped(format!("unknown message type {kind}"))
            }
        }
    }

    async fn route_request(&self, connection_id: &str, request: ClientRequest) -> RouteOutcome {
        match request {
            ClientRequest::Connected { username } => {
                match self.registry.register_user(&username, connection_id).await {
                    Some(username) => {
                        info!("Agent connected for user {} ({})", username, connection_id);
                        RouteOutcome::Registered { username }
                    }
                    None => {
                        warn!("Connection {} sent a blank username", connection_id);
                        RouteOutcome::Dropped("blank username".to_string())
                    }
                }
            }
            ClientRequest::PublishMessage { topic, payload } => {
                if topic.trim().is_empty() || payload.is_empty() {
                    debug!("Publish request from {} without topic or payload", connection_id);
                    return RouteOutcome::Dropped("empty publish request".to_string());
                }

                self.publisher.publish_bytes(&topic, Some(&payload)).await;
                RouteOutcome::Published { topic }
            }
            ClientRequest::Unrecognized(kind) => {
                warn!("Unknown request type from {}: {}", connection_id, kind);
                RouteOutcome::Dropped(format!("unknown request type {kind}"))
            }
        }
    }

    fn route_response(&self, connection_id: &str, response: ClientResponse) -> RouteOutcome {
        match response {
            ClientResponse::Addon {
                addon_id,
                addon_data,
            } => {
                if addon_id.trim().is_empty() {
                    error!("Addon response from {} without addon id", connection_id);
                    return RouteOutcome::Dropped("blank addon id".to_string());
                }

                debug!("Addon response for {}: {}", addon_id, addon_data);
                RouteOutcome::AddonResponse { addon_id }
            }
            ClientResponse::Unrecognized(kind) => {
                warn!("Unknown response type from {}: {}", connection_id, kind);
                RouteOutcome::Dropped(format!("unknown response type {kind}"))
            }
        }
    }
}
