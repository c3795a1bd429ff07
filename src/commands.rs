//! Broker commands pushed down to agents
//!
//! A few broker topics address the interactive agents rather than the service:
//!
//! | topic               | relay request                 |
//! |---------------------|-------------------------------|
//! | `commands/notify`   | `REQUEST_SHOW_NOTIFICATION`   |
//! | `commands/message`  | `REQUEST_SHOW_MESSAGE`        |
//! | `commands/run`      | `REQUEST_RUN`                 |
//!
//! The payload is a JSON object. Its optional `user` field selects the agent;
//! everything else is forwarded as the request data.

use crate::protocol::ServerRequestType;
use crate::relay::RelayServer;
use crate::transport::mqtt::BrokerMessage;
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("Command payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Command payload must be a JSON object")]
    NotAnObject,
}

/// A broker command resolved into a relay request
#[derive(Debug, Clone, PartialEq)]
pub struct CommandRequest {
    pub kind: ServerRequestType,
    pub user: Option<String>,
    pub data: Value,
}

/// Map a stripped topic onto the relay request it triggers
pub fn command_kind(topic: &str) -> Option<ServerRequestType> {
    match topic.trim_matches('/').to_ascii_lowercase().as_str() {
        "commands/notify" => Some(ServerRequestType::ShowNotification),
        "commands/message" => Some(ServerRequestType::ShowMessage),
        "commands/run" => Some(ServerRequestType::Run),
        _ => None,
    }
}

/// Decode a broker message into a command; `Ok(None)` for other topics
pub fn parse_command(message: &BrokerMessage) -> Result<Option<CommandRequest>, CommandError> {
    let Some(kind) = command_kind(&message.topic) else {
        return Ok(None);
    };

    let mut data: Map<String, Value> = if message.payload.is_empty() {
        Map::new()
    } else {
        match serde_json::from_slice(&message.payload)? {
            Value::Object(map) => map,
            _ => return Err(CommandError::NotAnObject),
        }
    };

    let user = data
        .remove("user")
        .and_then(|user| user.as_str().map(str::to_string))
        .filter(|user| !user.trim().is_empty());

    Ok(Some(CommandRequest {
        kind,
        user,
        data: Value::Object(data),
    }))
}

/// Forward a broker command to the relay; returns how many agents received it
pub async fn dispatch_command(relay: &RelayServer, message: &BrokerMessage) -> usize {
    match parse_command(message) {
        Ok(Some(command)) => {
            debug!(
                "Dispatching {:?} from {} (user: {:?})",
                command.kind, message.full_topic, command.user
            );
            relay
                .send_request(command.kind, command.data, command.user.as_deref())
                .await
        }
        Ok(None) => 0,
        Err(e) => {
            warn!("Ignoring command on {}: {}", message.full_topic, e);
            0
        }
    }
}
