//! Wire envelopes exchanged with local agents over the relay
//!
//! Every relay frame carries one JSON object:
//!
//! ```json
//! { "messageType": "CLIENT_REQUEST", "content": { "type": "REQUEST_CONNECTED", "data": { "username": "alice" } } }
//! ```
//!
//! Decoding produces a closed [`Envelope`] sum type. Kinds this side does not
//! understand decode to an explicit `Unrecognized` variant; only malformed JSON
//! or missing required fields are decode errors.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

pub const MESSAGE_CLIENT_REQUEST: &str = "CLIENT_REQUEST";
pub const MESSAGE_CLIENT_RESPONSE: &str = "CLIENT_RESPONSE";
pub const MESSAGE_API_MESSAGE: &str = "API_MESSAGE";
pub const MESSAGE_SERVER_REQUEST: &str = "SERVER_REQUEST";

pub const REQUEST_CONNECTED: &str = "REQUEST_CONNECTED";
pub const REQUEST_PUBLISH_MESSAGE: &str = "REQUEST_PUBLISH_MESSAGE";
pub const RESPONSE_ADDON: &str = "RESPONSE_ADDON";

/// Envelope decoding errors
#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("Malformed envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("Invalid payload encoding: {0}")]
    Payload(#[from] base64::DecodeError),
}

/// A decoded relay frame
#[derive(Debug, Clone, PartialEq)]
pub enum Envelope {
    ClientRequest(ClientRequest),
    ClientResponse(ClientResponse),
    /// Inbound API message, opaque to the relay
    ApiMessage(Value),
    Unrecognized(String),
}

/// Requests sent by an agent
#[derive(Debug, Clone, PartialEq)]
pub enum ClientRequest {
    /// Agent announces the user session it belongs to
    Connected { username: String },
    /// Agent asks the service to publish to the broker
    PublishMessage { topic: String, payload: Vec<u8> },
    Unrecognized(String),
}

/// Responses sent by an agent
#[derive(Debug, Clone, PartialEq)]
pub enum ClientResponse {
    Addon { addon_id: String, addon_data: Value },
    Unrecognized(String),
}

/// Requests pushed from the service down to agents
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ServerRequestType {
    #[serde(rename = "REQUEST_SHOW_MESSAGE")]
    ShowMessage,
    #[serde(rename = "REQUEST_SHOW_NOTIFICATION")]
    ShowNotification,
    #[serde(rename = "REQUEST_RUN")]
    Run,
    #[serde(rename = "REQUEST_ADDON")]
    Addon,
}

#[derive(Deserialize)]
struct RawEnvelope {
    #[serde(rename = "messageType")]
    message_type: String,
    content: Value,
}

#[derive(Deserialize)]
struct RawContent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Value,
}

#[derive(Deserialize)]
struct ConnectedData {
    username: String,
}

#[derive(Deserialize)]
struct PublishData {
    topic: String,
    /// Base64-encoded bytes
    #[serde(default)]
    payload: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct AddonResponseData {
    addon_id: String,
    #[serde(default)]
    addon_data: Value,
}

/// Decode one complete text frame
pub fn decode_envelope(text: &str) -> Result<Envelope, EnvelopeError> {
    let raw: RawEnvelope = serde_json::from_str(text)?;

    let envelope = match raw.message_type.as_str() {
        MESSAGE_CLIENT_REQUEST => {
            let content: RawContent = serde_json::from_value(raw.content)?;
            Envelope::ClientRequest(decode_client_request(content)?)
        }
        MESSAGE_CLIENT_RESPONSE => {
            let content: RawContent = serde_json::from_value(raw.content)?;
            Envelope::ClientResponse(decode_client_response(content)?)
        }
        MESSAGE_API_MESSAGE => Envelope::ApiMessage(raw.content),
        other => Envelope::Unrecognized(other.to_string()),
    };

    Ok(envelope)
}

fn decode_client_request(content: RawContent) -> Result<ClientRequest, EnvelopeError> {
    let request = match content.kind.as_str() {
        REQUEST_CONNECTED => {
            let data: ConnectedData = serde_json::from_value(content.data)?;
            ClientRequest::Connected {
                username: data.username,
            }
        }
        REQUEST_PUBLISH_MESSAGE => {
            let data: PublishData = serde_json::from_value(content.data)?;
            let payload = match data.payload {
                Some(encoded) => BASE64.decode(encoded.as_bytes())?,
                None => Vec::new(),
            };
            ClientRequest::PublishMessage {
                topic: data.topic,
                payload,
            }
        }
        other => ClientRequest::Unrecognized(other.to_string()),
    };

    Ok(request)
}

fn decode_client_response(content: RawContent) -> Result<ClientResponse, EnvelopeError> {
    let response = match content.kind.as_str() {
        RESPONSE_ADDON => {
            let data: AddonResponseData = serde_json::from_value(content.data)?;
            ClientResponse::Addon {
                addon_id: data.addon_id,
                addon_data: data.addon_data,
            }
        }
        other => ClientResponse::Unrecognized(other.to_string()),
    };

    Ok(response)
}

/// Encode a service-to-agent request frame
pub fn encode_server_request(kind: ServerRequestType, data: Value) -> String {
    json!({
        "messageType": MESSAGE_SERVER_REQUEST,
        "content": {
            "type": kind,
            "data": data,
        }
    })
    .to_string()
}

impl ClientRequest {
    /// Encode this request the way an agent sends it
    pub fn to_frame(&self) -> String {
        let content = match self {
            ClientRequest::Connected { username } => json!({
                "type": REQUEST_CONNECTED,
                "data": { "username": username },
            }),
            ClientRequest::PublishMessage { topic, payload } => json!({
                "type": REQUEST_PUBLISH_MESSAGE,
                "data": { "topic": topic, "payload": BASE64.encode(payload) },
            }),
            ClientRequest::Unrecognized(kind) => json!({ "type": kind, "data": null }),
        };

        json!({ "messageType": MESSAGE_CLIENT_REQUEST, "content": content }).to_string()
    }
}
