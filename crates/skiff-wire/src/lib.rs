// JSON wire protocol for the real-time telemetry channel.
//
// Inbound control messages and outbound acks/events share one envelope
// convention: a `type` tag in snake_case selects the variant. Unknown tags
// and malformed JSON surface as `Error::Deserialize` so the transport can
// drop the message without closing the connection.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to serialize message")]
    Serialize(serde_json::Error),
    #[error("failed to deserialize message")]
    Deserialize(serde_json::Error),
}

/// Control messages sent by clients.
///
/// ```
/// use skiff_wire::{ClientMessage, decode_client};
///
/// let message = decode_client(r#"{"type":"ping"}"#).expect("decode");
/// assert_eq!(message, ClientMessage::Ping);
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    // Identity and capability negotiation; first message on a session.
    Connect {
        #[serde(default)]
        client: ClientKind,
        #[serde(default)]
        capabilities: Capabilities,
    },
    // Upsert one subscription per listed channel.
    Subscribe { channels: Vec<ChannelRequest> },
    // Remove subscriptions by channel name; fire-and-forget.
    Unsubscribe { channels: Vec<String> },
    // Application-level liveness probe; server replies with Pong.
    Ping,
}

/// Acks and events sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    // Reply to Connect naming the server build and supported features.
    Connected {
        server_version: String,
        features: Vec<String>,
    },
    // Reply to Subscribe listing the channels that were accepted.
    Subscribed { channels: Vec<String> },
    // Reply to Ping with the server clock in unix milliseconds.
    Pong { timestamp: i64 },
    // One metric update. `delta` is true when the payload was sent because
    // it differs from the previous send, false for a full (first) send.
    Event {
        timestamp: i64,
        channel: String,
        data: Value,
        delta: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        sequence: Option<u64>,
    },
}

/// Kind of connecting client, used for observability grouping only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientKind {
    Mobile,
    Browser,
    Automation,
    // Catch-all for client kinds this build does not know about.
    #[serde(other)]
    Other,
}

impl ClientKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Mobile => "mobile",
            ClientKind::Browser => "browser",
            ClientKind::Automation => "automation",
            ClientKind::Other => "other",
        }
    }
}

impl Default for ClientKind {
    fn default() -> Self {
        ClientKind::Other
    }
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Capability flags negotiated once at connect time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Capabilities {
    #[serde(default)]
    pub compression: bool,
    #[serde(default)]
    pub binary: bool,
    #[serde(default)]
    pub delta: bool,
    #[serde(default)]
    pub batch: bool,
}

/// One channel entry inside a Subscribe message. Intervals are whole
/// seconds; sub-second cadence is not part of the protocol.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelRequest {
    pub channel: String,
    pub interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<BTreeMap<String, Value>>,
    #[serde(default)]
    pub delta_only: bool,
}

pub fn decode_client(input: &str) -> Result<ClientMessage> {
    serde_json::from_str(input).map_err(Error::Deserialize)
}

pub fn encode_client(message: &ClientMessage) -> Result<String> {
    serde_json::to_string(message).map_err(Error::Serialize)
}

pub fn decode_server(input: &str) -> Result<ServerMessage> {
    serde_json::from_str(input).map_err(Error::Deserialize)
}

pub fn encode_server(message: &ServerMessage) -> Result<String> {
    serde_json::to_string(message).map_err(Error::Serialize)
}
