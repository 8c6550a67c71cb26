use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};


/// Sub-protocol negotiated by subscribing clients.
pub const CLIENT_SUBPROTOCOL: &str = "graphql-ws";

/// Sub-protocol reserved for producers injecting events into the server.
pub const CONTROL_SUBPROTOCOL: &str = "graphql-subscriptions";

/// Client → Server message types
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "init")]
    Init {
        #[serde(default)]
        payload: Option<Value>,
    },
    #[serde(rename = "subscription_start")]
    Start {
        #[serde(deserialize_with = "deserialize_id")]
        id: String,
        query: String,
        #[serde(default)]
        variables: Option<Map<String, Value>>,
        #[serde(default, rename = "operationName")]
        operation_name: Option<String>,
    },
    #[serde(rename = "subscription_end")]
    Stop {
        #[serde(deserialize_with = "deserialize_id")]
        id: String,
    },
}

const CLIENT_TYPES: &[&str] = &["init", "subscription_start", "subscription_end"];

/// Producer → Server message types (control connections only)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ControlMessage {
    #[serde(rename = "subscription_data")]
    Publish {
        subscription: String,
        #[serde(default)]
        payload: Value,
    },
}

const CONTROL_TYPES: &[&str] = &["subscription_data"];

/// Server → Client message types
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    InitSuccess,
    InitFail { error: String },
    SubscriptionSuccess { id: String },
    SubscriptionFail { id: String, errors: Vec<String> },
    SubscriptionData { id: String, payload: DataPayload },
}

/// Body of a `subscription_data` frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DataPayload {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<Value>,
}

/// Frames that could not be turned into a protocol message.
///
/// These never terminate a connection; the frame is logged and dropped.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("frame is not valid JSON: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("frame must be a JSON object")]
    NotAnObject,
    #[error("frame has no string 'type' field")]
    MissingType,
    #[error("unknown message type '{0}'")]
    UnknownType(String),
    #[error("invalid '{kind}' message: {source}")]
    Invalid {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("binary frames are not supported")]
    Binary,
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
}

/// Parse a frame received on a client connection.
pub fn parse_client_frame(text: &str) -> Result<ClientMessage, ProtocolError> {
    parse_frame(text, CLIENT_TYPES)
}

/// Parse a frame received on a control connection.
///
/// Only the internal publish form is accepted here; a client-shaped
/// `subscription_data` (carrying `id` instead of `subscription`) is rejected.
pub fn parse_control_frame(text: &str) -> Result<ControlMessage, ProtocolError> {
    parse_frame(text, CONTROL_TYPES)
}

fn parse_frame<T>(text: &str, accepted: &[&str]) -> Result<T, ProtocolError>
where
    T: for<'de> Deserialize<'de>,
{
    let value: Value = serde_json::from_str(text).map_err(ProtocolError::Malformed)?;
    if !value.is_object() {
        return Err(ProtocolError::NotAnObject);
    }

    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(ProtocolError::MissingType)?
        .to_string();
    if !accepted.contains(&kind.as_str()) {
        return Err(ProtocolError::UnknownType(kind));
    }

    serde_json::from_value(value).map_err(|source| ProtocolError::Invalid { kind, source })
}

/// Serialize a server message into a wire frame.
pub fn encode(message: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}

/// Serialize a control message into a wire frame.
pub fn encode_control(message: &ControlMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(message).map_err(ProtocolError::Encode)
}

/// Accepts string ids and integer ids (normalised to their decimal form).
fn deserialize_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match Value::deserialize(deserializer)? {
        Value::String(id) => Ok(id),
        Value::Number(n) if n.is_i64() || n.is_u64() => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "id must be a string or an integer, got {}",
            other
        ))),
    }
}
