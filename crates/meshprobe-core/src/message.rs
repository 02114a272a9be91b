//! Node messages
//!
//! Frames carry JSON objects. Every node message has an `origin` and
//! normally a `class`; the extra fields depend on the class:
//!
//! | class               | fields                          |
//! |---------------------|---------------------------------|
//! | `keepAlive`         |                                 |
//! | `received`          | `origin_ts` (echoed probe time) |
//! | `changedConnection` | `nodes` (space separated ids)   |
//! | `newConnection`     | `nodeId`                        |
//!
//! Probes sent by the supervisor have no class, only `origin`, `destiny`
//! and `timestamp`.
//!
//! Nodes are not strict about field types. `timestamp` is kept as whatever
//! JSON value was sent and `nodeId` may be a number or a string. A class
//! field of the wrong type reads as absent, so the message classifies as
//! invalid instead of failing to decode.

use chrono::{DateTime, Local, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use thiserror::Error;

/// Errors decoding or encoding a message
#[derive(Error, Debug)]
pub enum MessageError {
    #[error("Invalid message format: {0}")]
    Json(#[from] serde_json::Error),
}

/// Message classes understood by the supervisor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageClass {
    KeepAlive,
    Received,
    ChangedConnection,
    NewConnection,
}

impl MessageClass {
    pub const ALL: [MessageClass; 4] = [
        MessageClass::KeepAlive,
        MessageClass::Received,
        MessageClass::ChangedConnection,
        MessageClass::NewConnection,
    ];

    /// Wire name
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageClass::KeepAlive => "keepAlive",
            MessageClass::Received => "received",
            MessageClass::ChangedConnection => "changedConnection",
            MessageClass::NewConnection => "newConnection",
        }
    }

    /// Parse a wire name
    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.as_str() == name)
    }
}

impl fmt::Display for MessageClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A message decoded from a frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Sender id
    pub origin: String,
    /// Message class (see [`MessageClass`])
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    /// Sender's clock, normally milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<Value>,
    /// Echoed probe timestamp (`received`)
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub origin_ts: Option<u64>,
    /// Current mesh members (`changedConnection`)
    #[serde(default, deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub nodes: Option<String>,
    /// Newly connected node (`newConnection`), a number or a string
    #[serde(rename = "nodeId", default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<Value>,
    /// Any other fields the node sent
    #[serde(flatten)]
    pub extra: Map<String, Value>,
    /// Local time the frame was received; never on the wire
    #[serde(skip)]
    pub received_at: Option<DateTime<Local>>,
}

impl Message {
    fn with_class(origin: &str, class: MessageClass, timestamp: u64) -> Self {
        Self {
            origin: origin.to_string(),
            class: Some(class.as_str().to_string()),
            timestamp: Some(Value::from(timestamp)),
            origin_ts: None,
            nodes: None,
            node_id: None,
            extra: Map::new(),
            received_at: None,
        }
    }

    pub fn keep_alive(origin: &str, timestamp: u64) -> Self {
        Self::with_class(origin, MessageClass::KeepAlive, timestamp)
    }

    pub fn received(origin: &str, timestamp: u64, origin_ts: u64) -> Self {
        Self {
            origin_ts: Some(origin_ts),
            ..Self::with_class(origin, MessageClass::Received, timestamp)
        }
    }

    pub fn changed_connection(origin: &str, timestamp: u64, nodes: &str) -> Self {
        Self {
            nodes: Some(nodes.to_string()),
            ..Self::with_class(origin, MessageClass::ChangedConnection, timestamp)
        }
    }

    pub fn new_connection(origin: &str, timestamp: u64, node_id: u64) -> Self {
        Self {
            node_id: Some(Value::from(node_id)),
            ..Self::with_class(origin, MessageClass::NewConnection, timestamp)
        }
    }

    /// Decode the text of a frame
    pub fn decode(text: &str) -> Result<Self, MessageError> {
        Ok(serde_json::from_str(text)?)
    }

    /// Encode as frame text (without the delimiter)
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Known class of this message, if any
    pub fn message_class(&self) -> Option<MessageClass> {
        self.class.as_deref().and_then(MessageClass::from_wire)
    }

    /// `timestamp` as shown to the user; empty when absent
    pub fn timestamp_text(&self) -> String {
        self.timestamp.as_ref().map(value_text).unwrap_or_default()
    }

    /// `nodeId` when it is a number or a string
    pub fn node_id_text(&self) -> Option<String> {
        match self.node_id.as_ref()? {
            Value::Number(n) => Some(n.to_string()),
            Value::String(s) => Some(s.clone()),
            _ => None,
        }
    }

    /// Attach the local receipt time
    pub fn stamped(mut self, at: DateTime<Local>) -> Self {
        self.received_at = Some(at);
        self
    }
}

/// Strings unquoted, null empty, anything else as JSON
fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Accept any JSON type, keeping the value only if it has the expected type
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(value.and_then(|v| serde_json::from_value(v).ok()))
}

/// An outbound probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Probe {
    pub origin: String,
    pub destiny: String,
    pub timestamp: u64,
}

impl Probe {
    pub fn encode(&self) -> Result<String, MessageError> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Current wall clock in milliseconds since the Unix epoch
pub fn now_millis() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
