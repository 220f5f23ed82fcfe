//! Wire envelope exchanged with the bank.
//!
//! Both bindings carry the same JSON envelope
//! `{ "id": string, "timestamp": number, "data": object }`. The engine never
//! interprets `data`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Result, TransportError};

/// Marker stored in `data.type` of liveness probes.
pub const HEARTBEAT_TYPE: &str = "heartbeat";

/// One message on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireMessage {
    /// Correlation id. Absent on bank-initiated messages.
    #[serde(default, alias = "messageId", skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Milliseconds since the UNIX epoch at the sender.
    #[serde(default)]
    pub timestamp: u64,
    /// Opaque banking payload.
    #[serde(default)]
    pub data: Value,
}

impl WireMessage {
    /// Builds a request envelope stamped with the current time.
    pub fn request(id: impl Into<String>, data: Value) -> Self {
        Self {
            id: Some(id.into()),
            timestamp: now_millis(),
            data,
        }
    }

    /// Builds a response envelope answering `id`.
    pub fn response(id: impl Into<String>, data: Value) -> Self {
        Self::request(id, data)
    }

    /// Returns true if the payload is a liveness probe.
    pub fn is_heartbeat(&self) -> bool {
        self.data.get("type").and_then(Value::as_str) == Some(HEARTBEAT_TYPE)
    }

    /// Serializes the envelope to JSON bytes.
    pub fn to_json(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self).map_err(|e| TransportError::Serialization(e.to_string()))
    }

    /// Parses an envelope from JSON bytes.
    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        serde_json::from_slice(bytes).map_err(|e| TransportError::MalformedFrame {
            reason: e.to_string(),
        })
    }
}

/// Payload of a heartbeat request.
pub fn heartbeat_payload() -> Value {
    serde_json::json!({ "type": HEARTBEAT_TYPE, "timestamp": now_millis() })
}

/// Generates a fresh correlation id.
pub fn next_message_id() -> String {
    format!("msg_{}", uuid::Uuid::new_v4().simple())
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
