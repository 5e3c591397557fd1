//! Frame codec for the subscription protocol.
//!
//! Outbound frames are a closed set and encode through serde's internal
//! tagging. Inbound frames are decoded leniently: anything the client does
//! not understand becomes a [`FrameKind::Unknown`] frame instead of an error,
//! so newer server messages never take the connection down.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::constants::FrameKind;

/// Errors from decoding an inbound frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame is not a JSON object")]
    NotAnObject,
}

/// Payload of the `connection_init` handshake frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InitPayload {
    pub headers: BTreeMap<String, String>,
}

/// Payload of a `start` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartPayload {
    pub query: String,
    #[serde(default)]
    pub variables: Map<String, Value>,
}

/// A frame sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    ConnectionInit { payload: InitPayload },
    Start { id: String, payload: StartPayload },
    Stop { id: String },
}

impl OutboundFrame {
    /// Builds the handshake frame carrying the given headers.
    pub fn connection_init(headers: BTreeMap<String, String>) -> Self {
        Self::ConnectionInit {
            payload: InitPayload { headers },
        }
    }

    /// Encodes the frame as JSON text.
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Subscription id targeted by this frame, if any.
    pub fn subscription_id(&self) -> Option<&str> {
        match self {
            Self::ConnectionInit { .. } => None,
            Self::Start { id, .. } | Self::Stop { id } => Some(id),
        }
    }

    /// Returns `true` for `start` frames.
    pub fn is_start(&self) -> bool {
        matches!(self, Self::Start { .. })
    }
}

/// Shape of an inbound frame on the wire.
#[derive(Deserialize)]
struct WireFrame {
    #[serde(rename = "type")]
    kind: FrameKind,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    payload: Option<Value>,
}

/// A decoded and classified frame received from the server.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundFrame {
    pub kind: FrameKind,
    pub id: Option<String>,
    /// Frame payload, `Value::Null` when absent.
    pub payload: Value,
    /// Original text, kept for `Unknown` frames so they can be logged.
    pub raw: Option<String>,
}

impl InboundFrame {
    /// Decodes a frame, failing on bodies that are not a typed JSON object.
    pub fn try_decode(text: &str) -> Result<Self, FrameError> {
        // Derived struct deserialization also accepts sequences, so a bare
        // array would otherwise decode positionally into a typed frame.
        let value: Value = serde_json::from_str(text)?;
        if !value.is_object() {
            return Err(FrameError::NotAnObject);
        }
        let wire: WireFrame = serde_json::from_value(value)?;
        let raw = (wire.kind == FrameKind::Unknown).then(|| text.to_string());
        Ok(Self {
            kind: wire.kind,
            id: wire.id,
            payload: wire.payload.unwrap_or(Value::Null),
            raw,
        })
    }

    /// Decodes a frame, turning any failure into a synthetic `Unknown` frame
    /// that preserves the raw body.
    pub fn decode(text: &str) -> Self {
        Self::try_decode(text).unwrap_or_else(|_| Self::unknown(text))
    }

    /// Builds an `Unknown` frame around an undecodable body.
    pub fn unknown(text: &str) -> Self {
        Self {
            kind: FrameKind::Unknown,
            id: None,
            payload: Value::Null,
            raw: Some(text.to_string()),
        }
    }

    /// Returns the entity object at `payload.data.<entity>`, if present.
    pub fn entity(&self, entity: &str) -> Option<&Value> {
        self.payload
            .get("data")
            .and_then(|data| data.get(entity))
            .filter(|value| value.is_object())
    }
}
