//! The versioned streaming envelope.
//!
//! Every WebSocket message from the backend is one JSON envelope:
//!
//! ```json
//! { "version": "1.0", "type": "device.discovered",
//!   "timestamp": "2026-03-01T12:00:00Z", "session_id": "…",
//!   "payload": { … } }
//! ```
//!
//! The `type` tag is mapped onto a closed [`EventKind`] enumeration with
//! an explicit `Unknown` fallback, so server-introduced event types
//! degrade to a log line instead of a crash. Payloads stay opaque
//! [`serde_json::Value`]s — only the routing fields the resilience core
//! needs (business key, state) are pulled out here, duck-style.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One message received from the streaming connection.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub version: String,

    /// Dot-separated event tag, e.g. `"device.state_changed"`.
    #[serde(rename = "type")]
    pub tag: String,

    pub timestamp: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Type-specific payload. Opaque until handed to a caller decoder.
    #[serde(default)]
    pub payload: Value,
}

/// Closed enumeration of recognized envelope tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventKind {
    ConnectionEstablished,
    Heartbeat,
    DeviceDiscovered,
    DeviceStateChanged,
    SessionStatus,
    Error,
    Unknown,
}

impl EventKind {
    pub fn from_tag(tag: &str) -> Self {
        match tag {
            "connection.established" => Self::ConnectionEstablished,
            "connection.heartbeat" => Self::Heartbeat,
            "device.discovered" => Self::DeviceDiscovered,
            "device.state_changed" => Self::DeviceStateChanged,
            "session.status" => Self::SessionStatus,
            "error" => Self::Error,
            _ => Self::Unknown,
        }
    }
}

/// A decoded stream event, ready to fold into the projection.
///
/// Entity events carry the business key and state pulled from the
/// payload; everything else rides along as an opaque field bag.
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// Connection handshake acknowledged. Logged, not applied.
    Established,
    /// Keep-alive. Silently dropped.
    Heartbeat,
    /// New entity appeared. Idempotent per business key.
    Discovered { key: String, fields: Value },
    /// Existing entity changed state.
    StateChanged {
        key: String,
        previous: Option<String>,
        state: String,
        extra: Value,
    },
    /// Aggregate status for the parent session. Merged into the
    /// source snapshot, shallow per top-level section.
    SessionStatus { payload: Value },
    /// Backend-reported error. Forwarded to the error channel,
    /// never applied to the projection.
    Error { message: String },
    /// Unrecognized tag. Logged and ignored.
    Unknown { tag: String },
}

impl Envelope {
    pub fn kind(&self) -> EventKind {
        EventKind::from_tag(&self.tag)
    }

    /// Decode this envelope into a [`StreamEvent`].
    ///
    /// Returns `None` for entity events whose payload carries no
    /// business key — those are undeliverable and the caller drops
    /// them with a warning (never creating a placeholder entity).
    pub fn event(&self) -> Option<StreamEvent> {
        Some(match self.kind() {
            EventKind::ConnectionEstablished => StreamEvent::Established,
            EventKind::Heartbeat => StreamEvent::Heartbeat,
            EventKind::DeviceDiscovered => StreamEvent::Discovered {
                key: business_key(&self.payload)?,
                fields: self.payload.clone(),
            },
            EventKind::DeviceStateChanged => StreamEvent::StateChanged {
                key: business_key(&self.payload)?,
                previous: str_field(&self.payload, "previous_state"),
                state: str_field(&self.payload, "state")
                    .or_else(|| str_field(&self.payload, "new_state"))?,
                extra: extra_fields(&self.payload),
            },
            EventKind::SessionStatus => StreamEvent::SessionStatus {
                payload: self.payload.clone(),
            },
            EventKind::Error => StreamEvent::Error {
                message: str_field(&self.payload, "message")
                    .unwrap_or_else(|| self.payload.to_string()),
            },
            EventKind::Unknown => StreamEvent::Unknown {
                tag: self.tag.clone(),
            },
        })
    }
}

/// Pull the business key from an entity payload: `mac` for discovered
/// hardware, falling back to `id` for everything else.
fn business_key(payload: &Value) -> Option<String> {
    str_field(payload, "mac").or_else(|| str_field(payload, "id"))
}

fn str_field(payload: &Value, key: &str) -> Option<String> {
    payload.get(key).and_then(Value::as_str).map(String::from)
}

/// Payload minus the routing fields already lifted into the variant.
fn extra_fields(payload: &Value) -> Value {
    let Some(obj) = payload.as_object() else {
        return Value::Null;
    };
    let extra: serde_json::Map<String, Value> = obj
        .iter()
        .filter(|(k, _)| {
            !matches!(k.as_str(), "mac" | "id" | "state" | "new_state" | "previous_state")
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    Value::Object(extra)
}
