//! Wire protocol for controller-backend communication.
//!
//! A single direction-agnostic message shape crosses the boundary in both
//! directions: requests carry a user-registered action name, responses carry
//! one of the reserved kinds. The channel may carry foreign traffic, so
//! decoding is lenient: anything without a string `id` and a string `action`
//! is dropped by the caller.

use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

/// Reserved request action that signals cooperative cancellation of the
/// call with the same id.
pub const CANCEL_ACTION: &str = "cancel";

/// Unit of message exchange: correlation id, action (or reserved response
/// kind), and a payload of plain data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: String,
    pub action: String,
    #[serde(default)]
    pub payload: Value,
}

impl Envelope {
    pub fn new(id: impl Into<String>, action: impl Into<String>, payload: Value) -> Self {
        Self {
            id: id.into(),
            action: action.into(),
            payload,
        }
    }

    /// Build a response envelope for one of the reserved kinds.
    pub fn response(id: impl Into<String>, kind: ResponseKind, payload: Value) -> Self {
        Self::new(id, kind.as_str(), payload)
    }

    pub fn cancel(id: impl Into<String>) -> Self {
        Self::new(id, CANCEL_ACTION, Value::Null)
    }

    /// Wire form. Produces a fresh value tree, so the caller keeps no shared
    /// mutable state with whatever crosses the boundary.
    pub fn encode(&self) -> Value {
        json!({
            "id": self.id,
            "action": self.action,
            "payload": self.payload,
        })
    }

    /// Decode a wire value. Returns `None` for any value that is not an
    /// object carrying a string `id` and a string `action` — such traffic
    /// is not ours and must be dropped without side effects.
    pub fn decode(wire: &Value) -> Option<Self> {
        let obj = wire.as_object()?;
        let id = obj.get("id")?.as_str()?;
        let action = obj.get("action")?.as_str()?;
        let payload = obj.get("payload").cloned().unwrap_or(Value::Null);
        Some(Self::new(id, action, payload))
    }

    /// The reserved response kind, if this envelope is a response.
    pub fn kind(&self) -> Option<ResponseKind> {
        ResponseKind::parse(&self.action)
    }

    pub fn is_cancel(&self) -> bool {
        self.action == CANCEL_ACTION
    }
}

/// Reserved response kinds a backend may emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResponseKind {
    Result,
    Error,
    InitError,
    ProgressLive,
    ProgressDeferred,
    Console,
}

impl ResponseKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Result => "result",
            Self::Error => "error",
            Self::InitError => "init-error",
            Self::ProgressLive => "progress-live",
            Self::ProgressDeferred => "progress-deferred",
            Self::Console => "console",
        }
    }

    pub fn parse(action: &str) -> Option<Self> {
        match action {
            "result" => Some(Self::Result),
            "error" => Some(Self::Error),
            "init-error" => Some(Self::InitError),
            "progress-live" => Some(Self::ProgressLive),
            "progress-deferred" => Some(Self::ProgressDeferred),
            "console" => Some(Self::Console),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Result | Self::Error | Self::InitError)
    }
}

/// True for action names user operations may not register: the cancel
/// request and every reserved response kind.
pub fn is_reserved_action(name: &str) -> bool {
    name == CANCEL_ACTION || ResponseKind::parse(name).is_some()
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// Payload schema of `error` and `init-error` envelopes.
///
/// `detail` carries diagnostic context (an init failure chain, a panic
/// message). `cancelled` marks the terminal acknowledgment of a
/// cooperative cancel.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(skip_serializing_if = "is_false")]
    pub cancelled: bool,
}

impl ErrorPayload {
    pub fn execution(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn init(message: impl Into<String>, detail: Option<String>) -> Self {
        Self {
            message: message.into(),
            detail,
            cancelled: false,
        }
    }

    pub fn cancelled() -> Self {
        Self {
            message: "operation cancelled".to_string(),
            detail: None,
            cancelled: true,
        }
    }

    pub fn to_value(&self) -> Value {
        let mut payload = json!({ "message": self.message });
        if let Some(ref detail) = self.detail {
            payload["detail"] = Value::String(detail.clone());
        }
        if self.cancelled {
            payload["cancelled"] = Value::Bool(true);
        }
        payload
    }

    /// Lenient decode: a payload that does not match the schema still
    /// yields something usable as an error message.
    pub fn from_value(payload: &Value) -> Self {
        match serde_json::from_value(payload.clone()) {
            Ok(decoded) => decoded,
            Err(_) => Self::execution(payload.to_string()),
        }
    }
}
