//! Payload codec: the structural-clone boundary contract.
//!
//! Everything crossing the controller-backend boundary is plain data
//! (`serde_json::Value`): deep, acyclic by construction, cloned rather than
//! shared. Conversion from user types fails loudly — a payload the codec
//! cannot represent is a caller bug, never silently truncated.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// The value contains something the wire format cannot represent
    /// (non-string map keys, non-finite floats from custom serializers, ...).
    #[error("payload cannot be represented: {0}")]
    Unrepresentable(#[source] serde_json::Error),

    /// The payload does not match the shape the caller asked for.
    #[error("payload does not match the expected shape: {0}")]
    Shape(#[source] serde_json::Error),
}

/// Convert a user value into a wire payload.
pub fn to_payload<T: Serialize>(value: &T) -> Result<Value, CodecError> {
    serde_json::to_value(value).map_err(CodecError::Unrepresentable)
}

/// Convert a wire payload back into a typed value.
pub fn from_payload<T: DeserializeOwned>(payload: &Value) -> Result<T, CodecError> {
    serde_json::from_value(payload.clone()).map_err(CodecError::Shape)
}

/// Deep copy of a payload. `Value` owns its whole tree, so a clone shares
/// no mutable state with the original.
pub fn deep_clone(payload: &Value) -> Value {
    payload.clone()
}
