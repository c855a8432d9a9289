//! JSON-RPC 2.0 identifiers and message classification.
//!
//! Classification runs on an already parsed `serde_json::Value` and is shared
//! by the HTTP submission path and the backend stdout reader.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Value, json};
use std::fmt;

use crate::error::jsonrpc::JsonRpcError;

/// A JSON-RPC request identifier.
///
/// `0` is a real identifier. Absence of an id is modelled by `Option`, never
/// by a sentinel value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum JsonRpcId {
    /// Integer ID (e.g., `"id": 1`)
    Number(i64),
    /// String ID (e.g., `"id": "abc-123"`)
    String(String),
    /// Explicit null ID - valid but unusual
    Null,
}

impl Serialize for JsonRpcId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            JsonRpcId::Number(n) => serializer.serialize_i64(*n),
            JsonRpcId::String(s) => serializer.serialize_str(s),
            JsonRpcId::Null => serializer.serialize_none(),
        }
    }
}

impl<'de> Deserialize<'de> for JsonRpcId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        parse_id(&value)
            .map_err(|_| serde::de::Error::custom("JSON-RPC ID must be a string, integer or null"))
    }
}

impl fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JsonRpcId::Number(n) => write!(f, "{n}"),
            JsonRpcId::String(s) => write!(f, "\"{s}\""),
            JsonRpcId::Null => f.write_str("null"),
        }
    }
}

impl From<&JsonRpcId> for Value {
    fn from(id: &JsonRpcId) -> Self {
        match id {
            JsonRpcId::Number(n) => Value::from(*n),
            JsonRpcId::String(s) => Value::String(s.clone()),
            JsonRpcId::Null => Value::Null,
        }
    }
}

/// JSON-RPC 2.0 message kind.
///
/// Determined by presence/absence of `id` and `method` fields:
/// - Request: has both `id` and `method`
/// - Response: has `id` but no `method`
/// - Notification: has `method` but no `id`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsonRpcMessageKind {
    /// Has both `id` and `method`: a request expecting a response.
    Request { id: JsonRpcId, method: String },
    /// Has `id` but no `method`: a response to a previous request.
    Response { id: JsonRpcId },
    /// Has `method` but no `id`: a fire-and-forget notification.
    Notification { method: String },
}

impl JsonRpcMessageKind {
    /// The message id, if the message carries one.
    pub fn id(&self) -> Option<&JsonRpcId> {
        match self {
            Self::Request { id, .. } | Self::Response { id } => Some(id),
            Self::Notification { .. } => None,
        }
    }
}

/// Classify a parsed JSON-RPC value without taking ownership.
///
/// A missing `jsonrpc` member is tolerated; a present one must be `"2.0"`.
///
/// # Errors
///
/// - `InvalidVersion` if `jsonrpc` is present but not `"2.0"`
/// - `InvalidId` if `id` is present but not a string, integer or null
/// - `Unclassifiable` if neither `id` nor `method` is present
pub fn classify_jsonrpc(value: &Value) -> Result<JsonRpcMessageKind, JsonRpcClassifyError> {
    if let Some(version) = value.get("jsonrpc") {
        if version.as_str() != Some("2.0") {
            return Err(JsonRpcClassifyError::InvalidVersion);
        }
    }
    classify_shape(value)
}

/// Classify by `id`/`method` presence alone, ignoring `jsonrpc`.
///
/// Used on the backend read path, where anything that parses and has a
/// recognisable shape is forwarded untouched.
pub fn classify_shape(value: &Value) -> Result<JsonRpcMessageKind, JsonRpcClassifyError> {
    if !value.is_object() {
        return Err(JsonRpcClassifyError::NotAnObject);
    }

    // `get` distinguishes a missing key from `"id": null` and from `"id": 0`.
    let id = value
        .get("id")
        .map(parse_id)
        .transpose()
        .map_err(|_| JsonRpcClassifyError::InvalidId)?;
    let method = value
        .get("method")
        .and_then(|v| v.as_str())
        .map(String::from);

    match (id, method) {
        (Some(id), Some(method)) => Ok(JsonRpcMessageKind::Request { id, method }),
        (Some(id), None) => Ok(JsonRpcMessageKind::Response { id }),
        (None, Some(method)) => Ok(JsonRpcMessageKind::Notification { method }),
        (None, None) => Err(JsonRpcClassifyError::Unclassifiable),
    }
}

/// Parse a JSON value into a `JsonRpcId`.
///
/// Accepts string, integer, or null. Rejects floats, booleans, arrays, objects.
pub fn parse_id(value: &Value) -> Result<JsonRpcId, JsonRpcClassifyError> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .map(JsonRpcId::Number)
            .ok_or(JsonRpcClassifyError::InvalidId),
        Value::String(s) => Ok(JsonRpcId::String(s.clone())),
        Value::Null => Ok(JsonRpcId::Null),
        _ => Err(JsonRpcClassifyError::InvalidId),
    }
}

/// Build a JSON-RPC error response for `id`.
pub fn error_response(id: &JsonRpcId, error: &JsonRpcError) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": Value::from(id),
        "error": error,
    })
}

/// Errors that can occur during JSON-RPC message classification.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JsonRpcClassifyError {
    /// The value is not a JSON object (batches are arrays and land here too).
    #[error("message is not a JSON object")]
    NotAnObject,
    /// The `jsonrpc` field is present but not `"2.0"`.
    #[error("invalid jsonrpc version field")]
    InvalidVersion,
    /// The `id` field is present but not a valid JSON-RPC ID.
    #[error("invalid id field")]
    InvalidId,
    /// The message has neither `id` nor `method`.
    #[error("message has neither id nor method")]
    Unclassifiable,
}
