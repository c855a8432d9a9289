//! Error types for the bridge.
//!
//! `BridgeError` is the taxonomy surfaced to callers: every variant maps to a
//! distinct JSON-RPC error code so a client can tell a timeout from a dead
//! backend without parsing messages. `FramingError` covers a single NDJSON
//! line and never escapes the transport reader.

pub mod jsonrpc;

use self::jsonrpc::{ErrorData, JsonRpcError};

// ─────────────────────────────────────────────────────────────────────────────
// Error codes
// ─────────────────────────────────────────────────────────────────────────────

/// JSON-RPC parse error (standard).
pub const PARSE_ERROR: i32 = -32700;
/// JSON-RPC invalid request (standard).
pub const INVALID_REQUEST: i32 = -32600;
/// Backend did not reply before the request timeout.
pub const UPSTREAM_TIMEOUT: i32 = -32001;
/// Backend process could not be started.
pub const SPAWN_FAILED: i32 = -32010;
/// Write to backend stdin failed or backend not alive.
pub const WRITE_FAILED: i32 = -32011;
/// Submission referenced a session that does not exist.
pub const UNKNOWN_SESSION: i32 = -32012;
/// Reply was already forwarded to the session.
pub const DUPLICATE_DELIVERY: i32 = -32013;
/// Backend exited or was replaced while the request was pending.
pub const BACKEND_RESTARTED: i32 = -32014;
/// Backend switching requested on a fixed-backend bridge.
pub const ROUTE_DISABLED: i32 = -32015;
/// Request id already pending on the submitting session.
pub const DUPLICATE_REQUEST_ID: i32 = -32016;

// ─────────────────────────────────────────────────────────────────────────────
// BridgeError
// ─────────────────────────────────────────────────────────────────────────────

/// Bridge error taxonomy.
///
/// `Clone` so that a single backend failure can be fanned out to every
/// pending waiter.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BridgeError {
    /// Backend process could not be spawned.
    #[error("failed to spawn backend '{backend}': {reason}")]
    SpawnError { backend: String, reason: String },

    /// Backend is not alive or the stdin write failed.
    #[error("failed to write to backend '{backend}': {reason}")]
    WriteError { backend: String, reason: String },

    /// The correlated wait expired.
    #[error("backend did not reply to '{method}' within {timeout_ms}ms")]
    UpstreamTimeout { method: String, timeout_ms: u64 },

    /// Submission referenced a session that does not exist or has expired.
    #[error("unknown session '{session_id}'")]
    UnknownSession { session_id: String },

    /// Malformed line on the backend's stdout.
    #[error("malformed backend output: {reason}")]
    ParseError { reason: String },

    /// Reply already forwarded to this session.
    #[error("reply for id {id} already delivered")]
    DuplicateDelivery { id: String },

    /// A request with the same id is still pending on this session.
    #[error("request id {id} is already pending on this session")]
    DuplicateRequestId { id: String },

    /// Backend exited or was rerouted before the reply arrived.
    #[error("backend '{backend}' restarted before replying")]
    BackendRestarted { backend: String },

    /// Submission is not a single JSON-RPC 2.0 object.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    /// `/route` used on a bridge built with a fixed backend.
    #[error("backend switching is disabled")]
    RouteDisabled,
}

impl BridgeError {
    /// Map to the JSON-RPC error code delivered to clients.
    pub fn to_jsonrpc_code(&self) -> i32 {
        match self {
            Self::SpawnError { .. } => SPAWN_FAILED,
            Self::WriteError { .. } => WRITE_FAILED,
            Self::UpstreamTimeout { .. } => UPSTREAM_TIMEOUT,
            Self::UnknownSession { .. } => UNKNOWN_SESSION,
            Self::ParseError { .. } => PARSE_ERROR,
            Self::DuplicateDelivery { .. } => DUPLICATE_DELIVERY,
            Self::DuplicateRequestId { .. } => DUPLICATE_REQUEST_ID,
            Self::BackendRestarted { .. } => BACKEND_RESTARTED,
            Self::InvalidRequest { .. } => INVALID_REQUEST,
            Self::RouteDisabled => ROUTE_DISABLED,
        }
    }

    /// Machine-readable type name used for metrics labels and `ErrorData`.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::SpawnError { .. } => "spawn_error",
            Self::WriteError { .. } => "write_error",
            Self::UpstreamTimeout { .. } => "upstream_timeout",
            Self::UnknownSession { .. } => "unknown_session",
            Self::ParseError { .. } => "parse_error",
            Self::DuplicateDelivery { .. } => "duplicate_delivery",
            Self::DuplicateRequestId { .. } => "duplicate_request_id",
            Self::BackendRestarted { .. } => "backend_restarted",
            Self::InvalidRequest { .. } => "invalid_request",
            Self::RouteDisabled => "route_disabled",
        }
    }

    /// Backend name when the error concerns one.
    fn backend(&self) -> Option<&str> {
        match self {
            Self::SpawnError { backend, .. }
            | Self::WriteError { backend, .. }
            | Self::BackendRestarted { backend } => Some(backend),
            _ => None,
        }
    }

    /// Details safe to return to a client.
    ///
    /// Spawn and write reasons can contain filesystem paths or OS error text,
    /// so they stay in the logs.
    fn safe_details(&self) -> Option<String> {
        match self {
            Self::UpstreamTimeout { timeout_ms, .. } => {
                Some(format!("no reply after {timeout_ms}ms"))
            }
            Self::DuplicateRequestId { id } => Some(format!("id {id} is still pending")),
            Self::InvalidRequest { reason } => Some(reason.clone()),
            _ => None,
        }
    }

    /// Message returned to clients. Spawn and write failures are summarised.
    fn client_message(&self) -> String {
        match self {
            Self::SpawnError { backend, .. } => format!("backend '{backend}' is unavailable"),
            Self::WriteError { backend, .. } => {
                format!("failed to forward request to backend '{backend}'")
            }
            other => other.to_string(),
        }
    }

    /// Build the JSON-RPC error object delivered through the push channel.
    pub fn to_jsonrpc_error(&self, correlation_id: &str) -> JsonRpcError {
        JsonRpcError {
            code: self.to_jsonrpc_code(),
            message: self.client_message(),
            data: Some(ErrorData {
                correlation_id: correlation_id.to_string(),
                error_type: self.error_type_name().to_string(),
                backend: self.backend().map(String::from),
                details: self.safe_details(),
            }),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// FramingError
// ─────────────────────────────────────────────────────────────────────────────

/// Errors from NDJSON line framing.
#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    /// A single line exceeded the configured maximum.
    #[error("message exceeds {max_bytes} bytes")]
    MessageTooLarge { max_bytes: usize },

    /// The line is not valid JSON or not a classifiable JSON-RPC message.
    #[error("malformed JSON-RPC message: {reason}")]
    MalformedJson { reason: String },

    /// JSON-RPC batch arrays are not supported on the backend pipe.
    #[error("JSON-RPC batch arrays are not supported")]
    UnsupportedBatch,
}

impl FramingError {
    /// Label for the framing error counter.
    pub fn error_type_name(&self) -> &'static str {
        match self {
            Self::MessageTooLarge { .. } => "message_too_large",
            Self::MalformedJson { .. } => "malformed_json",
            Self::UnsupportedBatch => "unsupported_batch",
        }
    }
}

impl From<FramingError> for BridgeError {
    fn from(err: FramingError) -> Self {
        BridgeError::ParseError {
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn all_variants() -> Vec<BridgeError> {
        vec![
            BridgeError::SpawnError {
                backend: "b".into(),
                reason: "r".into(),
            },
            BridgeError::WriteError {
                backend: "b".into(),
                reason: "r".into(),
            },
            BridgeError::UpstreamTimeout {
                method: "m".into(),
                timeout_ms: 10,
            },
            BridgeError::UnknownSession {
                session_id: "s".into(),
            },
            BridgeError::ParseError { reason: "r".into() },
            BridgeError::DuplicateDelivery { id: "1".into() },
            BridgeError::DuplicateRequestId { id: "1".into() },
            BridgeError::BackendRestarted { backend: "b".into() },
            BridgeError::InvalidRequest { reason: "r".into() },
            BridgeError::RouteDisabled,
        ]
    }

    #[test]
    fn test_taxonomy_codes_are_distinct() {
        let codes: HashSet<i32> = all_variants().iter().map(|e| e.to_jsonrpc_code()).collect();
        assert_eq!(codes.len(), all_variants().len());
    }

    #[test]
    fn test_duplicate_id_is_not_reported_as_invalid_request() {
        let dup = BridgeError::DuplicateRequestId { id: "7".into() };
        let invalid = BridgeError::InvalidRequest { reason: "r".into() };
        assert_eq!(dup.to_jsonrpc_code(), DUPLICATE_REQUEST_ID);
        assert_eq!(invalid.to_jsonrpc_code(), INVALID_REQUEST);
    }

    #[test]
    fn test_timeout_maps_to_upstream_timeout_code() {
        let err = BridgeError::UpstreamTimeout {
            method: "add".into(),
            timeout_ms: 10_000,
        };
        let rpc = err.to_jsonrpc_error("corr-1");
        assert_eq!(rpc.code, UPSTREAM_TIMEOUT);
        let data = rpc.data.unwrap();
        assert_eq!(data.error_type, "upstream_timeout");
        assert_eq!(data.correlation_id, "corr-1");
        assert_eq!(data.details.as_deref(), Some("no reply after 10000ms"));
    }

    #[test]
    fn test_write_error_hides_reason_from_client() {
        let err = BridgeError::WriteError {
            backend: "calc".into(),
            reason: "Broken pipe (os error 32) at /srv/secret".into(),
        };
        let rpc = err.to_jsonrpc_error("c");
        assert!(!rpc.message.contains("secret"));
        let data = rpc.data.unwrap();
        assert_eq!(data.details, None);
        assert_eq!(data.backend.as_deref(), Some("calc"));
    }

    #[test]
    fn test_framing_error_labels() {
        let labels: Vec<&str> = [
            FramingError::MessageTooLarge { max_bytes: 8 },
            FramingError::MalformedJson { reason: "r".into() },
            FramingError::UnsupportedBatch,
        ]
        .iter()
        .map(FramingError::error_type_name)
        .collect();
        assert_eq!(labels, ["message_too_large", "malformed_json", "unsupported_batch"]);
    }

    #[test]
    fn test_framing_error_converts_to_parse_error() {
        let err: BridgeError = FramingError::UnsupportedBatch.into();
        assert_eq!(err.to_jsonrpc_code(), PARSE_ERROR);
    }
}
