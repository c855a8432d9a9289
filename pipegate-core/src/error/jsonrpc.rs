//! JSON-RPC 2.0 error response structures.

use serde::{Deserialize, Serialize};

/// JSON-RPC 2.0 error object.
///
/// Embedded in the `error` member of a response frame pushed to the
/// originating session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcError {
    /// Error code (standard or pipegate-specific)
    pub code: i32,

    /// Human-readable error message
    pub message: String,

    /// Additional error data (optional)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<ErrorData>,
}

/// Additional error context data.
///
/// All fields are safe for client consumption.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ErrorData {
    /// Identifier for finding this error in the bridge logs
    pub correlation_id: String,

    /// Machine-readable error type name (for metrics/logging)
    pub error_type: String,

    /// Backend the request was bound for
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backend: Option<String>,

    /// Type-specific error details (sanitized)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_jsonrpc_error_serialization() {
        let error = JsonRpcError {
            code: -32001,
            message: "Backend did not reply in time".to_string(),
            data: Some(ErrorData {
                correlation_id: "550e8400-e29b-41d4-a716-446655440000".to_string(),
                error_type: "upstream_timeout".to_string(),
                backend: Some("calculator".to_string()),
                details: None,
            }),
        };

        let json = serde_json::to_value(&error).unwrap();

        assert_eq!(json["code"], -32001);
        assert_eq!(json["data"]["error_type"], "upstream_timeout");
        assert_eq!(json["data"]["backend"], "calculator");
        assert!(json["data"].get("details").is_none());
    }

    #[test]
    fn test_error_without_data() {
        let error = JsonRpcError {
            code: -32700,
            message: "Parse error".to_string(),
            data: None,
        };

        let json = serde_json::to_string(&error).unwrap();
        assert!(!json.contains("\"data\""));
    }
}
