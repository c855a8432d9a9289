//! NDJSON framing for the backend's stdout.
//!
//! Bytes arrive in arbitrary chunks. [`LineBuffer`] reassembles them into
//! complete lines and keeps the trailing partial line across reads.
//! [`parse_backend_line`] turns one line into a classified JSON-RPC message.
//! A bad line yields an error for that line only; the caller logs it and
//! keeps reading.

use serde_json::Value;

use crate::error::FramingError;
use crate::jsonrpc::{JsonRpcMessageKind, classify_shape};

/// One parsed line from the backend.
#[derive(Debug, Clone, PartialEq)]
pub struct BackendMessage {
    pub kind: JsonRpcMessageKind,
    pub value: Value,
}

/// Accumulates stdout bytes and yields complete lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: Vec<u8>,
    max_line_bytes: usize,
    /// Inside an oversized line; drop bytes until the next newline.
    discarding: bool,
}

impl LineBuffer {
    pub fn new(max_line_bytes: usize) -> Self {
        Self {
            buf: Vec::new(),
            max_line_bytes,
            discarding: false,
        }
    }

    /// Append a chunk and return every line it completes, in order.
    ///
    /// Blank lines are skipped. A line longer than `max_line_bytes` yields a
    /// single `MessageTooLarge` error and its remaining bytes are dropped.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Result<Vec<u8>, FramingError>> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            let head = &rest[..pos];
            rest = &rest[pos + 1..];

            if self.discarding {
                self.discarding = false;
                continue;
            }
            if self.buf.len() + head.len() > self.max_line_bytes {
                self.buf.clear();
                lines.push(Err(FramingError::MessageTooLarge {
                    max_bytes: self.max_line_bytes,
                }));
                continue;
            }

            self.buf.extend_from_slice(head);
            let mut line = std::mem::take(&mut self.buf);
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            lines.push(Ok(line));
        }

        if !self.discarding {
            if self.buf.len() + rest.len() > self.max_line_bytes {
                self.buf.clear();
                self.discarding = true;
                lines.push(Err(FramingError::MessageTooLarge {
                    max_bytes: self.max_line_bytes,
                }));
            } else {
                self.buf.extend_from_slice(rest);
            }
        }

        lines
    }

    /// Bytes of the incomplete trailing line.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }
}

/// Parse and classify one complete line.
pub fn parse_backend_line(line: &[u8]) -> Result<BackendMessage, FramingError> {
    let value: Value =
        serde_json::from_slice(line).map_err(|e| FramingError::MalformedJson {
            reason: e.to_string(),
        })?;

    if value.is_array() {
        return Err(FramingError::UnsupportedBatch);
    }

    let kind = classify_shape(&value).map_err(|e| FramingError::MalformedJson {
        reason: e.to_string(),
    })?;
    if value.get("jsonrpc").and_then(Value::as_str) != Some("2.0") {
        tracing::debug!(id = ?kind.id(), "backend message without jsonrpc 2.0 version");
    }

    Ok(BackendMessage { kind, value })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::JsonRpcId;

    fn ok_lines(results: Vec<Result<Vec<u8>, FramingError>>) -> Vec<String> {
        results
            .into_iter()
            .map(|r| String::from_utf8(r.unwrap()).unwrap())
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // LineBuffer
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_partial_line_is_retained() {
        let mut buf = LineBuffer::new(1024);
        assert!(buf.push(br#"{"jsonrpc":"2.0","#).is_empty());
        assert_eq!(buf.pending(), 17);
        let lines = ok_lines(buf.push(b"\"id\":1,\"result\":5}\n"));
        assert_eq!(lines, vec![r#"{"jsonrpc":"2.0","id":1,"result":5}"#]);
        assert_eq!(buf.pending(), 0);
    }

    #[test]
    fn test_multiple_lines_in_one_chunk() {
        let mut buf = LineBuffer::new(1024);
        let lines = ok_lines(buf.push(b"a\nb\r\n\n  \nc"));
        assert_eq!(lines, vec!["a", "b"]);
        assert_eq!(ok_lines(buf.push(b"\n")), vec!["c"]);
    }

    #[test]
    fn test_oversized_line_is_dropped_and_stream_continues() {
        let mut buf = LineBuffer::new(8);
        let results = buf.push(b"0123456789");
        assert_eq!(results.len(), 1);
        assert!(matches!(
            results[0],
            Err(FramingError::MessageTooLarge { max_bytes: 8 })
        ));
        // Tail of the oversized line is discarded, next line survives.
        assert!(buf.push(b"abcdef").is_empty());
        assert_eq!(ok_lines(buf.push(b"\nok\n")), vec!["ok"]);
    }

    #[test]
    fn test_oversized_complete_line() {
        let mut buf = LineBuffer::new(4);
        let results = buf.push(b"too long\nfine\n");
        assert_eq!(results.len(), 2);
        assert!(results[0].is_err());
        assert_eq!(results[1].as_ref().unwrap(), b"fine");
    }

    // ─────────────────────────────────────────────────────────────────────
    // parse_backend_line
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn test_parse_response() {
        let msg = parse_backend_line(br#"{"jsonrpc":"2.0","id":1,"result":5}"#).unwrap();
        assert_eq!(
            msg.kind,
            JsonRpcMessageKind::Response {
                id: JsonRpcId::Number(1)
            }
        );
        assert_eq!(msg.value["result"], 5);
    }

    #[test]
    fn test_parse_garbage() {
        let err = parse_backend_line(b"Loading model weights...").unwrap_err();
        assert!(matches!(err, FramingError::MalformedJson { .. }));
    }

    #[test]
    fn test_parse_rejects_batch() {
        let err = parse_backend_line(br#"[{"jsonrpc":"2.0","id":1,"result":1}]"#).unwrap_err();
        assert!(matches!(err, FramingError::UnsupportedBatch));
    }

    #[test]
    fn test_parse_accepts_missing_version() {
        let msg = parse_backend_line(br#"{"id":1,"result":5}"#).unwrap();
        assert_eq!(
            msg.kind,
            JsonRpcMessageKind::Response {
                id: JsonRpcId::Number(1)
            }
        );
        assert_eq!(msg.value, serde_json::json!({"id": 1, "result": 5}));
    }

    #[test]
    fn test_parse_rejects_shapeless_object() {
        let err = parse_backend_line(br#"{"jsonrpc":"2.0","result":1}"#).unwrap_err();
        assert!(matches!(err, FramingError::MalformedJson { .. }));
    }

    #[test]
    fn test_garbage_between_valid_lines() {
        let mut buf = LineBuffer::new(1024);
        let chunk = b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":1}\nnot json\n{\"jsonrpc\":\"2.0\",\"id\":2,\"result\":2}\n";
        let parsed: Vec<_> = buf
            .push(chunk)
            .into_iter()
            .map(|line| line.and_then(|l| parse_backend_line(&l)))
            .collect();
        assert_eq!(parsed.len(), 3);
        assert!(parsed[0].is_ok());
        assert!(parsed[1].is_err());
        assert_eq!(parsed[2].as_ref().unwrap().value["id"], 2);
    }
}
