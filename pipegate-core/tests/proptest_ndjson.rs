//! Property-based tests for NDJSON line reassembly.
//!
//! However the backend's stdout is chunked, the reassembled lines must be
//! exactly the lines that were written, in order.

use pipegate_core::transport::ndjson::{LineBuffer, parse_backend_line};
use proptest::prelude::*;

// ─────────────────────────────────────────────────────────────────────────────
// Strategies
// ─────────────────────────────────────────────────────────────────────────────

fn arb_jsonrpc_id() -> impl Strategy<Value = String> {
    prop_oneof![
        (0i64..=100_000).prop_map(|n| n.to_string()),
        "[a-zA-Z0-9_-]{1,32}".prop_map(|s| format!("\"{s}\"")),
    ]
}

fn arb_method() -> impl Strategy<Value = String> {
    "[a-zA-Z][a-zA-Z0-9_/]{0,30}"
}

fn arb_jsonrpc_message() -> impl Strategy<Value = String> {
    prop_oneof![
        (arb_jsonrpc_id(), arb_method()).prop_map(|(id, method)| {
            format!(r#"{{"jsonrpc":"2.0","id":{id},"method":"{method}","params":{{}}}}"#)
        }),
        (arb_jsonrpc_id(), "[a-zA-Z0-9 .:-]{0,64}").prop_map(|(id, text)| {
            format!(r#"{{"jsonrpc":"2.0","id":{id},"result":"{text}"}}"#)
        }),
        arb_method().prop_map(|method| format!(r#"{{"jsonrpc":"2.0","method":"{method}"}}"#)),
    ]
}

/// Split `bytes` at the given (unsorted, possibly duplicate) offsets.
fn chunk(bytes: &[u8], cuts: &[usize]) -> Vec<Vec<u8>> {
    let mut cuts: Vec<usize> = cuts.iter().map(|c| c % (bytes.len() + 1)).collect();
    cuts.sort_unstable();
    cuts.dedup();

    let mut chunks = Vec::new();
    let mut start = 0;
    for cut in cuts {
        chunks.push(bytes[start..cut].to_vec());
        start = cut;
    }
    chunks.push(bytes[start..].to_vec());
    chunks
}

fn reassemble(buffer: &mut LineBuffer, chunks: &[Vec<u8>]) -> Vec<Vec<u8>> {
    chunks
        .iter()
        .flat_map(|c| buffer.push(c))
        .map(|r| r.expect("no line exceeds the limit"))
        .collect()
}

// ─────────────────────────────────────────────────────────────────────────────
// Properties
// ─────────────────────────────────────────────────────────────────────────────

proptest! {
    #[test]
    fn chunking_does_not_change_lines(
        messages in prop::collection::vec(arb_jsonrpc_message(), 1..20),
        cuts in prop::collection::vec(any::<usize>(), 0..40),
        crlf in any::<bool>(),
    ) {
        let terminator = if crlf { "\r\n" } else { "\n" };
        let stream: String = messages.iter().map(|m| format!("{m}{terminator}")).collect();

        let mut buffer = LineBuffer::new(64 * 1024);
        let lines = reassemble(&mut buffer, &chunk(stream.as_bytes(), &cuts));

        let expected: Vec<Vec<u8>> = messages.iter().map(|m| m.as_bytes().to_vec()).collect();
        prop_assert_eq!(lines, expected);
        prop_assert_eq!(buffer.pending(), 0);
    }

    #[test]
    fn every_reassembled_line_parses(
        messages in prop::collection::vec(arb_jsonrpc_message(), 1..10),
        cuts in prop::collection::vec(any::<usize>(), 0..20),
    ) {
        let stream: String = messages.iter().map(|m| format!("{m}\n")).collect();
        let mut buffer = LineBuffer::new(64 * 1024);
        for line in reassemble(&mut buffer, &chunk(stream.as_bytes(), &cuts)) {
            let parsed = parse_backend_line(&line);
            prop_assert!(parsed.is_ok(), "line should parse: {:?}", parsed.err());
        }
    }

    #[test]
    fn trailing_partial_line_is_held(
        message in arb_jsonrpc_message(),
        split in any::<usize>(),
    ) {
        let bytes = message.as_bytes();
        let at = split % bytes.len();
        let mut buffer = LineBuffer::new(64 * 1024);

        prop_assert!(buffer.push(&bytes[..at]).is_empty());
        prop_assert_eq!(buffer.pending(), at);
        prop_assert!(buffer.push(&bytes[at..]).is_empty());

        let lines = buffer.push(b"\n");
        prop_assert_eq!(lines.len(), 1);
        let line = lines.into_iter().next().unwrap().unwrap();
        prop_assert_eq!(line.as_slice(), bytes);
    }

    #[test]
    fn malformed_line_does_not_disturb_neighbours(
        before in arb_jsonrpc_message(),
        garbage in "[a-z ]{1,40}",
        after in arb_jsonrpc_message(),
        cuts in prop::collection::vec(any::<usize>(), 0..10),
    ) {
        let stream = format!("{before}\n{garbage}\n{after}\n");
        let mut buffer = LineBuffer::new(64 * 1024);
        let lines = reassemble(&mut buffer, &chunk(stream.as_bytes(), &cuts));

        let parsed: Vec<_> = lines.iter().filter_map(|l| parse_backend_line(l).ok()).collect();
        // Blank-looking garbage is skipped by the buffer; anything else fails to parse.
        prop_assert_eq!(parsed.len(), 2);
        prop_assert_eq!(&parsed[0].value, &serde_json::from_str::<serde_json::Value>(&before).unwrap());
        prop_assert_eq!(&parsed[1].value, &serde_json::from_str::<serde_json::Value>(&after).unwrap());
    }
}
