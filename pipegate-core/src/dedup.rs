//! Duplicate-delivery suppression.
//!
//! Each session owns one [`DedupFilter`]. A correlated reply is keyed by the
//! upstream id it was forwarded under plus a canonical rendering of its body,
//! so the same reply delivered twice is suppressed while a client that reuses
//! an id after the earlier request resolved still gets its second answer.
//! Backend-initiated messages have no upstream id and are keyed by their own.

use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::{HashSet, VecDeque};

use crate::jsonrpc::parse_id;

/// SHA-256 of `(id, canonical body)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DedupKey([u8; 32]);

impl DedupKey {
    /// Key for a message carrying an `id`. Messages without an id
    /// (notifications) are never deduplicated.
    pub fn for_message(message: &Value) -> Option<Self> {
        let id = message.get("id")?;
        parse_id(id).ok()?;

        Some(Self::digest(id, message))
    }

    /// Key for a reply to a forwarded request. `upstream_id` is allocated
    /// once per forwarded request and never reused.
    pub fn for_reply(upstream_id: i64, message: &Value) -> Self {
        Self::digest(&Value::from(upstream_id), message)
    }

    fn digest(id: &Value, message: &Value) -> Self {
        let mut hasher = Sha256::new();
        write_canonical(&mut hasher, id);
        hasher.update([0u8]);
        write_canonical(&mut hasher, message);
        Self(hasher.finalize().into())
    }
}

/// Feed a JSON value to the hasher with object keys in sorted order, so the
/// key does not depend on map ordering features of `serde_json`.
fn write_canonical(hasher: &mut Sha256, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for key in keys {
                write_canonical(hasher, &Value::String(key.clone()));
                hasher.update(b":");
                write_canonical(hasher, &map[key]);
                hasher.update(b",");
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for item in items {
                write_canonical(hasher, item);
                hasher.update(b",");
            }
            hasher.update(b"]");
        }
        scalar => hasher.update(scalar.to_string().as_bytes()),
    }
}

/// Bounded set of already-forwarded replies, oldest evicted first.
#[derive(Debug)]
pub struct DedupFilter {
    seen: HashSet<DedupKey>,
    order: VecDeque<DedupKey>,
    capacity: usize,
}

impl DedupFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            seen: HashSet::with_capacity(capacity.min(1024)),
            order: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
        }
    }

    /// Record `key`. Returns `false` if it was already recorded; the caller
    /// must then skip delivery.
    pub fn admit(&mut self, key: DedupKey) -> bool {
        if !self.seen.insert(key) {
            return false;
        }
        self.order.push_back(key);
        if self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    /// Forget everything. Used when a sink re-attaches after a gap.
    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }
}
