//! Request/response correlation.
//!
//! The correlator is the single owner of the pending-request table. Every
//! forwarded request is rewritten to carry a bridge-allocated integer id
//! (the *upstream id*) so that two sessions both using `"id": 1` never
//! collide on the one backend pipe. The client's own id is restored on the
//! matched reply.
//!
//! Matching is strictly by id; replies may arrive in any order.
//!
//! # Ordering
//!
//! [`Correlator::register`] must be called before the request line is
//! written to the backend. A reply that arrives before the write returns
//! then still finds its entry.

use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

use crate::error::BridgeError;
use crate::jsonrpc::JsonRpcId;
use crate::session::SessionId;

type Reply = Result<Value, BridgeError>;

/// One request awaiting a backend reply.
#[derive(Debug)]
pub struct PendingRequest {
    pub client_id: JsonRpcId,
    pub session: SessionId,
    pub method: String,
    pub submitted_at: Instant,
    waiter: oneshot::Sender<Reply>,
}

/// Handle returned by [`Correlator::register`].
#[derive(Debug)]
pub struct Registration {
    pub upstream_id: i64,
    pub session: SessionId,
    pub client_id: JsonRpcId,
    pub method: String,
    /// Request rewritten with the upstream id, ready to write.
    pub line: Vec<u8>,
    receiver: oneshot::Receiver<Reply>,
}

/// Outcome of feeding a backend reply to the correlator.
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// The reply completed a pending request.
    Matched {
        session: SessionId,
        client_id: JsonRpcId,
        method: String,
        latency: Duration,
    },
    /// No pending request had this id. The reply is dropped.
    Unmatched { id: Option<Value> },
}

#[derive(Debug, Default)]
struct PendingTable {
    by_upstream: HashMap<i64, PendingRequest>,
    /// `(session, client id)` pairs currently pending.
    live: HashSet<(SessionId, JsonRpcId)>,
}

impl PendingTable {
    fn remove(&mut self, upstream_id: i64) -> Option<PendingRequest> {
        let entry = self.by_upstream.remove(&upstream_id)?;
        self.live
            .remove(&(entry.session.clone(), entry.client_id.clone()));
        Some(entry)
    }
}

/// Pending-request table plus upstream id allocation.
#[derive(Debug)]
pub struct Correlator {
    table: parking_lot::Mutex<PendingTable>,
    next_upstream_id: AtomicI64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    pub fn new() -> Self {
        Self {
            table: parking_lot::Mutex::new(PendingTable::default()),
            next_upstream_id: AtomicI64::new(1),
        }
    }

    /// Register a request before it is forwarded.
    ///
    /// `request` must be a classified JSON-RPC request object carrying
    /// `client_id` as its `id`.
    ///
    /// # Errors
    ///
    /// `DuplicateRequestId` if the session already has `client_id` pending.
    pub fn register(
        &self,
        session: &SessionId,
        client_id: JsonRpcId,
        method: &str,
        mut request: Value,
    ) -> Result<Registration, BridgeError> {
        let upstream_id = self.next_upstream_id.fetch_add(1, Ordering::Relaxed);
        let Some(object) = request.as_object_mut() else {
            return Err(BridgeError::InvalidRequest {
                reason: "request is not a JSON object".to_string(),
            });
        };
        object.insert("id".to_string(), Value::from(upstream_id));
        let line = request.to_string().into_bytes();

        let (waiter, receiver) = oneshot::channel();
        {
            let mut table = self.table.lock();
            if !table.live.insert((session.clone(), client_id.clone())) {
                return Err(BridgeError::DuplicateRequestId {
                    id: client_id.to_string(),
                });
            }
            table.by_upstream.insert(
                upstream_id,
                PendingRequest {
                    client_id: client_id.clone(),
                    session: session.clone(),
                    method: method.to_string(),
                    submitted_at: Instant::now(),
                    waiter,
                },
            );
        }

        tracing::debug!(session_id = %session, %client_id, upstream_id, method, "registered pending request");

        Ok(Registration {
            upstream_id,
            session: session.clone(),
            client_id,
            method: method.to_string(),
            line,
            receiver,
        })
    }

    /// Wait for the reply to `registration` until `deadline`.
    ///
    /// On timeout the entry is removed, so a late reply is dropped as
    /// unmatched.
    pub async fn wait_until(
        &self,
        registration: Registration,
        deadline: tokio::time::Instant,
    ) -> Result<Value, BridgeError> {
        let Registration {
            upstream_id,
            method,
            mut receiver,
            ..
        } = registration;

        let timeout_error = |started: Option<Instant>| BridgeError::UpstreamTimeout {
            method: method.clone(),
            timeout_ms: started.map_or(0, |s| s.elapsed().as_millis() as u64),
        };

        match tokio::time::timeout_at(deadline, &mut receiver).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => Err(timeout_error(None)),
            Err(_) => {
                let removed = self.table.lock().remove(upstream_id);
                match removed {
                    Some(entry) => Err(timeout_error(Some(entry.submitted_at))),
                    // Resolved between the deadline firing and the removal.
                    None => receiver
                        .try_recv()
                        .unwrap_or_else(|_| Err(timeout_error(None))),
                }
            }
        }
    }

    /// Remove a registration whose write failed.
    pub fn cancel(&self, upstream_id: i64) {
        self.table.lock().remove(upstream_id);
    }

    /// Match a backend reply against the table.
    ///
    /// Removal and completion happen under one lock acquisition, so a reply
    /// resolves at most one request and a duplicated reply finds nothing.
    pub fn resolve(&self, mut reply: Value) -> Resolution {
        let Some(upstream_id) = reply.get("id").and_then(Value::as_i64) else {
            return Resolution::Unmatched {
                id: reply.get("id").cloned(),
            };
        };

        let Some(entry) = self.table.lock().remove(upstream_id) else {
            return Resolution::Unmatched {
                id: Some(Value::from(upstream_id)),
            };
        };

        if let Some(object) = reply.as_object_mut() {
            object.insert("id".to_string(), Value::from(&entry.client_id));
        }

        let latency = entry.submitted_at.elapsed();
        let PendingRequest {
            client_id,
            session,
            method,
            waiter,
            ..
        } = entry;

        // The waiter is gone if the caller already timed out.
        let _ = waiter.send(Ok(reply));

        Resolution::Matched {
            session,
            client_id,
            method,
            latency,
        }
    }

    /// Fail every pending request with `error`. Returns how many were failed.
    pub fn fail_all(&self, error: &BridgeError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table.lock();
            table.live.clear();
            table.by_upstream.drain().map(|(_, entry)| entry).collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.waiter.send(Err(error.clone()));
        }
        count
    }

    /// Upstream ids pending right now.
    pub fn pending_ids(&self) -> Vec<i64> {
        self.table.lock().by_upstream.keys().copied().collect()
    }

    /// Fail the listed requests that are still pending. Ids that resolved
    /// in the meantime are skipped. Returns how many were failed.
    pub fn fail_only(&self, upstream_ids: &[i64], error: &BridgeError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut table = self.table.lock();
            upstream_ids
                .iter()
                .filter_map(|id| table.remove(*id))
                .collect()
        };
        let count = drained.len();
        for entry in drained {
            let _ = entry.waiter.send(Err(error.clone()));
        }
        count
    }

    /// Whether `upstream_id` still awaits a reply.
    pub fn is_pending(&self, upstream_id: i64) -> bool {
        self.table.lock().by_upstream.contains_key(&upstream_id)
    }

    pub fn pending_count(&self) -> usize {
        self.table.lock().by_upstream.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn session(name: &str) -> SessionId {
        SessionId::from(name)
    }

    fn request(id: Value, method: &str) -> Value {
        json!({"jsonrpc": "2.0", "id": id, "method": method, "params": {"a": 2, "b": 3}})
    }

    fn deadline(ms: u64) -> tokio::time::Instant {
        tokio::time::Instant::now() + Duration::from_millis(ms)
    }

    fn upstream_line(reg: &Registration) -> Value {
        serde_json::from_slice(&reg.line).unwrap()
    }

    #[tokio::test]
    async fn test_register_rewrites_id() {
        let correlator = Correlator::new();
        let reg = correlator
            .register(&session("a"), JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap();
        let line = upstream_line(&reg);
        assert_eq!(line["id"], json!(reg.upstream_id));
        assert_eq!(line["params"]["a"], 2);
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_reply_before_send_returns_is_matched() {
        let correlator = Correlator::new();
        let reg = correlator
            .register(&session("a"), JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap();

        // A backend that answers synchronously inside the write.
        let reply = json!({"jsonrpc": "2.0", "id": reg.upstream_id, "result": 5});
        let resolution = correlator.resolve(reply);
        assert!(matches!(resolution, Resolution::Matched { .. }));

        let value = correlator.wait_until(reg, deadline(100)).await.unwrap();
        assert_eq!(value, json!({"jsonrpc": "2.0", "id": 1, "result": 5}));
    }

    #[tokio::test]
    async fn test_zero_id_is_matchable() {
        let correlator = Correlator::new();
        let reg = correlator
            .register(&session("a"), JsonRpcId::Number(0), "ping", request(json!(0), "ping"))
            .unwrap();
        correlator.resolve(json!({"jsonrpc": "2.0", "id": reg.upstream_id, "result": {}}));
        let value = correlator.wait_until(reg, deadline(100)).await.unwrap();
        assert_eq!(value["id"], json!(0));
    }

    #[tokio::test]
    async fn test_out_of_order_replies() {
        let correlator = Correlator::new();
        let s = session("a");
        let first = correlator
            .register(&s, JsonRpcId::Number(1), "slow", request(json!(1), "slow"))
            .unwrap();
        let second = correlator
            .register(&s, JsonRpcId::String("b".into()), "fast", request(json!("b"), "fast"))
            .unwrap();

        correlator.resolve(json!({"jsonrpc": "2.0", "id": second.upstream_id, "result": "fast"}));
        correlator.resolve(json!({"jsonrpc": "2.0", "id": first.upstream_id, "result": "slow"}));

        let b = correlator.wait_until(second, deadline(100)).await.unwrap();
        let a = correlator.wait_until(first, deadline(100)).await.unwrap();
        assert_eq!(b, json!({"jsonrpc": "2.0", "id": "b", "result": "fast"}));
        assert_eq!(a, json!({"jsonrpc": "2.0", "id": 1, "result": "slow"}));
    }

    #[tokio::test]
    async fn test_duplicate_reply_resolves_once() {
        let correlator = Correlator::new();
        let reg = correlator
            .register(&session("a"), JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap();
        let reply = json!({"jsonrpc": "2.0", "id": reg.upstream_id, "result": 5});
        assert!(matches!(
            correlator.resolve(reply.clone()),
            Resolution::Matched { .. }
        ));
        assert!(matches!(
            correlator.resolve(reply),
            Resolution::Unmatched { .. }
        ));
    }

    #[tokio::test]
    async fn test_duplicate_pending_id_is_rejected() {
        let correlator = Correlator::new();
        let s = session("a");
        let _first = correlator
            .register(&s, JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap();
        let err = correlator
            .register(&s, JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap_err();
        assert!(matches!(err, BridgeError::DuplicateRequestId { .. }));
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_same_id_on_two_sessions_does_not_collide() {
        let correlator = Correlator::new();
        let a = correlator
            .register(&session("a"), JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap();
        let b = correlator
            .register(&session("b"), JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap();
        assert_ne!(a.upstream_id, b.upstream_id);

        match correlator.resolve(json!({"jsonrpc": "2.0", "id": b.upstream_id, "result": "for-b"})) {
            Resolution::Matched { session, .. } => assert_eq!(session, SessionId::from("b")),
            other => panic!("expected match, got {other:?}"),
        }
        assert_eq!(correlator.pending_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_removes_entry_and_late_reply_is_unmatched() {
        let correlator = Correlator::new();
        let reg = correlator
            .register(&session("a"), JsonRpcId::Number(1), "sleep", request(json!(1), "sleep"))
            .unwrap();
        let upstream_id = reg.upstream_id;

        let err = correlator.wait_until(reg, deadline(10_000)).await.unwrap_err();
        assert!(matches!(err, BridgeError::UpstreamTimeout { ref method, .. } if method == "sleep"));
        assert_eq!(correlator.pending_count(), 0);

        let late = correlator.resolve(json!({"jsonrpc": "2.0", "id": upstream_id, "result": 1}));
        assert!(matches!(late, Resolution::Unmatched { .. }));
    }

    #[tokio::test]
    async fn test_reply_without_integer_id_is_unmatched() {
        let correlator = Correlator::new();
        let resolution = correlator.resolve(json!({"jsonrpc": "2.0", "id": "x", "result": 1}));
        assert_eq!(resolution, Resolution::Unmatched { id: Some(json!("x")) });
    }

    #[tokio::test]
    async fn test_fail_all() {
        let correlator = Correlator::new();
        let reg = correlator
            .register(&session("a"), JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap();
        let failed = correlator.fail_all(&BridgeError::BackendRestarted {
            backend: "calc".into(),
        });
        assert_eq!(failed, 1);
        let err = correlator.wait_until(reg, deadline(100)).await.unwrap_err();
        assert!(matches!(err, BridgeError::BackendRestarted { .. }));
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_fail_only_spares_later_registrations() {
        let correlator = Correlator::new();
        let before = correlator
            .register(&session("a"), JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap();
        let snapshot = correlator.pending_ids();
        let after = correlator
            .register(&session("a"), JsonRpcId::Number(2), "add", request(json!(2), "add"))
            .unwrap();

        let failed = correlator.fail_only(
            &snapshot,
            &BridgeError::BackendRestarted {
                backend: "calc".into(),
            },
        );
        assert_eq!(failed, 1);
        let err = correlator.wait_until(before, deadline(100)).await.unwrap_err();
        assert!(matches!(err, BridgeError::BackendRestarted { .. }));

        assert!(correlator.is_pending(after.upstream_id));
        correlator.resolve(json!({"jsonrpc": "2.0", "id": after.upstream_id, "result": 5}));
        let value = correlator.wait_until(after, deadline(100)).await.unwrap();
        assert_eq!(value["id"], json!(2));
    }

    #[tokio::test]
    async fn test_cancel_frees_client_id() {
        let correlator = Correlator::new();
        let s = session("a");
        let reg = correlator
            .register(&s, JsonRpcId::Number(1), "add", request(json!(1), "add"))
            .unwrap();
        correlator.cancel(reg.upstream_id);
        assert!(
            correlator
                .register(&s, JsonRpcId::Number(1), "add", request(json!(1), "add"))
                .is_ok()
        );
    }
}
