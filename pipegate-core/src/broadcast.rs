//! Delivery to push streams and the keepalive loop.
//!
//! The [`Broadcaster`] decides *who* receives a backend message; the
//! [`SessionRegistry`] decides *how* (sink or orphan queue). Unrouted traffic
//! (backend notifications, backend-initiated requests and, in
//! `single_stream` mode, every reply) only reaches sessions that opted in.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::RoutingMode;
use crate::dedup::DedupKey;
use crate::error::BridgeError;
use crate::session::{Frame, KeepaliveReport, PushOutcome, SessionId, SessionRegistry};
use crate::telemetry::BridgeMetrics;

/// What one keepalive tick did.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub keepalive: KeepaliveReport,
    pub reaped: Vec<SessionId>,
}

pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
    routing: RoutingMode,
    metrics: Option<Arc<BridgeMetrics>>,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<SessionRegistry>,
        routing: RoutingMode,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Self {
        Self {
            registry,
            routing,
            metrics,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Deliver `message` to one session, once.
    pub fn deliver(&self, session: &SessionId, message: Value) -> PushOutcome {
        let key = DedupKey::for_message(&message);
        self.deliver_keyed(session, message, key)
    }

    fn deliver_keyed(
        &self,
        session: &SessionId,
        message: Value,
        key: Option<DedupKey>,
    ) -> PushOutcome {
        let id = message.get("id").cloned();
        let outcome = self.registry.push(session, Frame::Message(message), key);

        match outcome {
            PushOutcome::Duplicate => {
                let err = BridgeError::DuplicateDelivery {
                    id: id.map(|v| v.to_string()).unwrap_or_default(),
                };
                tracing::debug!(session_id = %session, error = %err, "suppressed duplicate delivery");
                if let Some(metrics) = &self.metrics {
                    metrics.record_duplicate();
                }
            }
            PushOutcome::UnknownSession => {
                tracing::debug!(session_id = %session, "session expired; message dropped");
            }
            PushOutcome::Queued => {
                tracing::trace!(session_id = %session, "message queued");
            }
            PushOutcome::Delivered => {}
        }
        outcome
    }

    /// Deliver a message with no destination session to every interested
    /// session. Returns how many sessions accepted it.
    pub fn deliver_unrouted(&self, message: Value) -> usize {
        let key = DedupKey::for_message(&message);
        self.deliver_unrouted_keyed(message, key)
    }

    fn deliver_unrouted_keyed(&self, message: Value, key: Option<DedupKey>) -> usize {
        let targets = self.registry.interested_sessions();
        if targets.is_empty() {
            tracing::debug!(
                method = message.get("method").and_then(serde_json::Value::as_str),
                "no interested session; unrouted message dropped"
            );
            return 0;
        }

        targets
            .iter()
            .filter(|session| {
                matches!(
                    self.deliver_keyed(session, message.clone(), key),
                    PushOutcome::Delivered | PushOutcome::Queued
                )
            })
            .count()
    }

    /// Deliver a reply (or error frame) for a request submitted on `session`
    /// and forwarded as `upstream_id`.
    pub fn deliver_reply(&self, session: &SessionId, upstream_id: i64, message: Value) {
        let key = Some(DedupKey::for_reply(upstream_id, &message));
        match self.routing {
            RoutingMode::PerSession => {
                self.deliver_keyed(session, message, key);
            }
            RoutingMode::SingleStream => {
                self.deliver_unrouted_keyed(message, key);
            }
        }
    }

    /// Ping every sink, reap expired orphans and refresh the session gauges.
    pub fn keepalive_tick(&self, now: Instant) -> TickReport {
        let keepalive = self.registry.ping_sinks();
        let reaped = self.registry.reap_orphans(now);

        for session in &keepalive.detached {
            tracing::info!(session_id = %session, "push stream detached by keepalive");
        }
        for session in &reaped {
            tracing::info!(session_id = %session, "orphaned session expired");
        }

        if let Some(metrics) = &self.metrics {
            metrics.record_keepalive_detached(keepalive.detached.len());
            metrics.set_sessions(self.registry.session_count(), self.registry.attached_count());
        }

        TickReport { keepalive, reaped }
    }

    /// Run [`keepalive_tick`](Self::keepalive_tick) every `interval` until
    /// `cancel` fires.
    pub async fn run_keepalive(self: Arc<Self>, interval: Duration, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.keepalive_tick(Instant::now());
                    tracing::trace!(
                        pinged = report.keepalive.pinged,
                        failed = report.keepalive.failed,
                        reaped = report.reaped.len(),
                        "keepalive tick"
                    );
                }
            }
        }
        tracing::debug!("keepalive loop stopped");
    }
}
