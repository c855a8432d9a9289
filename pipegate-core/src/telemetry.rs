//! Prometheus metrics using the prometheus-client crate.
//!
//! [`BridgeMetrics`] registers everything on a caller-owned `Registry`; the
//! front door encodes that registry on `GET /metrics`.

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;

// ─────────────────────────────────────────────────────────────────────────────
// Label Sets
// ─────────────────────────────────────────────────────────────────────────────

/// Direction of a forwarded JSON-RPC message.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct DirectionLabels {
    /// "client_to_backend" or "backend_to_client"
    pub direction: String,
    /// "request", "response" or "notification"
    pub kind: String,
}

/// Labels for error counters.
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    /// Error classification (e.g., "upstream_timeout", "malformed_json")
    pub error_type: String,
}

/// Request latency buckets in seconds.
const REQUEST_DURATION_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

// ─────────────────────────────────────────────────────────────────────────────
// BridgeMetrics
// ─────────────────────────────────────────────────────────────────────────────

/// Prometheus metrics for the bridge. All names use the `pipegate_` prefix.
pub struct BridgeMetrics {
    /// JSON-RPC messages moved across the bridge.
    pub messages_total: Family<DirectionLabels, Counter>,
    /// Bridge errors surfaced to callers, by taxonomy entry.
    pub errors_total: Family<ErrorLabels, Counter>,
    /// Backend stdout lines discarded by framing.
    pub framing_errors_total: Family<ErrorLabels, Counter>,
    /// Replies suppressed by the dedup filter.
    pub duplicates_suppressed_total: Counter,
    /// Backend replies with no pending request.
    pub unmatched_replies_total: Counter,
    /// Backend respawns after unexpected exits.
    pub backend_restarts_total: Counter,
    /// Sinks detached by the keepalive loop.
    pub keepalive_detached_total: Counter,

    /// Time from registration to matched reply.
    pub request_duration_seconds: Histogram,

    /// Sessions currently known (attached or orphaned).
    pub sessions: Gauge,
    /// Sessions with an attached sink.
    pub sessions_attached: Gauge,
    /// Requests awaiting a backend reply.
    pub pending_requests: Gauge,
    /// 1 when the backend finished its handshake, 0 otherwise.
    pub backend_up: Gauge,
}

impl BridgeMetrics {
    /// Create and register all metrics with the given registry.
    pub fn new(registry: &mut Registry) -> Self {
        let messages_total = Family::<DirectionLabels, Counter>::default();
        registry.register(
            "pipegate_messages",
            "JSON-RPC messages forwarded by the bridge",
            messages_total.clone(),
        );

        let errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "pipegate_errors",
            "Bridge errors by type",
            errors_total.clone(),
        );

        let framing_errors_total = Family::<ErrorLabels, Counter>::default();
        registry.register(
            "pipegate_framing_errors",
            "Backend output lines discarded by framing",
            framing_errors_total.clone(),
        );

        let duplicates_suppressed_total = Counter::default();
        registry.register(
            "pipegate_duplicates_suppressed",
            "Replies suppressed as already delivered",
            duplicates_suppressed_total.clone(),
        );

        let unmatched_replies_total = Counter::default();
        registry.register(
            "pipegate_unmatched_replies",
            "Backend replies with no pending request",
            unmatched_replies_total.clone(),
        );

        let backend_restarts_total = Counter::default();
        registry.register(
            "pipegate_backend_restarts",
            "Backend respawns after unexpected exit",
            backend_restarts_total.clone(),
        );

        let keepalive_detached_total = Counter::default();
        registry.register(
            "pipegate_keepalive_detached",
            "Sinks detached after failed keepalive writes",
            keepalive_detached_total.clone(),
        );

        let request_duration_seconds = Histogram::new(REQUEST_DURATION_BUCKETS.iter().copied());
        registry.register(
            "pipegate_request_duration_seconds",
            "Time from request registration to matched reply",
            request_duration_seconds.clone(),
        );

        let sessions = Gauge::default();
        registry.register("pipegate_sessions", "Known sessions", sessions.clone());

        let sessions_attached = Gauge::default();
        registry.register(
            "pipegate_sessions_attached",
            "Sessions with an attached push stream",
            sessions_attached.clone(),
        );

        let pending_requests = Gauge::default();
        registry.register(
            "pipegate_pending_requests",
            "Requests awaiting a backend reply",
            pending_requests.clone(),
        );

        let backend_up = Gauge::default();
        registry.register(
            "pipegate_backend_up",
            "Whether the backend is running and initialized",
            backend_up.clone(),
        );

        Self {
            messages_total,
            errors_total,
            framing_errors_total,
            duplicates_suppressed_total,
            unmatched_replies_total,
            backend_restarts_total,
            keepalive_detached_total,
            request_duration_seconds,
            sessions,
            sessions_attached,
            pending_requests,
            backend_up,
        }
    }

    pub fn record_message(&self, direction: &str, kind: &str) {
        self.messages_total
            .get_or_create(&DirectionLabels {
                direction: direction.to_string(),
                kind: kind.to_string(),
            })
            .inc();
    }

    pub fn record_error(&self, error_type: &str) {
        self.errors_total
            .get_or_create(&ErrorLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }

    pub fn record_framing_error(&self, error_type: &str) {
        self.framing_errors_total
            .get_or_create(&ErrorLabels {
                error_type: error_type.to_string(),
            })
            .inc();
    }

    pub fn record_duplicate(&self) {
        self.duplicates_suppressed_total.inc();
    }

    pub fn record_unmatched(&self) {
        self.unmatched_replies_total.inc();
    }

    pub fn record_backend_restart(&self) {
        self.backend_restarts_total.inc();
    }

    pub fn record_keepalive_detached(&self, count: usize) {
        self.keepalive_detached_total.inc_by(count as u64);
    }

    pub fn observe_request_duration(&self, seconds: f64) {
        self.request_duration_seconds.observe(seconds);
    }

    pub fn set_sessions(&self, known: usize, attached: usize) {
        self.sessions.set(known as i64);
        self.sessions_attached.set(attached as i64);
    }

    pub fn set_pending(&self, pending: usize) {
        self.pending_requests.set(pending as i64);
    }

    pub fn set_backend_up(&self, up: bool) {
        self.backend_up.set(i64::from(up));
    }
}
