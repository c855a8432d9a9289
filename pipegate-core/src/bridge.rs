//! The coordinator.
//!
//! [`Bridge`] owns one instance of every component and the backend event
//! loop. Client traffic enters through [`Bridge::submit`] and
//! [`Bridge::open_stream`]; backend traffic arrives as [`BackendEvent`]s
//! and flows through correlator → dedup → broadcaster.
//!
//! # Request path
//!
//! ```text
//! submit ─► register (upstream id) ─► spawn forward task
//!                                       ├─ acquire in-flight permit
//!                                       ├─ backend.send
//!                                       └─ wait for reply or deadline
//!                                            └─► deliver_reply (reply or error frame)
//! ```

use arc_swap::ArcSwap;
use futures_util::Stream;
use serde::Serialize;
use serde_json::Value;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::broadcast::Broadcaster;
use crate::config::schema::validate_spec;
use crate::config::{BackendSpec, BridgeConfig, ExitPolicy};
use crate::correlator::{Correlator, Registration, Resolution};
use crate::error::BridgeError;
use crate::jsonrpc::{JsonRpcId, JsonRpcMessageKind, classify_jsonrpc, error_response};
use crate::session::{Frame, RegistryOptions, SessionId, SessionRegistry};
use crate::telemetry::BridgeMetrics;
use crate::transport::{
    BackendEvent, BackendLauncher, BackendLink, BackendStatus, SubprocessLauncher,
    TransportOptions,
};

/// Capacity of the backend → bridge event channel.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

const CLIENT_TO_BACKEND: &str = "client_to_backend";
const BACKEND_TO_CLIENT: &str = "backend_to_client";

fn kind_label(kind: &JsonRpcMessageKind) -> &'static str {
    match kind {
        JsonRpcMessageKind::Request { .. } => "request",
        JsonRpcMessageKind::Response { .. } => "response",
        JsonRpcMessageKind::Notification { .. } => "notification",
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Public types
// ─────────────────────────────────────────────────────────────────────────────

/// Result of an accepted submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    /// A request was registered; its reply or error arrives on the stream.
    Forwarded { upstream_id: i64 },
    /// A notification or client response was written; no frame will follow.
    Sent,
}

/// Body of `GET /health`, minus front-door fields.
#[derive(Debug, Clone, Serialize)]
pub struct HealthSnapshot {
    pub status: &'static str,
    pub service: String,
    pub sessions: usize,
    pub attached: usize,
    pub pending: usize,
    pub backend: BackendStatus,
}

/// The receiving half of a session's push stream.
///
/// Dropping it detaches the sink; the session then stays orphaned for the
/// grace period.
pub struct StreamHandle {
    session: SessionId,
    receiver: mpsc::Receiver<Frame>,
    _guard: DetachGuard,
}

impl StreamHandle {
    pub fn session(&self) -> &SessionId {
        &self.session
    }

    pub async fn recv(&mut self) -> Option<Frame> {
        self.receiver.recv().await
    }
}

impl Stream for StreamHandle {
    type Item = Frame;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Frame>> {
        self.receiver.poll_recv(cx)
    }
}

struct DetachGuard {
    registry: Arc<SessionRegistry>,
    session: SessionId,
    generation: u64,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        if self.registry.detach_sink(&self.session, self.generation) {
            tracing::debug!(session_id = %self.session, "push stream closed; session orphaned");
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge
// ─────────────────────────────────────────────────────────────────────────────

pub struct Bridge {
    config: BridgeConfig,
    registry: Arc<SessionRegistry>,
    correlator: Correlator,
    broadcaster: Arc<Broadcaster>,
    backend: ArcSwap<Arc<dyn BackendLink>>,
    launcher: Arc<dyn BackendLauncher>,
    events_tx: mpsc::Sender<BackendEvent>,
    /// One permit unless pipelining is enabled.
    in_flight: Option<Arc<Semaphore>>,
    metrics: Option<Arc<BridgeMetrics>>,
    cancel: CancellationToken,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
    reroute_lock: tokio::sync::Mutex<()>,
}

impl Bridge {
    /// Start the configured backend subprocess and the bridge loops.
    ///
    /// # Errors
    ///
    /// `SpawnError` if the backend cannot be started.
    pub fn start(
        config: BridgeConfig,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Result<Arc<Self>, BridgeError> {
        let launcher = SubprocessLauncher::new(
            TransportOptions::from_config(&config.backend),
            metrics.clone(),
        );
        Self::start_with(config, Arc::new(launcher), metrics)
    }

    /// Like [`start`](Self::start) with a custom launcher.
    pub fn start_with(
        config: BridgeConfig,
        launcher: Arc<dyn BackendLauncher>,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Result<Arc<Self>, BridgeError> {
        let (events_tx, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let backend = launcher.launch(&config.backend.spec(), events_tx.clone())?;

        let registry = Arc::new(SessionRegistry::new(RegistryOptions::from_config(
            &config.sessions,
        )));
        let broadcaster = Arc::new(Broadcaster::new(
            Arc::clone(&registry),
            config.sessions.routing,
            metrics.clone(),
        ));
        let in_flight = (!config.backend.pipelining).then(|| Arc::new(Semaphore::new(1)));
        let cancel = CancellationToken::new();

        tracing::info!(
            backend = %config.backend.name,
            pipelining = config.backend.pipelining,
            switchable = config.backend.switchable,
            routing = ?config.sessions.routing,
            "bridge started"
        );

        let keepalive_interval = config.sessions.keepalive_interval;
        let bridge = Arc::new(Self {
            config,
            registry,
            correlator: Correlator::new(),
            broadcaster: Arc::clone(&broadcaster),
            backend: ArcSwap::from_pointee(backend),
            launcher,
            events_tx,
            in_flight,
            metrics,
            cancel: cancel.clone(),
            tasks: parking_lot::Mutex::new(Vec::new()),
            reroute_lock: tokio::sync::Mutex::new(()),
        });

        let event_loop = tokio::spawn(run_event_loop(
            Arc::downgrade(&bridge),
            events_rx,
            cancel.clone(),
        ));
        let keepalive = tokio::spawn(broadcaster.run_keepalive(keepalive_interval, cancel));
        bridge.tasks.lock().extend([event_loop, keepalive]);

        Ok(bridge)
    }

    pub fn config(&self) -> &BridgeConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    fn current_backend(&self) -> Arc<dyn BackendLink> {
        Arc::clone(&*self.backend.load_full())
    }

    // ── client side ─────────────────────────────────────────────────────────

    /// Accept one JSON-RPC message submitted on `session`.
    ///
    /// # Errors
    ///
    /// - `UnknownSession` if the session does not exist
    /// - `InvalidRequest` if `message` is not a single JSON-RPC 2.0 object
    /// - `DuplicateRequestId` if the session already has this id pending
    ///
    /// Notifications and responses are written on a spawned task; the call
    /// returns [`SubmitOutcome::Sent`] without waiting for the backend.
    pub async fn submit(
        self: &Arc<Self>,
        session: &SessionId,
        message: Value,
    ) -> Result<SubmitOutcome, BridgeError> {
        self.registry.route_submission(session)?;
        let kind = classify_jsonrpc(&message).map_err(|e| BridgeError::InvalidRequest {
            reason: e.to_string(),
        })?;
        self.record_message(CLIENT_TO_BACKEND, &kind);

        match kind {
            JsonRpcMessageKind::Request { id, method } => {
                let registration = self.correlator.register(session, id, &method, message)?;
                let upstream_id = registration.upstream_id;
                self.update_pending_gauge();

                let bridge = Arc::clone(self);
                tokio::spawn(async move { bridge.forward_request(registration).await });
                Ok(SubmitOutcome::Forwarded { upstream_id })
            }
            JsonRpcMessageKind::Notification { .. } | JsonRpcMessageKind::Response { .. } => {
                let line = message.to_string().into_bytes();
                let bridge = Arc::clone(self);
                let session = session.clone();
                tokio::spawn(async move { bridge.forward_one_way(session, line).await });
                Ok(SubmitOutcome::Sent)
            }
        }
    }

    /// Write a notification or client response. Nothing is owed to the
    /// client, so a failed write is only logged.
    async fn forward_one_way(self: Arc<Self>, session: SessionId, line: Vec<u8>) {
        if let Err(err) = self.current_backend().send(&line).await {
            tracing::warn!(session_id = %session, error = %err, "one-way message not written");
            if let Some(metrics) = &self.metrics {
                metrics.record_error(err.error_type_name());
            }
        }
    }

    async fn forward_request(self: Arc<Self>, registration: Registration) {
        let upstream_id = registration.upstream_id;
        let session = registration.session.clone();
        let client_id = registration.client_id.clone();
        let method = registration.method.clone();
        let timeout = self.config.backend.request_timeout;
        let deadline = Instant::now() + timeout;

        let _permit = match &self.in_flight {
            Some(semaphore) => {
                match tokio::time::timeout_at(deadline, Arc::clone(semaphore).acquire_owned()).await
                {
                    Ok(Ok(permit)) => Some(permit),
                    Ok(Err(_)) => {
                        self.correlator.cancel(upstream_id);
                        self.update_pending_gauge();
                        return;
                    }
                    Err(_) => {
                        self.correlator.cancel(upstream_id);
                        self.update_pending_gauge();
                        let err = BridgeError::UpstreamTimeout {
                            method,
                            timeout_ms: timeout.as_millis() as u64,
                        };
                        self.fail_request(&session, upstream_id, &client_id, &err);
                        return;
                    }
                }
            }
            None => None,
        };

        // Already failed (backend exit while queued for the permit).
        let result = if !self.correlator.is_pending(upstream_id) {
            self.correlator.wait_until(registration, deadline).await
        } else {
            let backend = self.current_backend();
            match backend.send(&registration.line).await {
                Ok(()) => self.correlator.wait_until(registration, deadline).await,
                Err(e) => {
                    self.correlator.cancel(upstream_id);
                    Err(e)
                }
            }
        };
        self.update_pending_gauge();

        match result {
            Ok(reply) => {
                tracing::debug!(session_id = %session, %client_id, upstream_id, "delivering reply");
                self.broadcaster.deliver_reply(&session, upstream_id, reply);
            }
            Err(err) => self.fail_request(&session, upstream_id, &client_id, &err),
        }
    }

    /// Push a JSON-RPC error object for `client_id` to `session`.
    fn fail_request(
        &self,
        session: &SessionId,
        upstream_id: i64,
        client_id: &JsonRpcId,
        err: &BridgeError,
    ) {
        let correlation_id = Uuid::new_v4().to_string();
        tracing::warn!(
            session_id = %session,
            %client_id,
            correlation_id = %correlation_id,
            error = %err,
            "request failed"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_error(err.error_type_name());
        }
        let frame = error_response(client_id, &err.to_jsonrpc_error(&correlation_id));
        self.broadcaster.deliver_reply(session, upstream_id, frame);
    }

    /// Open a new session, or resume `resume`, and attach a fresh sink.
    ///
    /// # Errors
    ///
    /// `UnknownSession` if `resume` names a session that does not exist.
    pub fn open_stream(
        &self,
        resume: Option<&SessionId>,
        interested: bool,
    ) -> Result<StreamHandle, BridgeError> {
        let session = match resume {
            Some(id) => {
                self.registry.route_submission(id)?;
                id.clone()
            }
            None => self.registry.open_session(interested),
        };

        let (tx, receiver) = mpsc::channel(self.config.sessions.sink_capacity);
        let attach = self.registry.attach_sink(&session, tx)?;
        tracing::info!(
            session_id = %session,
            resumed = attach.resumed,
            superseded = attach.superseded,
            flushed = attach.flushed,
            "push stream attached"
        );
        self.update_session_gauges();

        Ok(StreamHandle {
            session: session.clone(),
            receiver,
            _guard: DetachGuard {
                registry: Arc::clone(&self.registry),
                session,
                generation: attach.generation,
            },
        })
    }

    // ── backend side ────────────────────────────────────────────────────────

    fn handle_event(&self, event: BackendEvent) {
        // Instances are allocated in increasing order; anything older than
        // the current backend comes from a replaced one.
        let current = self.backend.load().status();
        if event.instance() < current.instance {
            tracing::debug!(instance = event.instance(), "ignoring event from replaced backend");
            return;
        }

        match event {
            BackendEvent::Message { kind, value, .. } => self.handle_backend_message(kind, value),
            BackendEvent::Ready { generation, .. } => {
                tracing::info!(backend = %current.name, generation, "backend ready");
                if let Some(metrics) = &self.metrics {
                    metrics.set_backend_up(true);
                }
            }
            BackendEvent::Exited {
                generation, state, ..
            } => {
                if let Some(metrics) = &self.metrics {
                    metrics.set_backend_up(false);
                }
                match self.config.backend.on_exit {
                    ExitPolicy::FailFast => {
                        let failed = self.correlator.fail_all(&BridgeError::BackendRestarted {
                            backend: current.name.clone(),
                        });
                        tracing::warn!(
                            backend = %current.name,
                            generation,
                            state = ?state,
                            failed,
                            "backend exited; pending requests failed"
                        );
                    }
                    ExitPolicy::Preserve => {
                        tracing::warn!(
                            backend = %current.name,
                            generation,
                            state = ?state,
                            pending = self.correlator.pending_count(),
                            "backend exited; pending requests kept"
                        );
                    }
                }
                self.update_pending_gauge();
            }
        }
    }

    fn handle_backend_message(&self, kind: JsonRpcMessageKind, value: Value) {
        self.record_message(BACKEND_TO_CLIENT, &kind);
        match kind {
            JsonRpcMessageKind::Response { .. } => match self.correlator.resolve(value) {
                Resolution::Matched {
                    session,
                    client_id,
                    method,
                    latency,
                } => {
                    tracing::debug!(
                        session_id = %session,
                        %client_id,
                        method,
                        latency_ms = latency.as_millis() as u64,
                        "reply matched"
                    );
                    if let Some(metrics) = &self.metrics {
                        metrics.observe_request_duration(latency.as_secs_f64());
                    }
                }
                Resolution::Unmatched { id } => {
                    tracing::warn!(id = ?id, "dropping backend reply with no pending request");
                    if let Some(metrics) = &self.metrics {
                        metrics.record_unmatched();
                    }
                }
            },
            JsonRpcMessageKind::Request { .. } | JsonRpcMessageKind::Notification { .. } => {
                let delivered = self.broadcaster.deliver_unrouted(value);
                tracing::debug!(delivered, "unrouted backend message");
            }
        }
    }

    // ── operations ──────────────────────────────────────────────────────────

    /// Replace the backend with one started from `spec`.
    ///
    /// The new backend is started before the old one is stopped, so a failed
    /// launch leaves the current backend in place. Requests pending at the
    /// swap are failed with `BackendRestarted`; later ones are kept.
    ///
    /// # Errors
    ///
    /// - `RouteDisabled` unless `backend.switchable` is set
    /// - `InvalidRequest` if `spec` is incomplete
    /// - `SpawnError` if the new backend cannot be started
    pub async fn reroute(&self, spec: BackendSpec) -> Result<BackendStatus, BridgeError> {
        if !self.config.backend.switchable {
            return Err(BridgeError::RouteDisabled);
        }
        validate_spec(&spec).map_err(|e| BridgeError::InvalidRequest {
            reason: e.to_string(),
        })?;

        let _guard = self.reroute_lock.lock().await;
        let replacement = self.launcher.launch(&spec, self.events_tx.clone())?;
        // Requests registered after this point may already be on the new backend.
        let stranded = self.correlator.pending_ids();
        let previous = self.backend.swap(Arc::new(replacement));
        let previous_name = previous.status().name;

        let failed = self.correlator.fail_only(
            &stranded,
            &BridgeError::BackendRestarted {
                backend: previous_name.clone(),
            },
        );
        self.update_pending_gauge();
        tracing::info!(
            from = %previous_name,
            to = %spec.name,
            command = %spec.command,
            failed,
            "backend rerouted"
        );

        previous.shutdown().await;
        Ok(self.current_backend().status())
    }

    pub fn health(&self) -> HealthSnapshot {
        let backend = self.current_backend().status();
        HealthSnapshot {
            status: if backend.alive { "healthy" } else { "degraded" },
            service: backend.name.clone(),
            sessions: self.registry.session_count(),
            attached: self.registry.attached_count(),
            pending: self.correlator.pending_count(),
            backend,
        }
    }

    /// Stop the loops, end every push stream, fail pending requests and
    /// stop the backend.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        if let Some(semaphore) = &self.in_flight {
            semaphore.close();
        }

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "bridge task failed");
            }
        }

        let closed = self.registry.close_all();
        tracing::debug!(closed, "push streams closed");

        let backend = self.current_backend();
        let failed = self.correlator.fail_all(&BridgeError::BackendRestarted {
            backend: backend.status().name,
        });
        if failed > 0 {
            tracing::info!(failed, "pending requests failed at shutdown");
        }
        backend.shutdown().await;
        tracing::info!("bridge stopped");
    }

    // ── metrics ─────────────────────────────────────────────────────────────

    fn record_message(&self, direction: &str, kind: &JsonRpcMessageKind) {
        if let Some(metrics) = &self.metrics {
            metrics.record_message(direction, kind_label(kind));
        }
    }

    fn update_pending_gauge(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_pending(self.correlator.pending_count());
        }
    }

    fn update_session_gauges(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.set_sessions(self.registry.session_count(), self.registry.attached_count());
        }
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn run_event_loop(
    bridge: Weak<Bridge>,
    mut events: mpsc::Receiver<BackendEvent>,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            biased;
            _ = cancel.cancelled() => break,
            event = events.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };
        let Some(bridge) = bridge.upgrade() else {
            break;
        };
        bridge.handle_event(event);
    }
    tracing::debug!("backend event loop stopped");
}
