//! Child process supervision and stdio plumbing.
//!
//! A supervisor task owns the `Child`. On every (re)spawn it installs the new
//! stdin handle, starts a stdout reader for that generation and writes the
//! `initialize` handshake. Client writes wait until the handshake reply has
//! been seen. When the process exits without being asked to, the supervisor
//! publishes [`BackendEvent::Exited`], sleeps `respawn_backoff` and spawns a
//! new process. Spawn failures during respawn are retried after the same
//! backoff.

use serde_json::{Value, json};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::lifecycle::{self, ProcessState, ShutdownGrace, exit_state};
use super::ndjson::{BackendMessage, LineBuffer, parse_backend_line};
use super::{BackendEvent, BackendLauncher, BackendLink, BackendStatus};
use crate::config::{BackendConfig, BackendSpec};
use crate::error::BridgeError;
use crate::jsonrpc::{JsonRpcId, JsonRpcMessageKind};
use crate::telemetry::BridgeMetrics;

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Read size for the stdout pipe.
const READ_CHUNK_BYTES: usize = 8 * 1024;

/// How long an exit waits for the stdout reader to publish buffered replies.
const READER_DRAIN_MS: u64 = 500;

/// Tunables for one transport.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    pub handshake: bool,
    pub protocol_version: String,
    pub respawn_backoff: Duration,
    /// Bound on how long `send` waits for the handshake to finish.
    pub ready_timeout: Duration,
    pub max_message_bytes: usize,
    pub grace: ShutdownGrace,
}

impl TransportOptions {
    pub fn from_config(config: &BackendConfig) -> Self {
        Self {
            handshake: config.handshake,
            protocol_version: config.protocol_version.clone(),
            respawn_backoff: config.respawn_backoff,
            ready_timeout: config.request_timeout,
            max_message_bytes: config.max_message_bytes,
            grace: ShutdownGrace {
                stdin_close_grace: config.stdin_close_grace,
                sigterm_grace: config.sigterm_grace,
            },
        }
    }
}

/// Id of the handshake request for a process generation.
///
/// Replies carrying it are consumed by the transport and never published.
pub fn handshake_id(generation: u64) -> String {
    format!("pipegate-init-{generation}")
}

fn initialize_request(generation: u64, protocol_version: &str) -> String {
    json!({
        "jsonrpc": "2.0",
        "id": handshake_id(generation),
        "method": "initialize",
        "params": {
            "protocolVersion": protocol_version,
            "capabilities": {},
            "clientInfo": {
                "name": "pipegate",
                "version": env!("CARGO_PKG_VERSION"),
            },
        },
    })
    .to_string()
}

fn spawn_child(spec: &BackendSpec) -> Result<Child, BridgeError> {
    let mut cmd = Command::new(&spec.command);
    cmd.args(&spec.args)
        .envs(&spec.env)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::inherit())
        .kill_on_drop(true);

    // Own process group so SIGTERM reaches the backend's children too.
    #[cfg(unix)]
    cmd.process_group(0);

    cmd.spawn().map_err(|e| BridgeError::SpawnError {
        backend: spec.name.clone(),
        reason: e.to_string(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Shared state
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct ProcessInfo {
    state: ProcessState,
    pid: Option<u32>,
    generation: u64,
    restarts: u64,
}

struct Shared {
    spec: BackendSpec,
    options: TransportOptions,
    instance: u64,
    events: mpsc::Sender<BackendEvent>,
    metrics: Option<Arc<BridgeMetrics>>,
    stdin: tokio::sync::Mutex<Option<ChildStdin>>,
    info: parking_lot::Mutex<ProcessInfo>,
    /// True once the current generation finished its handshake.
    ready: watch::Sender<bool>,
}

impl Shared {
    fn write_error(&self, reason: impl Into<String>) -> BridgeError {
        BridgeError::WriteError {
            backend: self.spec.name.clone(),
            reason: reason.into(),
        }
    }

    fn set_state(&self, state: ProcessState) {
        let mut info = self.info.lock();
        if !state.is_alive() {
            info.pid = None;
        }
        info.state = state;
    }

    async fn emit(&self, event: BackendEvent) {
        if self.events.send(event).await.is_err() {
            tracing::debug!(backend = %self.spec.name, "event receiver dropped");
        }
    }

    async fn write_line(&self, line: &[u8]) -> Result<(), BridgeError> {
        let mut guard = self.stdin.lock().await;
        let stdin = guard
            .as_mut()
            .ok_or_else(|| self.write_error("stdin is closed"))?;

        let result: std::io::Result<()> = async {
            stdin.write_all(line).await?;
            stdin.write_all(b"\n").await?;
            stdin.flush().await
        }
        .await;

        result.map_err(|e| self.write_error(e.to_string()))
    }

    async fn close_stdin(&self) {
        self.stdin.lock().await.take();
    }

    /// Install a freshly spawned child as the current generation.
    async fn begin_generation(self: &Arc<Self>, child: &mut Child) -> (u64, JoinHandle<()>) {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();

        let generation = {
            let mut info = self.info.lock();
            info.generation += 1;
            info.pid = child.id();
            info.state = if self.options.handshake {
                ProcessState::Handshaking
            } else {
                ProcessState::Running
            };
            info.generation
        };
        *self.stdin.lock().await = stdin;

        let reader = match stdout {
            Some(stdout) => tokio::spawn(read_stdout(Arc::clone(self), stdout, generation)),
            None => {
                tracing::error!(backend = %self.spec.name, generation, "backend stdout was not captured");
                tokio::spawn(async {})
            }
        };

        if self.options.handshake {
            let request = initialize_request(generation, &self.options.protocol_version);
            if let Err(e) = self.write_line(request.as_bytes()).await {
                tracing::warn!(backend = %self.spec.name, generation, error = %e, "failed to send initialize");
            }
        } else {
            self.mark_ready(generation).await;
        }

        (generation, reader)
    }

    async fn mark_ready(&self, generation: u64) {
        let current = {
            let mut info = self.info.lock();
            let current = info.generation == generation && info.state.is_alive();
            if current {
                info.state = ProcessState::Running;
            }
            current
        };
        if !current {
            return;
        }
        self.ready.send_replace(true);
        self.emit(BackendEvent::Ready {
            instance: self.instance,
            generation,
        })
        .await;
    }

    async fn complete_handshake(&self, generation: u64, reply: &Value) {
        let backend = self.spec.name.as_str();
        match reply.get("error") {
            Some(error) => {
                tracing::warn!(backend, generation, %error, "backend rejected initialize; forwarding traffic anyway");
            }
            None => {
                let server = reply
                    .pointer("/result/serverInfo/name")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown");
                tracing::info!(backend, generation, server, "backend initialized");
            }
        }

        let initialized = json!({"jsonrpc": "2.0", "method": "notifications/initialized"});
        if let Err(e) = self.write_line(initialized.to_string().as_bytes()).await {
            tracing::warn!(backend, generation, error = %e, "failed to send notifications/initialized");
        }
        self.mark_ready(generation).await;
    }

    async fn handle_message(&self, generation: u64, message: BackendMessage) {
        if let JsonRpcMessageKind::Response {
            id: JsonRpcId::String(id),
        } = &message.kind
        {
            if *id == handshake_id(generation) {
                self.complete_handshake(generation, &message.value).await;
                return;
            }
        }

        self.emit(BackendEvent::Message {
            instance: self.instance,
            kind: message.kind,
            value: message.value,
        })
        .await;
    }

    /// Sleep the backoff and spawn again until it works or we are cancelled.
    async fn respawn(&self, cancel: &CancellationToken) -> Option<Child> {
        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return None,
                _ = tokio::time::sleep(self.options.respawn_backoff) => {}
            }

            match spawn_child(&self.spec) {
                Ok(child) => {
                    let restarts = {
                        let mut info = self.info.lock();
                        info.restarts += 1;
                        info.restarts
                    };
                    if let Some(m) = &self.metrics {
                        m.record_backend_restart();
                    }
                    tracing::info!(backend = %self.spec.name, pid = ?child.id(), restarts, "backend respawned");
                    return Some(child);
                }
                Err(e) => {
                    tracing::error!(backend = %self.spec.name, error = %e, "respawn failed; retrying after backoff");
                    self.set_state(ProcessState::FailedToStart {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tasks
// ─────────────────────────────────────────────────────────────────────────────

async fn supervise(shared: Arc<Shared>, mut child: Child, cancel: CancellationToken) {
    loop {
        let (generation, reader) = shared.begin_generation(&mut child).await;

        let exited = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            status = child.wait() => Some(status),
        };

        let Some(status) = exited else {
            shared.ready.send_replace(false);
            shared.close_stdin().await;
            lifecycle::stop_child(&shared.spec.name, &mut child, shared.options.grace).await;
            shared.set_state(ProcessState::Stopped);
            let _ = tokio::time::timeout(Duration::from_millis(READER_DRAIN_MS), reader).await;
            return;
        };

        let state = match status {
            Ok(status) => exit_state(status),
            Err(e) => {
                tracing::error!(backend = %shared.spec.name, error = %e, "wait on backend failed");
                ProcessState::Exited { code: -1 }
            }
        };
        shared.ready.send_replace(false);
        shared.close_stdin().await;
        shared.set_state(state.clone());

        // Replies written just before the exit still reach the bridge.
        let _ = tokio::time::timeout(Duration::from_millis(READER_DRAIN_MS), reader).await;

        tracing::warn!(
            backend = %shared.spec.name,
            generation,
            state = ?state,
            backoff_ms = shared.options.respawn_backoff.as_millis() as u64,
            "backend exited unexpectedly; respawning"
        );
        shared
            .emit(BackendEvent::Exited {
                instance: shared.instance,
                generation,
                state,
            })
            .await;

        child = match shared.respawn(&cancel).await {
            Some(child) => child,
            None => {
                shared.set_state(ProcessState::Stopped);
                return;
            }
        };
    }
}

async fn read_stdout(shared: Arc<Shared>, mut stdout: ChildStdout, generation: u64) {
    let backend = shared.spec.name.as_str();
    let mut buffer = LineBuffer::new(shared.options.max_message_bytes);
    let mut chunk = vec![0u8; READ_CHUNK_BYTES];

    loop {
        let n = match stdout.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) => {
                tracing::warn!(backend, generation, error = %e, "backend stdout read failed");
                break;
            }
        };

        for line in buffer.push(&chunk[..n]) {
            match line.and_then(|l| parse_backend_line(&l)) {
                Ok(message) => shared.handle_message(generation, message).await,
                Err(e) => {
                    if let Some(m) = &shared.metrics {
                        m.record_framing_error(e.error_type_name());
                    }
                    let err = BridgeError::from(e);
                    tracing::warn!(
                        backend,
                        generation,
                        error_type = err.error_type_name(),
                        error = %err,
                        "discarding line from backend"
                    );
                }
            }
        }
    }

    if buffer.pending() > 0 {
        tracing::debug!(backend, generation, bytes = buffer.pending(), "discarding incomplete trailing line at EOF");
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SubprocessTransport
// ─────────────────────────────────────────────────────────────────────────────

/// A supervised backend process.
pub struct SubprocessTransport {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    supervisor: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl SubprocessTransport {
    /// Spawn the backend and start supervising it.
    ///
    /// Must be called from within a tokio runtime.
    ///
    /// # Errors
    ///
    /// `SpawnError` if the first spawn fails. Later failures are retried.
    pub fn start(
        spec: BackendSpec,
        options: TransportOptions,
        events: mpsc::Sender<BackendEvent>,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Result<Self, BridgeError> {
        let child = spawn_child(&spec)?;
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        tracing::info!(
            backend = %spec.name,
            command = %spec.command,
            pid = ?child.id(),
            instance,
            "backend started"
        );

        let (ready, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            spec,
            options,
            instance,
            events,
            metrics,
            stdin: tokio::sync::Mutex::new(None),
            info: parking_lot::Mutex::new(ProcessInfo {
                state: ProcessState::Handshaking,
                pid: child.id(),
                generation: 0,
                restarts: 0,
            }),
            ready,
        });

        let cancel = CancellationToken::new();
        let supervisor = tokio::spawn(supervise(Arc::clone(&shared), child, cancel.clone()));

        Ok(Self {
            shared,
            cancel,
            supervisor: tokio::sync::Mutex::new(Some(supervisor)),
        })
    }
}

#[async_trait::async_trait]
impl BackendLink for SubprocessTransport {
    async fn send(&self, line: &[u8]) -> Result<(), BridgeError> {
        if !self.shared.info.lock().state.is_alive() {
            return Err(self.shared.write_error("backend is not running"));
        }

        let mut ready = self.shared.ready.subscribe();
        let waited = tokio::time::timeout(self.shared.options.ready_timeout, ready.wait_for(|r| *r))
            .await
            .map(|r| r.map(|_| ()));
        match waited {
            Ok(Ok(())) => {}
            Ok(Err(_)) => return Err(self.shared.write_error("transport closed")),
            Err(_) => {
                return Err(self
                    .shared
                    .write_error("backend did not finish the initialize handshake"));
            }
        }

        self.shared.write_line(line).await
    }

    fn status(&self) -> BackendStatus {
        let info = self.shared.info.lock();
        BackendStatus {
            name: self.shared.spec.name.clone(),
            alive: info.state.is_alive(),
            pid: info.pid,
            generation: info.generation,
            restarts: info.restarts,
            state: info.state.clone(),
            instance: self.shared.instance,
        }
    }

    async fn shutdown(&self) {
        self.cancel.cancel();
        let handle = self.supervisor.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(backend = %self.shared.spec.name, error = %e, "backend supervisor task failed");
            }
        }
    }
}

impl Drop for SubprocessTransport {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Launches [`SubprocessTransport`]s.
pub struct SubprocessLauncher {
    options: TransportOptions,
    metrics: Option<Arc<BridgeMetrics>>,
}

impl SubprocessLauncher {
    pub fn new(options: TransportOptions, metrics: Option<Arc<BridgeMetrics>>) -> Self {
        Self { options, metrics }
    }
}

impl BackendLauncher for SubprocessLauncher {
    fn launch(
        &self,
        spec: &BackendSpec,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Arc<dyn BackendLink>, BridgeError> {
        let transport = SubprocessTransport::start(
            spec.clone(),
            self.options.clone(),
            events,
            self.metrics.clone(),
        )?;
        Ok(Arc::new(transport))
    }
}
