//! Backend transport.
//!
//! [`SubprocessTransport`] owns the child process: the only writer to its
//! stdin and the only reader of its stdout. Everything it reads is published
//! as [`BackendEvent`]s on a channel that the bridge drains.
//!
//! The bridge talks to the transport through [`BackendLink`] and creates it
//! through [`BackendLauncher`], so tests can swap in scripted backends.

pub mod lifecycle;
pub mod ndjson;
pub mod subprocess;

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::config::BackendSpec;
use crate::error::BridgeError;
use crate::jsonrpc::JsonRpcMessageKind;

pub use lifecycle::{ProcessState, ShutdownGrace};
pub use subprocess::{SubprocessLauncher, SubprocessTransport, TransportOptions};

/// Something the backend did.
///
/// `instance` identifies the transport that produced the event so that
/// stragglers from a replaced backend can be ignored.
#[derive(Debug, Clone)]
pub enum BackendEvent {
    /// A well-formed JSON-RPC message read from stdout.
    Message {
        instance: u64,
        kind: JsonRpcMessageKind,
        value: Value,
    },
    /// The `initialize` handshake completed (or was skipped).
    Ready { instance: u64, generation: u64 },
    /// The process exited without being asked to.
    Exited {
        instance: u64,
        generation: u64,
        state: ProcessState,
    },
}

impl BackendEvent {
    pub fn instance(&self) -> u64 {
        match self {
            Self::Message { instance, .. }
            | Self::Ready { instance, .. }
            | Self::Exited { instance, .. } => *instance,
        }
    }
}

/// Point-in-time view of the backend, reported by `/health`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendStatus {
    pub name: String,
    pub alive: bool,
    pub pid: Option<u32>,
    /// Process generation; increments on every (re)spawn.
    pub generation: u64,
    pub restarts: u64,
    #[serde(flatten)]
    pub state: ProcessState,
    #[serde(skip)]
    pub instance: u64,
}

/// Write side of a running backend.
#[async_trait::async_trait]
pub trait BackendLink: Send + Sync {
    /// Write one serialized JSON value followed by a newline.
    ///
    /// Returning `Ok` means the bytes reached the pipe, not that the backend
    /// processed them.
    async fn send(&self, line: &[u8]) -> Result<(), BridgeError>;

    /// Current status.
    fn status(&self) -> BackendStatus;

    /// Stop the backend and wait for it to be reaped. Idempotent.
    async fn shutdown(&self);
}

/// Creates backends.
pub trait BackendLauncher: Send + Sync {
    /// Start a backend that publishes its events on `events`.
    ///
    /// # Errors
    ///
    /// `SpawnError` if the process could not be started at all.
    fn launch(
        &self,
        spec: &BackendSpec,
        events: mpsc::Sender<BackendEvent>,
    ) -> Result<Arc<dyn BackendLink>, BridgeError>;
}
