//! pipegate core: transport-agnostic bridging between a stdio JSON-RPC
//! backend and any number of push-stream client sessions.
//!
//! The crate is organised leaf-first:
//!
//! - [`transport`]: owns the child process and its NDJSON framing
//! - [`correlator`]: matches backend replies to pending requests by id
//! - [`session`]: issues session tokens and owns each session's sink
//! - [`broadcast`]: delivery, orphan queueing and keepalive
//! - [`dedup`]: suppresses re-delivery of already forwarded replies
//! - [`bridge`]: the coordinator wiring the above together
//!
//! The HTTP front door lives in the `pipegate` crate.

pub mod bridge;
pub mod broadcast;
pub mod config;
pub mod correlator;
pub mod dedup;
pub mod error;
pub mod jsonrpc;
pub mod session;
pub mod telemetry;
pub mod transport;

pub use bridge::{Bridge, HealthSnapshot, StreamHandle, SubmitOutcome};
pub use config::BridgeConfig;
pub use error::{BridgeError, FramingError};
pub use session::SessionId;
