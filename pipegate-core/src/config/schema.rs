//! Configuration schema.
//!
//! ```yaml
//! server:
//!   port: 3000
//!   api_key: ${MCP_API_KEY}
//! backend:
//!   name: youtube-transcript
//!   command: python
//!   args: ["server.py"]
//!   request_timeout: 10s
//! sessions:
//!   keepalive_interval: 20s
//!   orphan_grace: 30s
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::defaults;
use super::duration_format;
use super::error::ConfigError;

/// Root configuration handed to [`crate::Bridge::start`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub server: ServerConfig,
    pub backend: BackendConfig,
    pub sessions: SessionConfig,
}

/// HTTP listener settings. Consumed by the front door, not by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    pub port: u16,
    /// Bearer token required on `/sse`, `/messages` and `/route`.
    /// `None` disables authentication.
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: defaults::BIND_ADDR.to_string(),
            port: defaults::PORT,
            api_key: None,
        }
    }
}

impl ServerConfig {
    /// `addr:port` string for `TcpListener::bind`.
    pub fn bind_string(&self) -> String {
        format!("{}:{}", self.bind_addr, self.port)
    }
}

/// Identity and launch command of one backend process.
///
/// Also the body of `POST /route`.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BackendSpec {
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// What happens to pending requests when the backend exits unexpectedly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExitPolicy {
    /// Every pending request fails immediately with `BackendRestarted`.
    #[default]
    FailFast,
    /// Pending requests stay registered and time out normally.
    Preserve,
}

/// How replies find their way to sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoutingMode {
    /// Replies go to the session that submitted the request.
    #[default]
    PerSession,
    /// Replies are treated as unrouted and go to every interested session.
    SingleStream,
}

/// Backend process settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,

    /// Send `initialize` after every spawn.
    pub handshake: bool,
    pub protocol_version: String,

    /// Backend answers concurrent requests by id. When false, at most one
    /// request is in flight at a time.
    pub pipelining: bool,

    /// Accept `POST /route`.
    pub switchable: bool,

    pub on_exit: ExitPolicy,

    #[serde(with = "duration_format")]
    pub request_timeout: Duration,
    #[serde(with = "duration_format")]
    pub respawn_backoff: Duration,
    #[serde(with = "duration_format")]
    pub stdin_close_grace: Duration,
    #[serde(with = "duration_format")]
    pub sigterm_grace: Duration,

    pub max_message_bytes: usize,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            name: defaults::BACKEND_NAME.to_string(),
            command: String::new(),
            args: Vec::new(),
            env: BTreeMap::new(),
            handshake: true,
            protocol_version: defaults::PROTOCOL_VERSION.to_string(),
            pipelining: false,
            switchable: false,
            on_exit: ExitPolicy::FailFast,
            request_timeout: defaults::REQUEST_TIMEOUT,
            respawn_backoff: defaults::RESPAWN_BACKOFF,
            stdin_close_grace: defaults::STDIN_CLOSE_GRACE,
            sigterm_grace: defaults::SIGTERM_GRACE,
            max_message_bytes: defaults::MAX_MESSAGE_BYTES,
        }
    }
}

impl BackendConfig {
    /// The launch identity of the configured backend.
    pub fn spec(&self) -> BackendSpec {
        BackendSpec {
            name: self.name.clone(),
            command: self.command.clone(),
            args: self.args.clone(),
            env: self.env.clone(),
        }
    }
}

/// Session, delivery and keepalive settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    #[serde(with = "duration_format")]
    pub keepalive_interval: Duration,
    #[serde(with = "duration_format")]
    pub orphan_grace: Duration,
    pub max_keepalive_failures: u32,
    pub max_queued_messages: usize,
    pub sink_capacity: usize,
    pub dedup_capacity: usize,
    pub routing: RoutingMode,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            keepalive_interval: defaults::KEEPALIVE_INTERVAL,
            orphan_grace: defaults::ORPHAN_GRACE,
            max_keepalive_failures: defaults::MAX_KEEPALIVE_FAILURES,
            max_queued_messages: defaults::MAX_QUEUED_MESSAGES,
            sink_capacity: defaults::SINK_CAPACITY,
            dedup_capacity: defaults::DEDUP_CAPACITY,
            routing: RoutingMode::PerSession,
        }
    }
}

impl BridgeConfig {
    /// Check cross-field invariants.
    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_spec(&self.backend.spec())?;

        let nonzero_durations = [
            ("backend.request_timeout", self.backend.request_timeout),
            ("backend.respawn_backoff", self.backend.respawn_backoff),
            ("sessions.keepalive_interval", self.sessions.keepalive_interval),
            ("sessions.orphan_grace", self.sessions.orphan_grace),
        ];
        for (field, value) in nonzero_durations {
            if value.is_zero() {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        let nonzero_counts = [
            ("backend.max_message_bytes", self.backend.max_message_bytes),
            ("sessions.max_queued_messages", self.sessions.max_queued_messages),
            ("sessions.sink_capacity", self.sessions.sink_capacity),
            ("sessions.dedup_capacity", self.sessions.dedup_capacity),
            (
                "sessions.max_keepalive_failures",
                self.sessions.max_keepalive_failures as usize,
            ),
        ];
        for (field, value) in nonzero_counts {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field,
                    reason: "must be greater than zero".to_string(),
                });
            }
        }

        // A keepalive tick must land inside the grace window or orphans are
        // reaped late by up to one interval.
        if self.sessions.keepalive_interval >= self.sessions.orphan_grace {
            return Err(ConfigError::InvalidValue {
                field: "sessions.keepalive_interval",
                reason: format!(
                    "{:?} must be less than sessions.orphan_grace ({:?})",
                    self.sessions.keepalive_interval, self.sessions.orphan_grace
                ),
            });
        }

        Ok(())
    }
}

/// Validate a backend launch spec (also used for `/route` bodies).
pub fn validate_spec(spec: &BackendSpec) -> Result<(), ConfigError> {
    if spec.command.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "backend.command",
            reason: "must not be empty".to_string(),
        });
    }
    if spec.name.trim().is_empty() {
        return Err(ConfigError::InvalidValue {
            field: "backend.name",
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}
