//! Command-line interface.
//!
//! Flags and environment variables override the YAML file, which overrides
//! built-in defaults. The result is validated once and handed to the core.

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Parser, ValueEnum};
use pipegate_core::config::duration_format::parse_duration;
use pipegate_core::config::{
    BridgeConfig, ConfigError, ExitPolicy, RoutingMode, defaults, load_config,
};

// ─────────────────────────────────────────────────────────────────────────────
// Arguments
// ─────────────────────────────────────────────────────────────────────────────

/// Serve a stdio JSON-RPC server over an authenticated SSE endpoint.
///
/// Example: `pipegate --port 8080 -- npx some-mcp-server --flag`
#[derive(Parser, Debug, Clone)]
#[command(name = "pipegate", author, version, about)]
pub struct Cli {
    /// YAML configuration file.
    #[arg(long, env = "PIPEGATE_CONFIG")]
    pub config: Option<PathBuf>,

    /// Listen port.
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Bind address.
    #[arg(short, long, env = "PIPEGATE_BIND")]
    pub bind: Option<String>,

    /// Bearer token required on /sse, /messages and /route.
    #[arg(long, env = "MCP_API_KEY", hide_env_values = true)]
    pub api_key: Option<String>,

    /// Backend name reported by /health (defaults to the command's file name).
    #[arg(long)]
    pub name: Option<String>,

    /// Skip the `initialize` handshake with the backend.
    #[arg(long)]
    pub no_handshake: bool,

    /// Allow more than one request in flight at the backend.
    #[arg(long)]
    pub pipelining: bool,

    /// Enable `POST /route`.
    #[arg(long)]
    pub switchable: bool,

    /// What happens to pending requests when the backend exits.
    #[arg(long, value_enum)]
    pub on_exit: Option<CliExitPolicy>,

    /// Where replies are delivered.
    #[arg(long, value_enum)]
    pub routing: Option<CliRoutingMode>,

    /// Per-request reply deadline (e.g. "10s", "500ms").
    #[arg(long, value_parser = parse_duration)]
    pub request_timeout: Option<Duration>,

    /// Interval between keepalive comments on push streams.
    #[arg(long, value_parser = parse_duration)]
    pub keepalive_interval: Option<Duration>,

    /// Log output format.
    #[arg(long, value_enum, default_value = "text")]
    pub log_format: LogFormat,

    /// Enable debug logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Backend command and arguments (after `--`).
    #[arg(trailing_var_arg = true)]
    pub command: Vec<String>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Value Enums (clap-compatible)
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    Text,
    Json,
}

/// Maps 1:1 to [`ExitPolicy`].
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CliExitPolicy {
    /// Fail pending requests immediately.
    FailFast,
    /// Let pending requests time out against the respawned backend.
    Preserve,
}

/// Maps 1:1 to [`RoutingMode`].
#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum CliRoutingMode {
    /// Replies go to the submitting session.
    PerSession,
    /// Replies go to every session opened with `notifications=true`.
    SingleStream,
}

impl From<CliExitPolicy> for ExitPolicy {
    fn from(p: CliExitPolicy) -> Self {
        match p {
            CliExitPolicy::FailFast => Self::FailFast,
            CliExitPolicy::Preserve => Self::Preserve,
        }
    }
}

impl From<CliRoutingMode> for RoutingMode {
    fn from(m: CliRoutingMode) -> Self {
        match m {
            CliRoutingMode::PerSession => Self::PerSession,
            CliRoutingMode::SingleStream => Self::SingleStream,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Conversion
// ─────────────────────────────────────────────────────────────────────────────

impl Cli {
    /// Build and validate the effective configuration.
    ///
    /// # Errors
    ///
    /// Any [`ConfigError`] from loading the file or from validation.
    pub fn into_config(self) -> Result<BridgeConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => load_config(path)?,
            None => BridgeConfig::default(),
        };

        if let Some(port) = self.port {
            config.server.port = port;
        }
        if let Some(bind) = self.bind {
            config.server.bind_addr = bind;
        }
        if let Some(key) = self.api_key.filter(|k| !k.is_empty()) {
            config.server.api_key = Some(key);
        }

        let backend = &mut config.backend;
        let mut command = self.command.into_iter();
        if let Some(program) = command.next() {
            if backend.name == defaults::BACKEND_NAME {
                backend.name = command_name(&program);
            }
            backend.command = program;
            backend.args = command.collect();
        }
        if let Some(name) = self.name {
            backend.name = name;
        }
        if self.no_handshake {
            backend.handshake = false;
        }
        if self.pipelining {
            backend.pipelining = true;
        }
        if self.switchable {
            backend.switchable = true;
        }
        if let Some(policy) = self.on_exit {
            backend.on_exit = policy.into();
        }
        if let Some(timeout) = self.request_timeout {
            backend.request_timeout = timeout;
        }

        if let Some(routing) = self.routing {
            config.sessions.routing = routing.into();
        }
        if let Some(interval) = self.keepalive_interval {
            config.sessions.keepalive_interval = interval;
        }

        config.validate()?;
        Ok(config)
    }
}

fn command_name(program: &str) -> String {
    Path::new(program)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(program)
        .to_string()
}
