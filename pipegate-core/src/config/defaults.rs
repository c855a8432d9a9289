//! Default values shared by the configuration schema and the CLI.

use std::time::Duration;

/// Backend name used when none is configured.
pub const BACKEND_NAME: &str = "backend";

/// Default HTTP listen port (`PORT`).
pub const PORT: u16 = 3000;

/// Default bind address.
pub const BIND_ADDR: &str = "0.0.0.0";

/// Correlated wait before a request fails with `UpstreamTimeout`.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Delay between an unexpected backend exit and the respawn attempt.
pub const RESPAWN_BACKOFF: Duration = Duration::from_secs(1);

/// Interval between keepalive comment frames.
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(20);

/// How long a session without a sink is retained.
pub const ORPHAN_GRACE: Duration = Duration::from_secs(30);

/// Consecutive keepalive failures before a sink is detached.
pub const MAX_KEEPALIVE_FAILURES: u32 = 3;

/// Per-session queue bound while orphaned.
pub const MAX_QUEUED_MESSAGES: usize = 256;

/// Bounded channel capacity between the bridge and one SSE connection.
pub const SINK_CAPACITY: usize = 64;

/// Dedup filter capacity per session.
pub const DEDUP_CAPACITY: usize = 1024;

/// Maximum size of one NDJSON line from the backend (10 MiB).
pub const MAX_MESSAGE_BYTES: usize = 10 * 1024 * 1024;

/// Wait after closing stdin before SIGTERM.
pub const STDIN_CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Wait after SIGTERM before SIGKILL.
pub const SIGTERM_GRACE: Duration = Duration::from_secs(2);

/// MCP protocol version offered in the `initialize` handshake.
pub const PROTOCOL_VERSION: &str = "2024-11-05";
