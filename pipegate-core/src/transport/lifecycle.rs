//! Backend process state and the graceful stop sequence.

use serde::Serialize;
use std::process::ExitStatus;
use std::time::Duration;

/// Lifecycle state of the backend process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum ProcessState {
    /// Spawned; `initialize` sent, reply not yet seen.
    Handshaking,
    /// Accepting client traffic.
    Running,
    /// Exited with an exit code.
    Exited { code: i32 },
    /// Killed by a signal (Unix only).
    Signalled { signal: i32 },
    /// Last respawn attempt failed.
    FailedToStart { reason: String },
    /// Stopped on request.
    Stopped,
}

impl ProcessState {
    /// Whether the process can accept writes.
    pub fn is_alive(&self) -> bool {
        matches!(self, Self::Handshaking | Self::Running)
    }
}

/// Map an `ExitStatus` to a terminal state.
pub fn exit_state(status: ExitStatus) -> ProcessState {
    if let Some(code) = status.code() {
        return ProcessState::Exited { code };
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return ProcessState::Signalled { signal };
        }
    }
    ProcessState::Exited { code: -1 }
}

/// Grace periods for the stop escalation.
///
/// 1. Close the backend's stdin
/// 2. Wait `stdin_close_grace` for a clean exit
/// 3. Send SIGTERM to the process group
/// 4. Wait `sigterm_grace`
/// 5. Send SIGKILL
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShutdownGrace {
    pub stdin_close_grace: Duration,
    pub sigterm_grace: Duration,
}

/// Stop a backend whose stdin has already been closed.
///
/// Always reaps the child so no zombie is left behind.
pub async fn stop_child(backend: &str, child: &mut tokio::process::Child, grace: ShutdownGrace) {
    match tokio::time::timeout(grace.stdin_close_grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(backend, state = ?exit_state(status), "backend exited after stdin close");
            return;
        }
        Ok(Err(e)) => tracing::error!(backend, error = %e, "wait failed after stdin close"),
        Err(_) => tracing::info!(backend, "backend did not exit within stdin_close_grace"),
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;
        if let Some(pid) = child.id() {
            tracing::info!(backend, pid, "sending SIGTERM to process group");
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                tracing::warn!(backend, pid, error = ?e, "killpg SIGTERM failed");
            }
        }
    }

    match tokio::time::timeout(grace.sigterm_grace, child.wait()).await {
        Ok(Ok(status)) => {
            tracing::info!(backend, state = ?exit_state(status), "backend exited after SIGTERM");
            return;
        }
        Ok(Err(e)) => tracing::error!(backend, error = %e, "wait failed after SIGTERM"),
        Err(_) => tracing::warn!(backend, "backend did not exit within sigterm_grace"),
    }

    tracing::warn!(backend, "sending SIGKILL");
    if let Err(e) = child.kill().await {
        tracing::error!(backend, error = %e, "SIGKILL failed");
    }
}
