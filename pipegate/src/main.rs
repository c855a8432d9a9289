//! pipegate entry point.

use std::process::ExitCode;

use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

use pipegate::cli::{Cli, LogFormat};
use pipegate::server;

// ─────────────────────────────────────────────────────────────────────────────
// Entry Point
// ─────────────────────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    // Held for the lifetime of the program so buffered logs are flushed.
    let _guard = init_tracing(cli.log_format, cli.verbose);

    let config = match cli.into_config() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration");
            eprintln!("pipegate: {e}");
            return ExitCode::from(2);
        }
    };

    let running = match server::start(config).await {
        Ok(running) => running,
        Err(e) => {
            tracing::error!(error = %e, "failed to start");
            eprintln!("pipegate: {e}");
            return ExitCode::FAILURE;
        }
    };

    let shutdown = CancellationToken::new();
    setup_signal_handlers(shutdown.clone());
    shutdown.cancelled().await;

    match running.shutdown().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "server error");
            ExitCode::FAILURE
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tracing Init
// ─────────────────────────────────────────────────────────────────────────────

/// Initialise the tracing subscriber on a non-blocking stderr writer.
///
/// stdout is left alone. `RUST_LOG` applies unless `verbose` forces `debug`.
fn init_tracing(format: LogFormat, verbose: bool) -> WorkerGuard {
    let (writer, guard) = tracing_appender::non_blocking(std::io::stderr());
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    guard
}

// ─────────────────────────────────────────────────────────────────────────────
// Signals
// ─────────────────────────────────────────────────────────────────────────────

/// Cancel `shutdown` on SIGINT or SIGTERM.
fn setup_signal_handlers(shutdown: CancellationToken) {
    let shutdown_sigint = shutdown.clone();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                tracing::info!("received SIGINT, shutting down");
                shutdown_sigint.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGINT"),
        }
    });

    #[cfg(unix)]
    tokio::spawn(async move {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
                tracing::info!("received SIGTERM, shutting down");
                shutdown.cancel();
            }
            Err(e) => tracing::error!(error = %e, "failed to listen for SIGTERM"),
        }
    });

    #[cfg(not(unix))]
    let _ = shutdown;
}
