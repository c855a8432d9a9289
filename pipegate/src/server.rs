//! Server lifecycle: metrics registry, bridge, listener and graceful
//! shutdown.

use prometheus_client::registry::Registry;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use pipegate_core::telemetry::BridgeMetrics;
use pipegate_core::{Bridge, BridgeConfig};

use crate::error::StartupError;
use crate::front_door::{AppState, router};

/// A bound, serving front door.
pub struct RunningServer {
    addr: SocketAddr,
    bridge: Arc<Bridge>,
    shutdown: CancellationToken,
    task: JoinHandle<std::io::Result<()>>,
}

/// Start the backend, bind the listener and begin serving.
///
/// Port `0` binds an ephemeral port; [`RunningServer::local_addr`] reports
/// the one chosen.
///
/// # Errors
///
/// - `Bridge` if the backend cannot be spawned
/// - `Bind` if the listener cannot be bound
pub async fn start(config: BridgeConfig) -> Result<RunningServer, StartupError> {
    let mut prom_registry = Registry::default();
    let metrics = Arc::new(BridgeMetrics::new(&mut prom_registry));

    let bind = config.server.bind_string();
    let api_key = config.server.api_key.clone();
    let bridge = Bridge::start(config, Some(metrics))?;

    let listener = match TcpListener::bind(&bind).await {
        Ok(listener) => listener,
        Err(source) => {
            bridge.shutdown().await;
            return Err(StartupError::Bind { addr: bind, source });
        }
    };
    let addr = listener.local_addr()?;

    let state = AppState::new(Arc::clone(&bridge), api_key, Arc::new(prom_registry));
    let app = router(state).layer(TraceLayer::new_for_http());

    let shutdown = CancellationToken::new();
    let serve_shutdown = shutdown.clone();
    let task = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                serve_shutdown.cancelled().await;
                tracing::info!("front door shutting down");
            })
            .await
    });

    tracing::info!(
        %addr,
        backend = %bridge.config().backend.name,
        auth = bridge.config().server.api_key.is_some(),
        "pipegate listening"
    );

    Ok(RunningServer {
        addr,
        bridge,
        shutdown,
        task,
    })
}

impl RunningServer {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn bridge(&self) -> &Arc<Bridge> {
        &self.bridge
    }

    /// `http://<addr><path>`
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop accepting connections, end every push stream and stop the
    /// backend.
    ///
    /// # Errors
    ///
    /// Any I/O error the listener reported while serving.
    pub async fn shutdown(self) -> Result<(), StartupError> {
        self.shutdown.cancel();
        // Open SSE responses only finish once their sinks are closed.
        self.bridge.shutdown().await;

        match self.task.await {
            Ok(result) => result.map_err(StartupError::from),
            Err(e) => {
                tracing::warn!(error = %e, "front door task failed");
                Ok(())
            }
        }
    }
}
