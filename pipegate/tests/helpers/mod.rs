//! Test helpers for pipegate integration tests.
//!
//! - [`TestServer`]: the full front door over the `mock_backend` binary
//! - [`SseClient`]: a minimal `text/event-stream` reader

#![allow(dead_code)]

use pipegate::server::{self, RunningServer};
use pipegate_core::BridgeConfig;
use serde_json::Value;
use std::time::Duration;

/// How long a test waits for an expected event.
pub const EVENT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long a test waits to be sure no event arrives.
pub const SILENCE: Duration = Duration::from_millis(500);

// ─────────────────────────────────────────────────────────────────────────────
// Server
// ─────────────────────────────────────────────────────────────────────────────

pub struct TestServer {
    pub server: RunningServer,
    pub client: reqwest::Client,
}

/// Config pointing at `mock_backend` on an ephemeral loopback port.
pub fn mock_config() -> BridgeConfig {
    let mut config = BridgeConfig::default();
    config.server.bind_addr = "127.0.0.1".to_string();
    config.server.port = 0;
    config.backend.name = "mock".to_string();
    config.backend.command = env!("CARGO_BIN_EXE_mock_backend").to_string();
    config.backend.request_timeout = Duration::from_secs(5);
    config.backend.respawn_backoff = Duration::from_millis(100);
    config.backend.stdin_close_grace = Duration::from_millis(500);
    config.backend.sigterm_grace = Duration::from_millis(500);
    config
}

impl TestServer {
    pub async fn start() -> Self {
        Self::start_with(|_| {}).await
    }

    pub async fn start_with(configure: impl FnOnce(&mut BridgeConfig)) -> Self {
        let mut config = mock_config();
        configure(&mut config);
        let server = server::start(config).await.expect("server starts");
        let server = Self {
            server,
            client: reqwest::Client::new(),
        };
        server.wait_healthy().await;
        server
    }

    pub fn url(&self, path: &str) -> String {
        self.server.url(path)
    }

    /// Poll `/health` until the backend is alive and has finished its
    /// handshake at least once.
    pub async fn wait_healthy(&self) -> Value {
        let deadline = tokio::time::Instant::now() + EVENT_TIMEOUT;
        loop {
            let body = self.health().await;
            if body["backend"]["alive"] == true && body["backend"]["state"] == "running" {
                return body;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "backend never became healthy: {body}"
            );
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }

    pub async fn health(&self) -> Value {
        self.client
            .get(self.url("/health"))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap()
    }

    /// Open `GET /sse` with an optional query string and bearer token.
    pub async fn connect(&self, query: &str, token: Option<&str>) -> reqwest::Response {
        let mut request = self.client.get(self.url(&format!("/sse{query}")));
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }

    /// Open a new session and consume its `endpoint` event.
    pub async fn open_session(&self) -> SseClient {
        self.open_session_with("", None).await
    }

    pub async fn open_session_with(&self, query: &str, token: Option<&str>) -> SseClient {
        let response = self.connect(query, token).await;
        assert_eq!(response.status(), 200);
        let mut sse = SseClient::new(response);
        let endpoint = sse.next_event().await.expect("endpoint event");
        assert_eq!(endpoint.event, "endpoint");
        sse.endpoint = endpoint.data;
        sse
    }

    /// `POST` a message to a session's advertised endpoint.
    pub async fn post(&self, sse: &SseClient, body: &Value) -> reqwest::Response {
        self.post_raw(&sse.endpoint, body.to_string(), None).await
    }

    pub async fn post_raw(&self, path: &str, body: String, token: Option<&str>) -> reqwest::Response {
        let mut request = self
            .client
            .post(self.url(path))
            .header("content-type", "application/json")
            .body(body);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }
        request.send().await.unwrap()
    }

    pub async fn shutdown(self) {
        self.server.shutdown().await.unwrap();
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// SSE reader
// ─────────────────────────────────────────────────────────────────────────────

/// One event from the stream. Comment lines surface as `event == "comment"`.
#[derive(Debug, Clone, PartialEq)]
pub struct SseEvent {
    pub event: String,
    pub data: String,
}

pub struct SseClient {
    response: reqwest::Response,
    buffer: String,
    /// Path from the `endpoint` event.
    pub endpoint: String,
}

impl SseClient {
    pub fn new(response: reqwest::Response) -> Self {
        Self {
            response,
            buffer: String::new(),
            endpoint: String::new(),
        }
    }

    /// The session token carried in the endpoint path.
    pub fn session_id(&self) -> &str {
        self.endpoint
            .split_once("session_id=")
            .map(|(_, id)| id)
            .unwrap_or_default()
    }

    /// Next event of any kind, or `None` when the stream ends or
    /// [`EVENT_TIMEOUT`] passes.
    pub async fn next_event(&mut self) -> Option<SseEvent> {
        self.next_event_within(EVENT_TIMEOUT).await
    }

    pub async fn next_event_within(&mut self, wait: Duration) -> Option<SseEvent> {
        let deadline = tokio::time::Instant::now() + wait;
        loop {
            if let Some(event) = self.take_buffered() {
                return Some(event);
            }
            let chunk = tokio::time::timeout_at(deadline, self.response.chunk())
                .await
                .ok()?
                .ok()??;
            self.buffer.push_str(&String::from_utf8_lossy(&chunk));
        }
    }

    /// Next `message` event parsed as JSON, skipping keepalives.
    pub async fn next_message(&mut self) -> Value {
        loop {
            let event = self.next_event().await.expect("message event");
            if event.event == "message" {
                return serde_json::from_str(&event.data).unwrap();
            }
        }
    }

    /// Assert no `message` event arrives for [`SILENCE`].
    pub async fn assert_no_message(&mut self) {
        let deadline = tokio::time::Instant::now() + SILENCE;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            match self.next_event_within(remaining).await {
                Some(event) if event.event == "message" => {
                    panic!("unexpected message: {}", event.data)
                }
                Some(_) => continue,
                None => return,
            }
        }
    }

    fn take_buffered(&mut self) -> Option<SseEvent> {
        let end = self.buffer.find("\n\n")?;
        let block: String = self.buffer.drain(..end + 2).collect();

        let mut event = SseEvent {
            event: "message".to_string(),
            data: String::new(),
        };
        for line in block.lines() {
            if let Some(comment) = line.strip_prefix(':') {
                event.event = "comment".to_string();
                event.data = comment.trim().to_string();
            } else if let Some(name) = line.strip_prefix("event:") {
                event.event = name.trim().to_string();
            } else if let Some(data) = line.strip_prefix("data:") {
                if !event.data.is_empty() {
                    event.data.push('\n');
                }
                event.data.push_str(data.strip_prefix(' ').unwrap_or(data));
            }
        }
        Some(event)
    }
}
