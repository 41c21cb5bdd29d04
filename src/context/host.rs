//! Host services behind the scoped façades.
//!
//! Façades check capabilities, then delegate to a `HostApi`. Swapping the
//! host (an embedding application, a test double) never changes what a
//! plugin is allowed to do.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tracing::debug;

/// Capacity of the local event bus before slow subscribers start lagging.
const EVENT_BUS_CAPACITY: usize = 256;

/// HTTP read timeout in seconds.
const READ_TIMEOUT_SECS: u64 = 30;

/// HTTP connect timeout in seconds.
const CONNECT_TIMEOUT_SECS: u64 = 10;

const USER_AGENT: &str = concat!("plugin-sandbox/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequest {
    #[serde(default = "default_method")]
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: Vec<(String, String)>,
    #[serde(default)]
    pub body: Option<String>,
}

fn default_method() -> String {
    "GET".to_string()
}

impl HttpRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: default_method(),
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: String,
}

/// An event published on the host bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HostEvent {
    pub topic: String,
    pub payload: Value,
    /// Plugin that emitted the event.
    pub source: String,
}

#[async_trait]
pub trait HostApi: Send + Sync {
    async fn query(&self, sql: &str, params: &[Value]) -> anyhow::Result<Value>;

    async fn http_request(&self, request: HttpRequest) -> anyhow::Result<HttpResponse>;

    async fn read_file(&self, path: &Path) -> anyhow::Result<String>;

    async fn write_file(&self, path: &Path, contents: &str) -> anyhow::Result<()>;

    async fn emit(&self, event: HostEvent) -> anyhow::Result<()>;

    /// Receives every event published after the call.
    fn subscribe(&self) -> broadcast::Receiver<HostEvent>;

    fn env(&self, name: &str) -> Option<String>;
}

/// In-process host: real files, real HTTP, an in-memory event bus and
/// the process environment. It has no database.
pub struct LocalHost {
    client: reqwest::Client,
    events: broadcast::Sender<HostEvent>,
}

impl LocalHost {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(READ_TIMEOUT_SECS))
            .connect_timeout(Duration::from_secs(CONNECT_TIMEOUT_SECS))
            .user_agent(USER_AGENT)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let (events, _) = broadcast::channel(EVENT_BUS_CAPACITY);
        Self { client, events }
    }
}

impl Default for LocalHost {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HostApi for LocalHost {
    async fn query(&self, _sql: &str, _params: &[Value]) -> anyhow::Result<Value> {
        anyhow::bail!("no database backend configured")
    }

    async fn http_request(&self, request: HttpRequest) -> anyhow::Result<HttpResponse> {
        let method = reqwest::Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())?;
        let mut builder = self.client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body {
            builder = builder.body(body);
        }

        let response = builder.send().await?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| Some((name.to_string(), value.to_str().ok()?.to_string())))
            .collect();
        let body = response.text().await?;
        debug!("HTTP {} {} -> {status}", request.method, request.url);
        Ok(HttpResponse { status, headers, body })
    }

    async fn read_file(&self, path: &Path) -> anyhow::Result<String> {
        Ok(tokio::fs::read_to_string(path).await?)
    }

    async fn write_file(&self, path: &Path, contents: &str) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, contents).await?;
        Ok(())
    }

    async fn emit(&self, event: HostEvent) -> anyhow::Result<()> {
        // No subscribers is not an error.
        let delivered = self.events.send(event).unwrap_or(0);
        debug!("Event delivered to {delivered} subscriber(s)");
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<HostEvent> {
        self.events.subscribe()
    }

    fn env(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_host_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("out.txt");
        let host = LocalHost::new();

        host.write_file(&path, "hello").await.unwrap();
        assert_eq!(host.read_file(&path).await.unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_local_host_has_no_database() {
        let err = LocalHost::new().query("SELECT 1", &[]).await.unwrap_err();
        assert!(err.to_string().contains("no database backend"));
    }

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscribers() {
        let host = LocalHost::new();
        // Emitting with nobody listening is fine.
        host.emit(HostEvent {
            topic: "orders.created".into(),
            payload: json!(1),
            source: "p1".into(),
        })
        .await
        .unwrap();

        let mut rx = host.subscribe();
        host.emit(HostEvent {
            topic: "orders.created".into(),
            payload: json!({ "id": 7 }),
            source: "p1".into(),
        })
        .await
        .unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.payload["id"], 7);
        assert_eq!(event.source, "p1");
    }

    #[test]
    fn test_http_request_defaults() {
        let req: HttpRequest = serde_json::from_value(json!({ "url": "http://localhost/x" })).unwrap();
        assert_eq!(req, HttpRequest::get("http://localhost/x"));
    }
}
