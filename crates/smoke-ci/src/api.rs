//! Backend HTTP surface used by the smoke pipeline.
//!
//! [`BackendApi`] is the seam between the orchestrator and the transport:
//! [`HttpBackend`] talks to a live server, `MockBackend` answers from
//! in-memory fixtures.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, StatusCode};
use serde_json::{json, Value};
use tracing::debug;

use crate::error::{Result, SmokeError};
use crate::sse;
use crate::supervisor::HealthProbe;

/// Conventional JSON API of the analysis backend.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Issue a JSON request against `path` (relative to the API root).
    ///
    /// A non-success status fails with `SmokeError::Http`, preferring the
    /// body's `error` field as the message.
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value>;

    /// Run the streaming analysis and return its `complete` payload.
    async fn analyze(&self, body: Value) -> Result<Value>;

    async fn get(&self, path: &str) -> Result<Value> {
        self.request(Method::GET, path, None).await
    }

    async fn post(&self, path: &str, body: Value) -> Result<Value> {
        self.request(Method::POST, path, Some(body)).await
    }
}

/// Failure message for an unsuccessful response.
pub(crate) fn failure_message(status: StatusCode, body: &Value) -> String {
    body.get("error")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()))
}

const DEFAULT_HEALTH_TIMEOUT: Duration = Duration::from_secs(2);

/// reqwest-backed client for `http://localhost:<port>/api`.
#[derive(Debug, Clone)]
pub struct HttpBackend {
    base_url: String,
    client: reqwest::Client,
    health_timeout: Duration,
}

impl HttpBackend {
    /// Client for a backend listening on `port` on localhost.
    pub fn new(port: u16) -> Result<Self> {
        Self::with_base_url(format!("http://localhost:{}/api", port))
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("smoke-ci/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(5))
            .build()?;

        Ok(Self {
            base_url: base_url.into(),
            client,
            health_timeout: DEFAULT_HEALTH_TIMEOUT,
        })
    }

    /// Bound each health request; a server that never answers is unhealthy.
    pub fn with_health_timeout(mut self, timeout: Duration) -> Self {
        self.health_timeout = timeout;
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn transport_error(path: &str, err: reqwest::Error) -> SmokeError {
        SmokeError::Http {
            path: path.to_string(),
            message: err.to_string(),
        }
    }
}

#[async_trait]
impl BackendApi for HttpBackend {
    async fn request(&self, method: Method, path: &str, body: Option<Value>) -> Result<Value> {
        debug!(%method, path, "Backend request");

        let mut req = self.client.request(method, self.url(path));
        if let Some(body) = &body {
            req = req.json(body);
        }
        let response = req
            .send()
            .await
            .map_err(|e| Self::transport_error(path, e))?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| Self::transport_error(path, e))?;
        let data: Value = serde_json::from_str(&text).unwrap_or_else(|_| json!({}));

        if !status.is_success() {
            return Err(SmokeError::Http {
                path: path.to_string(),
                message: failure_message(status, &data),
            });
        }
        Ok(data)
    }

    async fn analyze(&self, body: Value) -> Result<Value> {
        let path = "/analyze";
        let response = self
            .client
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .map_err(|e| Self::transport_error(path, e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let data: Value = serde_json::from_str(&text).unwrap_or_else(|_| json!({}));
            return Err(SmokeError::Http {
                path: path.to_string(),
                message: failure_message(status, &data),
            });
        }

        sse::decode_stream(response.bytes_stream()).await
    }
}

#[async_trait]
impl HealthProbe for HttpBackend {
    async fn is_healthy(&self) -> bool {
        let request = self
            .client
            .get(self.url("/health"))
            .timeout(self.health_timeout);
        match request.send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
