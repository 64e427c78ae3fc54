//! [`SubscriptionServer`] backed by an external hosted message broker.
//!
//! Serverless deployments cannot hold SSE streams, so clients connect to a
//! broker instead and the server publishes through its REST API:
//! `POST {base_url}/channels/{channel}/messages` with `{"name", "data"}`.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

use super::{SubscriptionServer, TransportError};

/// Connection settings for the external broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Base URL of the broker REST API, without trailing slash.
    pub base_url: String,
    /// Bearer token sent with every publish, if the broker requires one.
    pub api_key: Option<String>,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl BrokerConfig {
    #[must_use]
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
            timeout: Duration::from_secs(10),
        }
    }
}

#[derive(Serialize)]
struct BrokerMessage<'a> {
    name: &'static str,
    data: &'a serde_json::Value,
}

/// Publishes channel messages to a hosted broker over HTTP.
#[derive(Debug, Clone)]
pub struct BrokerSubscriptionServer {
    http: reqwest::Client,
    config: BrokerConfig,
}

impl BrokerSubscriptionServer {
    /// Builds the HTTP client for the broker.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Broker`] if the HTTP client cannot be built.
    pub fn new(config: BrokerConfig) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder().timeout(config.timeout).build()?;
        Ok(Self { http, config })
    }

    fn channel_url(&self, channel: &str) -> String {
        format!("{}/channels/{}/messages", self.config.base_url, channel)
    }
}

#[async_trait]
impl SubscriptionServer for BrokerSubscriptionServer {
    async fn publish_message(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<(), TransportError> {
        let mut request = self.http.post(self.channel_url(channel)).json(&BrokerMessage {
            name: "message",
            data: message,
        });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(TransportError::BrokerStatus(status.as_u16()));
        }
        debug!(channel, "published to broker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use axum::extract::{Path, State};
    use axum::http::{HeaderMap, StatusCode};
    use axum::routing::post;
    use axum::{Json, Router};
    use parking_lot::Mutex;
    use serde_json::json;

    use super::*;

    type Captured = Arc<Mutex<Vec<(String, Option<String>, serde_json::Value)>>>;

    async fn capture(
        State(captured): State<Captured>,
        Path(channel): Path<String>,
        headers: HeaderMap,
        Json(body): Json<serde_json::Value>,
    ) -> StatusCode {
        let auth = headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        captured.lock().push((channel, auth, body));
        StatusCode::CREATED
    }

    async fn spawn_broker(status_ok: bool) -> (String, Captured) {
        let captured: Captured = Arc::default();
        let router = if status_ok {
            Router::new()
                .route("/channels/{channel}/messages", post(capture))
                .with_state(captured.clone())
        } else {
            Router::new().route(
                "/channels/{channel}/messages",
                post(|| async { StatusCode::UNAUTHORIZED }),
            )
        };
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        (format!("http://{addr}"), captured)
    }

    #[tokio::test]
    async fn publishes_with_bearer_token() {
        let (base, captured) = spawn_broker(true).await;
        let mut config = BrokerConfig::new(format!("{base}/"));
        config.api_key = Some("secret".to_string());
        let server = BrokerSubscriptionServer::new(config).unwrap();

        server
            .publish_message("q1", &json!({"type": "remove", "data": {"id": "a"}}))
            .await
            .unwrap();

        let calls = captured.lock();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "q1");
        assert_eq!(calls[0].1.as_deref(), Some("Bearer secret"));
        assert_eq!(calls[0].2["name"], "message");
        assert_eq!(calls[0].2["data"]["type"], "remove");
    }

    #[tokio::test]
    async fn rejected_publish_surfaces_status() {
        let (base, _captured) = spawn_broker(false).await;
        let server = BrokerSubscriptionServer::new(BrokerConfig::new(base)).unwrap();
        let err = server.publish_message("q1", &json!(1)).await.unwrap_err();
        assert!(matches!(err, TransportError::BrokerStatus(401)));
    }

    #[test]
    fn base_url_trailing_slash_trimmed() {
        let config = BrokerConfig::new("http://broker.local/v1/");
        assert_eq!(config.base_url, "http://broker.local/v1");
    }
}
