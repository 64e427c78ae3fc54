//! HTTP handlers for the livesync server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors), the `X-Connection-Id` extractor, and re-exports all handler
//! functions for building the router.

pub mod error;
pub mod health;
pub mod live_query;
pub mod stream;

pub use error::ApiError;
pub use health::{health_handler, liveness_handler, readiness_handler};
pub use live_query::{live_query_subscribe_handler, live_query_unsubscribe_handler};
pub use stream::{keep_alive_handler, stream_handler, subscribe_handler, unsubscribe_handler};

use std::sync::Arc;
use std::time::Instant;

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use livesync_core::messages::CONNECTION_ID_HEADER;
use tokio::sync::mpsc;

use super::{ConnectionId, ConnectionRegistry, NetworkConfig, ShutdownController};
use crate::live_query::{GcTask, LiveQueryPublisher};

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Open push streams and their channel subscriptions.
    pub registry: Arc<ConnectionRegistry>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    pub config: Arc<NetworkConfig>,
    pub publisher: Arc<LiveQueryPublisher>,
    /// Queue of the live query GC worker; closed streams hand their
    /// connection id to it.
    pub gc: Option<mpsc::Sender<GcTask>>,
    /// `true` when diffs are pushed through this process's own streams.
    /// With an external broker, connection ids are the broker's client ids
    /// and are not known to `registry`.
    pub local_push: bool,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}

/// The caller's connection id, read from the `X-Connection-Id` header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConnection(pub ConnectionId);

impl<S: Send + Sync> FromRequestParts<S> for ClientConnection {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        connection_id_from(&parts.headers)
            .map(ClientConnection)
            .ok_or(ApiError::MissingConnectionId)
    }
}

/// Reads a non-empty `X-Connection-Id` header.
#[must_use]
pub fn connection_id_from(headers: &HeaderMap) -> Option<ConnectionId> {
    headers
        .get(CONNECTION_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| ConnectionId(value.to_string()))
}


#[cfg(test)]
mod tests {
    use axum::http::HeaderValue;

    use super::*;

    #[test]
    fn reads_trimmed_header() {
        let mut headers = HeaderMap::new();
        headers.insert(CONNECTION_ID_HEADER, HeaderValue::from_static(" abc "));
        assert_eq!(
            connection_id_from(&headers),
            Some(ConnectionId("abc".to_string()))
        );
    }

    #[test]
    fn blank_header_is_missing() {
        let mut headers = HeaderMap::new();
        assert_eq!(connection_id_from(&headers), None);
        headers.insert(CONNECTION_ID_HEADER, HeaderValue::from_static(""));
        assert_eq!(connection_id_from(&headers), None);
    }
}
