//! Mapping of handler failures to HTTP responses.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use tracing::warn;

use crate::live_query::{LiveQueryError, RegistryError};
use crate::transport::TransportError;

/// Error returned by the push-stream and live query endpoints.
///
/// Rendered as `{"error": "..."}` with a status chosen by variant.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// The request carried no `X-Connection-Id` header.
    #[error("missing X-Connection-Id header")]
    MissingConnectionId,
    /// The server is draining and takes no new streams or subscriptions.
    #[error("server is shutting down")]
    ShuttingDown,
    #[error(transparent)]
    LiveQuery(#[from] LiveQueryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        Self::LiveQuery(err.into())
    }
}

impl ApiError {
    #[must_use]
    pub fn status(&self) -> StatusCode {
        match self {
            Self::MissingConnectionId => StatusCode::BAD_REQUEST,
            Self::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
            Self::Transport(TransportError::UnknownConnection(_))
            | Self::LiveQuery(LiveQueryError::Transport(TransportError::UnknownConnection(_))) => {
                StatusCode::NOT_FOUND
            }
            Self::LiveQuery(LiveQueryError::Registry(RegistryError::Unavailable(_))) => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            warn!(error = %self, status = status.as_u16(), "request failed");
        }
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_connection_is_not_found() {
        let err = ApiError::from(TransportError::UnknownConnection("c1".to_string()));
        assert_eq!(err.status(), StatusCode::NOT_FOUND);

        let nested = ApiError::from(LiveQueryError::Transport(
            TransportError::UnknownConnection("c1".to_string()),
        ));
        assert_eq!(nested.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn unavailable_registry_is_retryable() {
        let err = ApiError::from(RegistryError::unavailable(anyhow::anyhow!("down")));
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn repository_failure_is_internal() {
        let err = ApiError::from(LiveQueryError::Repository {
            entity_key: "tasks".to_string(),
            source: anyhow::anyhow!("unknown entity"),
        });
        assert_eq!(err.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn body_carries_message() {
        let response = ApiError::MissingConnectionId.into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), 1024).await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"], "missing X-Connection-Id header");
    }
}
