//! Client error type.

/// Errors returned by the client API.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),
    /// The server answered with a non-success status.
    #[error("server responded with status {0}")]
    Status(u16),
    /// No push stream is open yet (or it was lost and is reconnecting).
    #[error("not connected to the push stream")]
    NotConnected,
    #[error("failed to decode server payload: {0}")]
    Decode(#[from] serde_json::Error),
    /// The client was closed.
    #[error("client closed")]
    Closed,
}

impl ClientError {
    /// Whether retrying after a reconnect may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Http(_) | Self::NotConnected => true,
            Self::Status(status) => *status == 404 || *status >= 500,
            Self::Decode(_) | Self::Closed => false,
        }
    }
}
