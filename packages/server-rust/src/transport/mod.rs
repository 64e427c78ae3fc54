//! Push transport abstraction.
//!
//! The publisher hands every diff message to a [`SubscriptionServer`]. Two
//! variants exist: the in-process SSE [`ConnectionRegistry`] and the
//! [`BrokerSubscriptionServer`], which forwards to a hosted message broker
//! when clients are connected to some other service.
//!
//! Delivery is at-most-once in both variants: no acknowledgement, no retry.
//!
//! [`ConnectionRegistry`]: crate::network::ConnectionRegistry

pub mod broker;

pub use broker::{BrokerConfig, BrokerSubscriptionServer};

use async_trait::async_trait;

/// Errors raised by a [`SubscriptionServer`].
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("unknown connection: {0}")]
    UnknownConnection(String),
    #[error("broker request failed: {0}")]
    Broker(#[from] reqwest::Error),
    #[error("broker rejected publish with status {0}")]
    BrokerStatus(u16),
    #[error("failed to encode channel message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Publishes messages on named channels.
///
/// Used as `Arc<dyn SubscriptionServer>`.
#[async_trait]
pub trait SubscriptionServer: Send + Sync {
    /// Delivers `message` to every current subscriber of `channel`.
    ///
    /// Writes to dead subscribers are swallowed by the implementation.
    ///
    /// # Errors
    ///
    /// Returns an error only when the transport as a whole is unusable
    /// (e.g. the external broker rejected the request).
    async fn publish_message(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<(), TransportError>;
}
