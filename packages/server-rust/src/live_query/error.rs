//! Error types for the live query registry and publisher.

use crate::transport::TransportError;

/// Failure of a [`LiveQueryStorage`](super::LiveQueryStorage) backend.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// The backend could not be reached or the operation failed.
    #[error("live query registry unavailable: {0}")]
    Unavailable(#[source] anyhow::Error),
    /// A stored entry could not be decoded.
    #[error("live query {id} is corrupt: {source}")]
    Corrupt {
        id: String,
        #[source]
        source: serde_json::Error,
    },
}

impl RegistryError {
    pub(crate) fn unavailable(err: impl Into<anyhow::Error>) -> Self {
        Self::Unavailable(err.into())
    }
}

/// Errors surfaced by the live query publisher.
#[derive(Debug, thiserror::Error)]
pub enum LiveQueryError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    /// Re-running a registered query after a mutation failed.
    #[error("failed to re-evaluate live query {query_id}: {source}")]
    Reevaluation {
        query_id: String,
        #[source]
        source: anyhow::Error,
    },
    /// The repository for an entity could not be created or queried.
    #[error("repository for entity {entity_key} failed: {source}")]
    Repository {
        entity_key: String,
        #[source]
        source: anyhow::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_query() {
        let err = LiveQueryError::Reevaluation {
            query_id: "q1".to_string(),
            source: anyhow::anyhow!("boom"),
        };
        assert_eq!(err.to_string(), "failed to re-evaluate live query q1: boom");
    }

    #[test]
    fn registry_error_converts() {
        let err: LiveQueryError = RegistryError::unavailable(anyhow::anyhow!("down")).into();
        assert!(matches!(err, LiveQueryError::Registry(RegistryError::Unavailable(_))));
        assert_eq!(err.to_string(), "live query registry unavailable: down");
    }
}
