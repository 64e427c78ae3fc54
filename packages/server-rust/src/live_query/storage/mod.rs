//! Durable registry of live queries.
//!
//! The registry is the only state that must survive a process restart: every
//! subscribed query with the ordered ids the client last received. Any
//! process sharing the backend can re-evaluate a query from its entry alone.

pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
#[cfg(feature = "redb")]
pub mod redb;

pub use self::memory::MemoryLiveQueryStorage;
#[cfg(feature = "postgres")]
pub use self::postgres::PostgresLiveQueryStorage;
#[cfg(feature = "redb")]
pub use self::redb::RedbLiveQueryStorage;

use std::time::Duration;

use async_trait::async_trait;
pub use livesync_core::live_query_id;
use livesync_core::{FindOptions, RequestContext, RowId};
use serde::{Deserialize, Serialize};

use super::error::RegistryError;

// ---------------------------------------------------------------------------
// RegisteredQuery
// ---------------------------------------------------------------------------

/// One subscribed live query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisteredQuery {
    /// Channel name the diff messages are published on.
    pub id: String,
    pub entity_key: String,
    pub find_options: FindOptions,
    /// Ordered ids of the rows the client holds after the last delivered message.
    pub last_known_ids: Vec<RowId>,
    pub owner_client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Context used to rebuild the request-scoped repository on re-evaluation.
    pub request: RequestContext,
    /// Last keep-alive, in milliseconds since epoch. Stamped by the storage.
    #[serde(default)]
    pub last_touched: u64,
}

impl RegisteredQuery {
    /// Creates an entry with a deterministic id for `(client, entity, options)`.
    #[must_use]
    pub fn new(
        request: RequestContext,
        entity_key: impl Into<String>,
        find_options: FindOptions,
        last_known_ids: Vec<RowId>,
    ) -> Self {
        let entity_key = entity_key.into();
        Self {
            id: live_query_id(&request.client_id, &entity_key, &find_options),
            entity_key,
            find_options,
            last_known_ids,
            owner_client_id: request.client_id.clone(),
            user_id: request.user_id.clone(),
            request,
            last_touched: 0,
        }
    }
}


// ---------------------------------------------------------------------------
// LiveQueryStorage trait
// ---------------------------------------------------------------------------

/// Storage backend for registered live queries.
///
/// Used as `Arc<dyn LiveQueryStorage>`. Implementations own their clock and
/// stamp `last_touched` on `add` and keep-alive.
#[async_trait]
pub trait LiveQueryStorage: Send + Sync {
    /// Inserts a query, overwriting any entry with the same id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the backend fails.
    async fn add(&self, query: RegisteredQuery) -> Result<(), RegistryError>;

    /// Deletes a query. Absent ids are ignored.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the backend fails.
    async fn remove(&self, id: &str) -> Result<(), RegistryError>;

    /// Looks up a query by id.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the backend fails or the entry is corrupt.
    async fn get(&self, id: &str) -> Result<Option<RegisteredQuery>, RegistryError>;

    /// All queries registered against `entity_key`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the backend fails or an entry is corrupt.
    async fn queries_for_entity(&self, entity_key: &str)
        -> Result<Vec<RegisteredQuery>, RegistryError>;

    /// Commits a new id snapshot for a query.
    ///
    /// Returns `false` if the query no longer exists.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the backend fails.
    async fn set_data(&self, id: &str, last_known_ids: Vec<RowId>) -> Result<bool, RegistryError>;

    /// Touches the known ids and returns the ones the registry does not hold.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the backend fails.
    async fn keep_alive_and_return_unknown_query_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<String>, RegistryError>;

    /// Drops queries not touched within `ttl`, returning their ids.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the backend fails.
    async fn remove_expired(&self, ttl: Duration) -> Result<Vec<String>, RegistryError>;

    /// Drops every query owned by `client_id`, returning their ids.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the backend fails.
    async fn remove_for_client(&self, client_id: &str) -> Result<Vec<String>, RegistryError>;

    /// Number of registered queries.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError`] if the backend fails.
    async fn count(&self) -> Result<usize, RegistryError>;
}

// ---------------------------------------------------------------------------
// Shared behavior suite
// ---------------------------------------------------------------------------
