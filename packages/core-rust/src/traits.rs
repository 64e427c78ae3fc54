use std::sync::Arc;

use async_trait::async_trait;

use crate::context::RequestContext;
use crate::query::{Filter, FindOptions};
use crate::types::{EntityChange, Row, RowId};

/// Request-scoped access to one entity's rows.
///
/// Implementations already apply API prefilters, backend prefilters, and
/// authorization for the user they were created for.
#[async_trait]
pub trait Repository: Send + Sync {
    /// Key of the entity this repository serves (e.g. `"tasks"`).
    fn entity_key(&self) -> &str;

    /// Runs a query, returning rows in API JSON form.
    async fn find(&self, options: &FindOptions) -> anyhow::Result<Vec<Row>>;

    /// Computes a row's id from its raw data.
    fn get_id(&self, row: &Row) -> RowId;

    /// Builds a filter matching exactly the rows with the given ids.
    fn id_filter(&self, ids: &[RowId]) -> Filter;
}

/// Creates request-scoped repositories from a serialized request context.
///
/// This is what lets a process that never saw the original subscribe request
/// re-evaluate a registered query with the subscriber's permissions.
#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Returns a repository for `entity_key` acting on behalf of `ctx`.
    async fn repository(
        &self,
        entity_key: &str,
        ctx: &RequestContext,
    ) -> anyhow::Result<Arc<dyn Repository>>;
}

/// Write-path notification for live query updates.
///
/// The CRUD layer calls this once per entity key per committed batch.
#[async_trait]
pub trait QueryNotifier: Send + Sync {
    /// Reports the rows of `entity_key` touched by a committed mutation.
    ///
    /// # Errors
    ///
    /// Returns an error only when the notification could not be processed
    /// at all (e.g. the query registry is unreachable). Failures of
    /// individual queries are handled by the implementation.
    async fn item_changed(&self, entity_key: &str, changes: Vec<EntityChange>) -> anyhow::Result<()>;
}
