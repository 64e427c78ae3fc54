//! Translates committed mutations into minimal per-query diff messages.
//!
//! For every registered query of a changed entity, the publisher re-runs the
//! query (narrowed to the changed rows where possible), classifies each
//! change as `add`, `replace`, or `remove` against the ids the client last
//! received, commits the new id snapshot, and publishes the messages on the
//! query's channel.
//!
//! Processing of one query is serialized by a per-query lock held across
//! read, diff, commit, and publish, so messages for a query leave the
//! process in commit order. The locks are process-local; deployments with
//! several publishers rely on the registry backend for cross-process order.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use futures_util::future::join_all;
use livesync_core::{
    ChannelEnvelope, EntityChange, FindOptions, LiveQueryMessage, QueryNotifier, Repository,
    RepositoryProvider, RequestContext, Row, RowId,
};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use super::error::{LiveQueryError, RegistryError};
use super::storage::{LiveQueryStorage, RegisteredQuery};
use crate::service::config::LiveQueryConfig;
use crate::transport::{SubscriptionServer, TransportError};

/// Outcome of diffing one query against a batch of changes.
struct Diff {
    messages: Vec<LiveQueryMessage>,
    ids: Vec<RowId>,
    /// Full fresh result, when the diff had to compute it anyway.
    rows: Option<Vec<Row>>,
}

// ---------------------------------------------------------------------------
// LiveQueryPublisher
// ---------------------------------------------------------------------------

/// Server-side diff engine for live queries.
pub struct LiveQueryPublisher {
    storage: Arc<dyn LiveQueryStorage>,
    transport: Arc<dyn SubscriptionServer>,
    repositories: Arc<dyn RepositoryProvider>,
    config: LiveQueryConfig,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl LiveQueryPublisher {
    #[must_use]
    pub fn new(
        storage: Arc<dyn LiveQueryStorage>,
        transport: Arc<dyn SubscriptionServer>,
        repositories: Arc<dyn RepositoryProvider>,
        config: LiveQueryConfig,
    ) -> Self {
        Self {
            storage,
            transport,
            repositories,
            config,
            locks: DashMap::new(),
        }
    }

    /// The registry this publisher commits to.
    #[must_use]
    pub fn storage(&self) -> &Arc<dyn LiveQueryStorage> {
        &self.storage
    }

    #[must_use]
    pub fn repositories(&self) -> &Arc<dyn RepositoryProvider> {
        &self.repositories
    }

    fn lock_for(&self, query_id: &str) -> Arc<Mutex<()>> {
        Arc::clone(
            self.locks
                .entry(query_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Registers a live query and sends its initial `all` message.
    ///
    /// Returns the query id (the channel to listen on) and the initial rows.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::Repository`] if the initial `find` fails,
    /// [`LiveQueryError::Registry`] if the query cannot be stored, and
    /// [`LiveQueryError::Transport`] if the initial message cannot be sent.
    pub async fn define_live_query_channel(
        &self,
        request: RequestContext,
        entity_key: &str,
        find_options: FindOptions,
        repository: &dyn Repository,
    ) -> Result<(String, Vec<Row>), LiveQueryError> {
        let query = RegisteredQuery::new(request, entity_key, find_options.clone(), Vec::new());
        let query_id = query.id.clone();
        let client_id = query.owner_client_id.clone();

        // Registered before the snapshot is read: a mutation committing
        // meanwhile lists this query and then waits on its lock.
        let lock = self.lock_for(&query_id);
        let _guard = lock.lock().await;
        self.storage.add(query).await?;

        let rows = match repository.find(&find_options).await {
            Ok(rows) => rows,
            Err(source) => {
                self.storage.remove(&query_id).await?;
                return Err(LiveQueryError::Repository {
                    entity_key: entity_key.to_string(),
                    source,
                });
            }
        };
        let ids = rows.iter().map(|row| repository.get_id(row)).collect();
        self.storage.set_data(&query_id, ids).await?;
        self.deliver(ChannelEnvelope {
            client_id,
            query_id: query_id.clone(),
            message: LiveQueryMessage::All(rows.clone()),
        })
        .await?;

        info!(query_id = %query_id, entity_key, rows = rows.len(), "live query registered");
        Ok((query_id, rows))
    }

    /// Unregisters a live query. Diffs already in flight complete but have
    /// no channel left to reach.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::Registry`] if the registry fails.
    pub async fn stop_live_query(&self, query_id: &str) -> Result<(), LiveQueryError> {
        self.storage.remove(query_id).await?;
        self.forget(query_id);
        debug!(query_id, "live query stopped");
        Ok(())
    }

    /// Drops the lock of a query that is no longer registered.
    pub(crate) fn forget(&self, query_id: &str) {
        // A lock currently held is still referenced by its holder.
        self.locks
            .remove_if(query_id, |_, lock| Arc::strong_count(lock) == 1);
    }

    /// Number of per-query locks currently held in memory.
    #[must_use]
    pub fn tracked_queries(&self) -> usize {
        self.locks.len()
    }

    /// Re-evaluates every query of `entity_key` against `changes`.
    ///
    /// `changes` describe one committed batch and are taken as simultaneous:
    /// chained renames must already be merged (see
    /// [`coalesce`](super::coalesce)). Failures of individual queries are
    /// logged and skipped.
    ///
    /// # Errors
    ///
    /// Returns [`LiveQueryError::Registry`] if the queries cannot be listed.
    pub async fn publish_changes(
        &self,
        entity_key: &str,
        changes: Vec<EntityChange>,
    ) -> Result<(), LiveQueryError> {
        if changes.is_empty() {
            return Ok(());
        }
        let queries = self.storage.queries_for_entity(entity_key).await?;
        debug!(entity_key, queries = queries.len(), changes = changes.len(), "publishing changes");

        let runs = queries.into_iter().map(|query| {
            let changes = &changes;
            async move {
                let query_id = query.id;
                if let Err(err) = self.process_query(&query_id, changes).await {
                    metrics::counter!("livesync_live_query_reevaluation_failures_total")
                        .increment(1);
                    warn!(query_id = %query_id, entity_key, error = %err, "live query update failed");
                }
            }
        });
        join_all(runs).await;
        Ok(())
    }

    async fn process_query(
        &self,
        query_id: &str,
        changes: &[EntityChange],
    ) -> Result<(), LiveQueryError> {
        let lock = self.lock_for(query_id);
        let _guard = lock.lock().await;

        // The listing may be stale: unsubscribed or already updated meanwhile.
        let query = match self.storage.get(query_id).await {
            Ok(Some(query)) => query,
            Ok(None) => return Ok(()),
            // Dropped so the next keep-alive reports it unknown and the
            // client registers it again.
            Err(err @ RegistryError::Corrupt { .. }) => {
                warn!(query_id, error = %err, "dropping corrupt live query");
                self.storage.remove(query_id).await?;
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };

        let repository = self
            .repositories
            .repository(&query.entity_key, &query.request)
            .await
            .map_err(|source| LiveQueryError::Repository {
                entity_key: query.entity_key.clone(),
                source,
            })?;

        let reevaluation = |source| LiveQueryError::Reevaluation {
            query_id: query_id.to_string(),
            source,
        };

        let mut diff = if query.find_options.is_row_local() {
            targeted_diff(&query, repository.as_ref(), changes).await
        } else {
            windowed_diff(&query, repository.as_ref(), changes).await
        }
        .map_err(reevaluation)?;

        let unstable = !query.find_options.has_stable_ordering();
        if !diff.messages.is_empty()
            && (unstable || self.config.should_resync(diff.messages.len(), diff.ids.len()))
        {
            let rows = match diff.rows.take() {
                Some(rows) => rows,
                None => repository
                    .find(&query.find_options)
                    .await
                    .map_err(reevaluation)?,
            };
            metrics::counter!("livesync_live_query_resyncs_total").increment(1);
            debug!(query_id, rows = rows.len(), "sending full resync");
            diff.ids = rows.iter().map(|row| repository.get_id(row)).collect();
            diff.messages = vec![LiveQueryMessage::All(rows)];
        }

        if diff.messages.is_empty() {
            return Ok(());
        }

        if !self.storage.set_data(query_id, diff.ids).await? {
            return Ok(());
        }
        for message in diff.messages {
            self.deliver(ChannelEnvelope {
                client_id: query.owner_client_id.clone(),
                query_id: query_id.to_string(),
                message,
            })
            .await?;
        }
        Ok(())
    }

    /// Publishes the message of an envelope on its query's channel.
    async fn deliver(&self, envelope: ChannelEnvelope) -> Result<(), LiveQueryError> {
        let kind = envelope.message.kind();
        let payload = serde_json::to_value(&envelope.message).map_err(TransportError::from)?;
        self.transport
            .publish_message(&envelope.query_id, &payload)
            .await?;
        metrics::counter!("livesync_live_query_messages_total", "type" => kind).increment(1);
        debug!(
            query_id = %envelope.query_id,
            client_id = %envelope.client_id,
            kind,
            "live query message published"
        );
        Ok(())
    }
}

#[async_trait]
impl QueryNotifier for LiveQueryPublisher {
    async fn item_changed(&self, entity_key: &str, changes: Vec<EntityChange>) -> anyhow::Result<()> {
        self.publish_changes(entity_key, changes).await.map_err(|err| {
            error!(entity_key, error = %err, "failed to list live queries");
            anyhow::Error::new(err)
        })
    }
}

// ---------------------------------------------------------------------------
// Diff strategies
// ---------------------------------------------------------------------------

/// Diff for queries whose membership is decided row by row.
///
/// Only the changed rows are fetched back from the repository. Messages are
/// built by replaying them against the ids the client holds, exactly as its
/// reducer will. A batch whose renames cannot be expressed one message at a
/// time (a key swap, a row taking over an id that is still shown) falls back
/// to a full `all`.
async fn targeted_diff(
    query: &RegisteredQuery,
    repository: &dyn Repository,
    changes: &[EntityChange],
) -> anyhow::Result<Diff> {
    let mut fetch: Vec<RowId> = Vec::new();
    for change in changes.iter().filter(|c| !c.deleted) {
        if !fetch.contains(&change.id) {
            fetch.push(change.id.clone());
        }
    }

    let mut current: HashMap<RowId, Row> = HashMap::new();
    if !fetch.is_empty() {
        let options = query.find_options.restricted_to(repository.id_filter(&fetch));
        for row in repository.find(&options).await? {
            let id = repository.get_id(&row);
            if fetch.contains(&id) {
                current.insert(id, row);
            }
        }
    }

    let mut ids = query.last_known_ids.clone();
    let mut written: HashSet<RowId> = HashSet::new();
    let mut messages = Vec::new();
    for change in changes {
        // The client would resolve `old_id` to a row written by this batch.
        if written.contains(&change.old_id) {
            return full_diff(query, repository).await;
        }
        let was_at = ids.iter().position(|id| *id == change.old_id);
        let now = if change.deleted {
            None
        } else {
            current.remove(&change.id)
        };
        let taken = now.is_some()
            && change.id_changed()
            && ids.iter().any(|id| *id == change.id);

        match (was_at, now) {
            (_, Some(_)) if taken => {
                return full_diff(query, repository).await;
            }
            (Some(pos), Some(row)) => {
                ids[pos].clone_from(&change.id);
                written.insert(change.id.clone());
                messages.push(LiveQueryMessage::replace(change.old_id.clone(), row));
            }
            (None, Some(row)) => {
                ids.push(change.id.clone());
                written.insert(change.id.clone());
                messages.push(LiveQueryMessage::Add(row));
            }
            (Some(pos), None) => {
                ids.remove(pos);
                messages.push(LiveQueryMessage::remove(change.old_id.clone()));
            }
            (None, None) => {}
        }
    }

    Ok(Diff {
        messages,
        ids,
        rows: None,
    })
}

/// Replaces the whole result with one `all` message.
async fn full_diff(query: &RegisteredQuery, repository: &dyn Repository) -> anyhow::Result<Diff> {
    let rows = repository.find(&query.find_options).await?;
    let ids = rows.iter().map(|row| repository.get_id(row)).collect();
    debug!(query_id = %query.id, "colliding renames in batch");
    Ok(Diff {
        messages: vec![LiveQueryMessage::All(rows.clone())],
        ids,
        rows: Some(rows),
    })
}

/// Diff for queries with a `limit`, where any change can shift the window.
///
/// Re-runs the full query and compares it against the previous ids.
async fn windowed_diff(
    query: &RegisteredQuery,
    repository: &dyn Repository,
    changes: &[EntityChange],
) -> anyhow::Result<Diff> {
    let rows = repository.find(&query.find_options).await?;
    let ids: Vec<RowId> = rows.iter().map(|row| repository.get_id(row)).collect();

    let previous: HashSet<&str> = query.last_known_ids.iter().map(String::as_str).collect();
    let touched: HashSet<&str> = changes.iter().map(|c| c.id.as_str()).collect();
    let renamed: HashMap<&str, &str> = changes
        .iter()
        .filter(|c| !c.deleted && c.id_changed())
        .map(|c| (c.id.as_str(), c.old_id.as_str()))
        .collect();

    let fresh: HashSet<&str> = ids.iter().map(String::as_str).collect();
    let mut replaced_old: HashSet<&str> = HashSet::new();
    let mut upserts = Vec::new();
    for (row, id) in rows.iter().zip(&ids) {
        if previous.contains(id.as_str()) {
            if touched.contains(id.as_str()) {
                upserts.push(LiveQueryMessage::replace(id.clone(), row.clone()));
            }
            continue;
        }
        // A rename is only a replace while no other row still holds the old id.
        let source = renamed.get(id.as_str()).copied().filter(|old| {
            previous.contains(old) && !fresh.contains(old) && !replaced_old.contains(old)
        });
        match source {
            Some(old) => {
                replaced_old.insert(old);
                upserts.push(LiveQueryMessage::replace(old, row.clone()));
            }
            None => upserts.push(LiveQueryMessage::Add(row.clone())),
        }
    }

    let mut messages: Vec<LiveQueryMessage> = query
        .last_known_ids
        .iter()
        .filter(|id| !fresh.contains(id.as_str()) && !replaced_old.contains(id.as_str()))
        .map(|id| LiveQueryMessage::remove(id.clone()))
        .collect();
    messages.extend(upserts);

    Ok(Diff {
        messages,
        ids,
        rows: Some(rows),
    })
}
