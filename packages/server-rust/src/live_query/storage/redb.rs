//! Durable live query registry on an embedded `redb` database.
//!
//! Entries are JSON-encoded [`RegisteredQuery`] values keyed by query id in
//! the `live_queries` table. `redb` is synchronous, so every operation runs
//! on the blocking pool.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use livesync_core::clock::is_expired;
use livesync_core::{ClockSource, RowId, SystemClock};
use redb::{Database, ReadableTable, ReadableTableMetadata, TableDefinition};
use tracing::warn;

use super::{LiveQueryStorage, RegisteredQuery};
use crate::live_query::error::RegistryError;

const QUERIES: TableDefinition<&str, &[u8]> = TableDefinition::new("live_queries");

fn db_err(err: impl Into<redb::Error>) -> RegistryError {
    RegistryError::unavailable(err.into())
}

fn decode(id: &str, bytes: &[u8]) -> Result<RegisteredQuery, RegistryError> {
    serde_json::from_slice(bytes).map_err(|source| RegistryError::Corrupt {
        id: id.to_string(),
        source,
    })
}

fn encode(query: &RegisteredQuery) -> Result<Vec<u8>, RegistryError> {
    serde_json::to_vec(query).map_err(RegistryError::unavailable)
}

/// Registry persisted in a single `redb` file.
pub struct RedbLiveQueryStorage {
    db: Arc<Database>,
    clock: Arc<dyn ClockSource>,
}

impl RedbLiveQueryStorage {
    /// Opens (or creates) the database at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`RegistryError::Unavailable`] if the file cannot be opened
    /// or the table cannot be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, RegistryError> {
        Self::open_with_clock(path, Arc::new(SystemClock))
    }

    /// Opens the database with an injected clock.
    ///
    /// # Errors
    ///
    /// See [`open`](Self::open).
    pub fn open_with_clock(
        path: impl AsRef<Path>,
        clock: Arc<dyn ClockSource>,
    ) -> Result<Self, RegistryError> {
        let db = Database::create(path).map_err(db_err)?;
        let txn = db.begin_write().map_err(db_err)?;
        txn.open_table(QUERIES).map_err(db_err)?;
        txn.commit().map_err(db_err)?;
        Ok(Self {
            db: Arc::new(db),
            clock,
        })
    }

    async fn blocking<T, F>(&self, f: F) -> Result<T, RegistryError>
    where
        T: Send + 'static,
        F: FnOnce(&Database) -> Result<T, RegistryError> + Send + 'static,
    {
        let db = Arc::clone(&self.db);
        tokio::task::spawn_blocking(move || f(&db))
            .await
            .map_err(RegistryError::unavailable)?
    }

    /// Decodes every entry matching `keep`. Corrupt entries are skipped.
    async fn scan<F>(&self, keep: F) -> Result<Vec<RegisteredQuery>, RegistryError>
    where
        F: Fn(&RegisteredQuery) -> bool + Send + 'static,
    {
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(QUERIES).map_err(db_err)?;
            let mut out = Vec::new();
            for entry in table.iter().map_err(db_err)? {
                let (key, value) = entry.map_err(db_err)?;
                match decode(key.value(), value.value()) {
                    Ok(query) if keep(&query) => out.push(query),
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "skipping corrupt live query entry"),
                }
            }
            Ok(out)
        })
        .await
    }

    /// Removes every entry matching `drop_it` in one write transaction,
    /// together with every entry that cannot be decoded.
    async fn remove_where<F>(&self, drop_it: F) -> Result<Vec<String>, RegistryError>
    where
        F: Fn(&RegisteredQuery) -> bool + Send + 'static,
    {
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            let mut removed = Vec::new();
            {
                let mut table = txn.open_table(QUERIES).map_err(db_err)?;
                for entry in table.iter().map_err(db_err)? {
                    let (key, value) = entry.map_err(db_err)?;
                    let doomed = match decode(key.value(), value.value()) {
                        Ok(query) => drop_it(&query),
                        Err(err) => {
                            warn!(error = %err, "removing corrupt live query entry");
                            true
                        }
                    };
                    if doomed {
                        removed.push(key.value().to_string());
                    }
                }
                for id in &removed {
                    table.remove(id.as_str()).map_err(db_err)?;
                }
            }
            txn.commit().map_err(db_err)?;
            Ok(removed)
        })
        .await
    }
}

#[async_trait]
impl LiveQueryStorage for RedbLiveQueryStorage {
    async fn add(&self, mut query: RegisteredQuery) -> Result<(), RegistryError> {
        query.last_touched = self.clock.now();
        let bytes = encode(&query)?;
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(QUERIES).map_err(db_err)?;
                table.insert(query.id.as_str(), bytes.as_slice()).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)
        })
        .await
    }

    async fn remove(&self, id: &str) -> Result<(), RegistryError> {
        let id = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            {
                let mut table = txn.open_table(QUERIES).map_err(db_err)?;
                table.remove(id.as_str()).map_err(db_err)?;
            }
            txn.commit().map_err(db_err)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<RegisteredQuery>, RegistryError> {
        let id = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(QUERIES).map_err(db_err)?;
            match table.get(id.as_str()).map_err(db_err)? {
                Some(value) => decode(&id, value.value()).map(Some),
                None => Ok(None),
            }
        })
        .await
    }

    async fn queries_for_entity(
        &self,
        entity_key: &str,
    ) -> Result<Vec<RegisteredQuery>, RegistryError> {
        let entity_key = entity_key.to_string();
        self.scan(move |q| q.entity_key == entity_key).await
    }

    async fn set_data(&self, id: &str, last_known_ids: Vec<RowId>) -> Result<bool, RegistryError> {
        let id = id.to_string();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            let found = {
                let mut table = txn.open_table(QUERIES).map_err(db_err)?;
                let current = match table.get(id.as_str()).map_err(db_err)? {
                    Some(value) => Some(decode(&id, value.value())?),
                    None => None,
                };
                match current {
                    Some(mut query) => {
                        query.last_known_ids = last_known_ids;
                        let bytes = encode(&query)?;
                        table.insert(id.as_str(), bytes.as_slice()).map_err(db_err)?;
                        true
                    }
                    None => false,
                }
            };
            txn.commit().map_err(db_err)?;
            Ok(found)
        })
        .await
    }

    async fn keep_alive_and_return_unknown_query_ids(
        &self,
        ids: &[String],
    ) -> Result<Vec<String>, RegistryError> {
        let ids = ids.to_vec();
        let now = self.clock.now();
        self.blocking(move |db| {
            let txn = db.begin_write().map_err(db_err)?;
            let mut unknown = Vec::new();
            {
                let mut table = txn.open_table(QUERIES).map_err(db_err)?;
                for id in ids {
                    let current = match table.get(id.as_str()).map_err(db_err)? {
                        Some(value) => Some(decode(&id, value.value())),
                        None => None,
                    };
                    match current {
                        Some(Ok(mut query)) => {
                            query.last_touched = now;
                            let bytes = encode(&query)?;
                            table.insert(id.as_str(), bytes.as_slice()).map_err(db_err)?;
                        }
                        // Reported unknown so the client registers it afresh.
                        Some(Err(err)) => {
                            warn!(error = %err, "dropping corrupt live query on keep-alive");
                            table.remove(id.as_str()).map_err(db_err)?;
                            unknown.push(id);
                        }
                        None => unknown.push(id),
                    }
                }
            }
            txn.commit().map_err(db_err)?;
            Ok(unknown)
        })
        .await
    }

    async fn remove_expired(&self, ttl: Duration) -> Result<Vec<String>, RegistryError> {
        let now = self.clock.now();
        self.remove_where(move |q| is_expired(q.last_touched, now, ttl))
            .await
    }

    async fn remove_for_client(&self, client_id: &str) -> Result<Vec<String>, RegistryError> {
        let client_id = client_id.to_string();
        self.remove_where(move |q| q.owner_client_id == client_id).await
    }

    async fn count(&self) -> Result<usize, RegistryError> {
        self.blocking(|db| {
            let txn = db.begin_read().map_err(db_err)?;
            let table = txn.open_table(QUERIES).map_err(db_err)?;
            let len = table.len().map_err(db_err)?;
            Ok(usize::try_from(len).unwrap_or(usize::MAX))
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use livesync_core::{FindOptions, ManualClock, RequestContext};

    use super::super::behavior;
    use super::*;

    fn open(dir: &tempfile::TempDir) -> RedbLiveQueryStorage {
        RedbLiveQueryStorage::open(dir.path().join("live_queries.redb")).unwrap()
    }

    #[tokio::test]
    async fn add_get_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        behavior::add_get_overwrite(&open(&dir)).await;
    }

    #[tokio::test]
    async fn entity_listing_and_commit() {
        let dir = tempfile::tempdir().unwrap();
        behavior::entity_listing_and_commit(&open(&dir)).await;
    }

    #[tokio::test]
    async fn keep_alive_and_expiry() {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(1_000_000));
        let storage =
            RedbLiveQueryStorage::open_with_clock(dir.path().join("q.redb"), clock.clone())
                .unwrap();
        behavior::keep_alive_and_expiry(&storage, &clock).await;
    }

    #[tokio::test]
    async fn drop_client() {
        let dir = tempfile::tempdir().unwrap();
        behavior::drop_client(&open(&dir)).await;
    }

    #[tokio::test]
    async fn survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let query = RegisteredQuery::new(
            RequestContext::new("c1", None),
            "tasks",
            FindOptions::default(),
            vec!["a".to_string(), "b".to_string()],
        );
        {
            let storage = open(&dir);
            storage.add(query.clone()).await.unwrap();
        }
        let storage = open(&dir);
        let stored = storage.get(&query.id).await.unwrap().unwrap();
        assert_eq!(stored.last_known_ids, vec!["a", "b"]);
        assert_eq!(storage.count().await.unwrap(), 1);
    }

    fn insert_raw(storage: &RedbLiveQueryStorage, id: &str, bytes: &[u8]) {
        let txn = storage.db.begin_write().unwrap();
        {
            let mut table = txn.open_table(QUERIES).unwrap();
            table.insert(id, bytes).unwrap();
        }
        txn.commit().unwrap();
    }

    fn tasks_query(client: &str) -> RegisteredQuery {
        RegisteredQuery::new(
            RequestContext::new(client, None),
            "tasks",
            FindOptions::default(),
            vec!["a".to_string()],
        )
    }

    #[tokio::test]
    async fn corrupt_entry_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        let sibling = tasks_query("c1");
        storage.add(sibling.clone()).await.unwrap();
        insert_raw(&storage, "bad", b"not json");

        let err = storage.get("bad").await.unwrap_err();
        assert!(matches!(err, RegistryError::Corrupt { ref id, .. } if id == "bad"));

        // Siblings keep listing and committing.
        let listed = storage.queries_for_entity("tasks").await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, sibling.id);
        assert!(storage.set_data(&sibling.id, vec![]).await.unwrap());
    }

    #[tokio::test]
    async fn removal_passes_drop_corrupt_entries() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        let other = tasks_query("c2");
        storage.add(tasks_query("c1")).await.unwrap();
        storage.add(other.clone()).await.unwrap();
        insert_raw(&storage, "bad", b"{");

        let removed = storage.remove_for_client("c1").await.unwrap();
        assert_eq!(removed.len(), 2);
        assert!(removed.contains(&"bad".to_string()));
        assert_eq!(storage.count().await.unwrap(), 1);

        insert_raw(&storage, "bad", b"{");
        let expired = storage.remove_expired(Duration::from_secs(3600)).await.unwrap();
        assert_eq!(expired, vec!["bad".to_string()]);
        assert!(storage.get(&other.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn keep_alive_reports_corrupt_entry_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let storage = open(&dir);
        let good = tasks_query("c1");
        storage.add(good.clone()).await.unwrap();
        insert_raw(&storage, "bad", b"[]");

        let unknown = storage
            .keep_alive_and_return_unknown_query_ids(&[good.id.clone(), "bad".to_string()])
            .await
            .unwrap();
        assert_eq!(unknown, vec!["bad".to_string()]);
        assert!(storage.get("bad").await.unwrap().is_none());
    }
}
