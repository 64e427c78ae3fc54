//! In-memory entity repository with write-path live query notification.
//!
//! Rows are kept in id order in a `BTreeMap`, so an unordered `find` is
//! deterministic. Every mutation reports the touched rows to the configured
//! [`QueryNotifier`] after it has been applied.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use livesync_core::{
    EntityChange, Filter, FilterError, FindOptions, QueryNotifier, Repository, RepositoryProvider,
    RequestContext, Row, RowId,
};
use parking_lot::RwLock;

use crate::live_query::LiveQueryTransaction;

/// Slot for the notifier shared by every repository of a provider.
type NotifierSlot = Arc<RwLock<Option<Arc<dyn QueryNotifier>>>>;

fn row_id(key_field: &str, row: &Row) -> RowId {
    match row.get(key_field) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    }
}

/// Key values that `row_id` maps to `id`.
///
/// Non-string keys are stringified as JSON text, so `"7"` may stand for the
/// number `7` as well as the string `"7"`.
fn key_candidates(id: &str) -> impl Iterator<Item = serde_json::Value> {
    let typed = serde_json::from_str::<serde_json::Value>(id)
        .ok()
        .filter(|value| !value.is_string() && !value.is_null());
    std::iter::once(serde_json::Value::String(id.to_string())).chain(typed)
}

// ---------------------------------------------------------------------------
// MemoryRepository
// ---------------------------------------------------------------------------

/// Rows of one entity held in memory.
pub struct MemoryRepository {
    entity_key: String,
    key_field: String,
    rows: RwLock<BTreeMap<RowId, Row>>,
    notifier: NotifierSlot,
}

impl MemoryRepository {
    /// Creates an empty repository without a notifier.
    #[must_use]
    pub fn new(entity_key: impl Into<String>, key_field: impl Into<String>) -> Self {
        Self::with_slot(entity_key.into(), key_field.into(), Arc::default())
    }

    fn with_slot(entity_key: String, key_field: String, notifier: NotifierSlot) -> Self {
        Self {
            entity_key,
            key_field,
            rows: RwLock::new(BTreeMap::new()),
            notifier,
        }
    }

    /// Replaces the notifier that mutations report to.
    pub fn set_notifier(&self, notifier: Arc<dyn QueryNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    /// Loads rows without notifying anyone.
    pub fn seed(&self, rows: impl IntoIterator<Item = Row>) {
        let mut map = self.rows.write();
        for row in rows {
            map.insert(row_id(&self.key_field, &row), row);
        }
    }

    /// Current row with the given id.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<Row> {
        self.rows.read().get(id).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.rows.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.rows.read().is_empty()
    }

    /// Evaluates `options` against the current rows.
    ///
    /// # Errors
    ///
    /// Returns [`FilterError`] if the filter cannot be evaluated.
    pub fn snapshot(&self, options: &FindOptions) -> Result<Vec<Row>, FilterError> {
        let rows = self.rows.read();
        options.apply(rows.values())
    }

    fn notifier(&self) -> Option<Arc<dyn QueryNotifier>> {
        self.notifier.read().clone()
    }

    async fn notify(&self, changes: Vec<EntityChange>) -> anyhow::Result<()> {
        match self.notifier() {
            Some(notifier) => notifier.item_changed(&self.entity_key, changes).await,
            None => Ok(()),
        }
    }

    /// Applies one upsert or delete without notifying.
    fn write(&self, id: &str, row: Option<Row>) -> anyhow::Result<Option<EntityChange>> {
        let mut rows = self.rows.write();
        match row {
            None => Ok(rows.remove(id).map(|_| EntityChange::deleted(id))),
            Some(row) => {
                let new_id = row_id(&self.key_field, &row);
                if !rows.contains_key(id) {
                    if new_id != id {
                        anyhow::bail!("inserted row id {new_id} does not match {id}");
                    }
                    rows.insert(new_id.clone(), row);
                    return Ok(Some(EntityChange::inserted(new_id)));
                }
                if new_id != id {
                    if rows.contains_key(&new_id) {
                        anyhow::bail!("{} row {new_id} already exists", self.entity_key);
                    }
                    rows.remove(id);
                }
                rows.insert(new_id.clone(), row);
                Ok(Some(EntityChange::updated(id, new_id)))
            }
        }
    }

    /// Inserts a new row and notifies.
    ///
    /// # Errors
    ///
    /// Fails if a row with the same id exists or the notifier fails.
    pub async fn insert(&self, row: Row) -> anyhow::Result<RowId> {
        let id = row_id(&self.key_field, &row);
        if self.rows.read().contains_key(&id) {
            anyhow::bail!("{} row {id} already exists", self.entity_key);
        }
        let change = self.write(&id, Some(row))?;
        self.notify(change.into_iter().collect()).await?;
        Ok(id)
    }

    /// Replaces the row `id` with `row`, which may carry a new id.
    ///
    /// # Errors
    ///
    /// Fails if `id` does not exist, the new id is taken, or the notifier fails.
    pub async fn update(&self, id: &str, row: Row) -> anyhow::Result<()> {
        if !self.rows.read().contains_key(id) {
            anyhow::bail!("{} row {id} not found", self.entity_key);
        }
        let change = self.write(id, Some(row))?;
        self.notify(change.into_iter().collect()).await
    }

    /// Deletes the row `id`. Missing rows are ignored.
    ///
    /// # Errors
    ///
    /// Fails if the notifier fails.
    pub async fn delete(&self, id: &str) -> anyhow::Result<()> {
        match self.write(id, None)? {
            Some(change) => self.notify(vec![change]).await,
            None => Ok(()),
        }
    }

    /// Applies several upserts (`Some`) and deletes (`None`) as one batch
    /// with a single notification.
    ///
    /// # Errors
    ///
    /// Fails on the first invalid write (earlier writes stay applied and are
    /// not announced) or if the notifier fails.
    pub async fn apply_batch(&self, ops: Vec<(RowId, Option<Row>)>) -> anyhow::Result<()> {
        let Some(notifier) = self.notifier() else {
            for (id, row) in ops {
                self.write(&id, row)?;
            }
            return Ok(());
        };
        let mut tx = LiveQueryTransaction::new(notifier);
        for (id, row) in ops {
            if let Some(change) = self.write(&id, row)? {
                tx.record(&self.entity_key, change);
            }
        }
        tx.commit().await
    }
}

#[async_trait]
impl Repository for MemoryRepository {
    fn entity_key(&self) -> &str {
        &self.entity_key
    }

    async fn find(&self, options: &FindOptions) -> anyhow::Result<Vec<Row>> {
        Ok(self.snapshot(options)?)
    }

    fn get_id(&self, row: &Row) -> RowId {
        row_id(&self.key_field, row)
    }

    fn id_filter(&self, ids: &[RowId]) -> Filter {
        Filter::is_in(
            self.key_field.clone(),
            ids.iter().flat_map(|id| key_candidates(id)),
        )
    }
}

// ---------------------------------------------------------------------------
// Request-scoped view
// ---------------------------------------------------------------------------

/// A repository restricted to the rows a user owns.
struct ScopedRepository {
    inner: Arc<MemoryRepository>,
    prefilter: Filter,
}

#[async_trait]
impl Repository for ScopedRepository {
    fn entity_key(&self) -> &str {
        self.inner.entity_key()
    }

    async fn find(&self, options: &FindOptions) -> anyhow::Result<Vec<Row>> {
        let scoped = FindOptions {
            r#where: Some(Filter::and([
                self.prefilter.clone(),
                options.r#where.clone().unwrap_or_default(),
            ])),
            ..options.clone()
        };
        self.inner.find(&scoped).await
    }

    fn get_id(&self, row: &Row) -> RowId {
        self.inner.get_id(row)
    }

    fn id_filter(&self, ids: &[RowId]) -> Filter {
        self.inner.id_filter(ids)
    }
}

// ---------------------------------------------------------------------------
// MemoryRepositoryProvider
// ---------------------------------------------------------------------------

/// Hands out in-memory repositories by entity key.
///
/// When an owner field is configured, requests carrying a user id only see
/// rows whose owner field equals that user.
pub struct MemoryRepositoryProvider {
    key_field: String,
    owner_field: Option<String>,
    entities: DashMap<String, Arc<MemoryRepository>>,
    notifier: NotifierSlot,
}

impl MemoryRepositoryProvider {
    /// Creates a provider whose rows are keyed by `key_field`.
    #[must_use]
    pub fn new(key_field: impl Into<String>) -> Self {
        Self {
            key_field: key_field.into(),
            owner_field: None,
            entities: DashMap::new(),
            notifier: Arc::default(),
        }
    }

    /// Scopes user requests to rows whose `field` equals the user id.
    #[must_use]
    pub fn with_owner_field(mut self, field: impl Into<String>) -> Self {
        self.owner_field = Some(field.into());
        self
    }

    /// Sets the notifier for every current and future entity.
    pub fn set_notifier(&self, notifier: Arc<dyn QueryNotifier>) {
        *self.notifier.write() = Some(notifier);
    }

    /// The repository for `entity_key`, created empty on first use.
    #[must_use]
    pub fn entity(&self, entity_key: &str) -> Arc<MemoryRepository> {
        Arc::clone(
            self.entities
                .entry(entity_key.to_string())
                .or_insert_with(|| {
                    Arc::new(MemoryRepository::with_slot(
                        entity_key.to_string(),
                        self.key_field.clone(),
                        Arc::clone(&self.notifier),
                    ))
                })
                .value(),
        )
    }
}

#[async_trait]
impl RepositoryProvider for MemoryRepositoryProvider {
    async fn repository(
        &self,
        entity_key: &str,
        ctx: &RequestContext,
    ) -> anyhow::Result<Arc<dyn Repository>> {
        let Some(inner) = self.entities.get(entity_key).map(|e| Arc::clone(e.value())) else {
            anyhow::bail!("unknown entity {entity_key}");
        };
        match (&self.owner_field, &ctx.user_id) {
            (Some(field), Some(user)) => Ok(Arc::new(ScopedRepository {
                inner,
                prefilter: Filter::eq(field.clone(), user.clone()),
            })),
            _ => Ok(inner),
        }
    }
}
