//! Batching of mutation notifications across a transaction.
//!
//! Live query updates must only be computed from committed state, and a
//! transaction touching many rows should trigger one re-evaluation per entity
//! instead of one per row. [`LiveQueryTransaction`] buffers changes and hands
//! them to a [`QueryNotifier`] on commit.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use livesync_core::{EntityChange, QueryNotifier, RowId};
use tracing::debug;

/// Merges chained changes to the same row.
///
/// `a -> b` followed by `b -> c` becomes `a -> c`, and the most recent
/// `deleted` flag wins. Order of first appearance is preserved.
///
/// `changes` must be in commit order. The output describes simultaneous
/// changes (`[a -> b, b -> a]` is a key swap) and must not be coalesced
/// again.
#[must_use]
pub fn coalesce(changes: impl IntoIterator<Item = EntityChange>) -> Vec<EntityChange> {
    let mut out: Vec<EntityChange> = Vec::new();
    let mut by_current_id: HashMap<RowId, usize> = HashMap::new();

    for change in changes {
        // A deleted row only continues as a reinsert under the same id.
        let continues = by_current_id
            .get(&change.old_id)
            .filter(|&&pos| !out[pos].deleted || !change.id_changed())
            .copied();
        if let Some(pos) = continues {
            by_current_id.remove(&change.old_id);
            let merged = &mut out[pos];
            merged.id.clone_from(&change.id);
            merged.deleted = change.deleted;
            by_current_id.insert(change.id, pos);
        } else {
            by_current_id.insert(change.id.clone(), out.len());
            out.push(change);
        }
    }
    out
}

/// Buffers row changes until the surrounding transaction commits.
///
/// Dropping the transaction without calling [`commit`](Self::commit)
/// discards every buffered change.
pub struct LiveQueryTransaction {
    notifier: Arc<dyn QueryNotifier>,
    pending: BTreeMap<String, Vec<EntityChange>>,
}

impl LiveQueryTransaction {
    #[must_use]
    pub fn new(notifier: Arc<dyn QueryNotifier>) -> Self {
        Self {
            notifier,
            pending: BTreeMap::new(),
        }
    }

    /// Buffers one change to a row of `entity_key`.
    pub fn record(&mut self, entity_key: &str, change: EntityChange) {
        self.pending
            .entry(entity_key.to_string())
            .or_default()
            .push(change);
    }

    /// Whether nothing has been recorded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Flushes one notification per entity key.
    ///
    /// Every entity key is flushed even if an earlier one fails.
    ///
    /// # Errors
    ///
    /// Returns the first notifier error.
    pub async fn commit(mut self) -> anyhow::Result<()> {
        let pending = std::mem::take(&mut self.pending);
        let mut first_error = None;
        for (entity_key, changes) in pending {
            let changes = coalesce(changes);
            debug!(entity_key, changes = changes.len(), "flushing live query changes");
            if let Err(err) = self.notifier.item_changed(&entity_key, changes).await {
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Discards all buffered changes.
    pub fn rollback(mut self) {
        self.pending.clear();
    }
}

impl Drop for LiveQueryTransaction {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!(
                entities = self.pending.len(),
                "live query transaction dropped without commit"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingNotifier {
        calls: Mutex<Vec<(String, Vec<EntityChange>)>>,
    }

    #[async_trait]
    impl QueryNotifier for RecordingNotifier {
        async fn item_changed(&self, entity_key: &str, changes: Vec<EntityChange>) -> anyhow::Result<()> {
            self.calls.lock().push((entity_key.to_string(), changes));
            Ok(())
        }
    }

    #[test]
    fn coalesce_merges_pk_chain() {
        let merged = coalesce([
            EntityChange::updated("a", "b"),
            EntityChange::updated("b", "c"),
        ]);
        assert_eq!(merged, vec![EntityChange::updated("a", "c")]);
    }

    #[test]
    fn coalesce_latest_delete_wins() {
        let merged = coalesce([
            EntityChange::updated("a", "a"),
            EntityChange::deleted("a"),
            EntityChange::inserted("x"),
        ]);
        assert_eq!(
            merged,
            vec![EntityChange::deleted("a"), EntityChange::inserted("x")]
        );
    }

    #[test]
    fn coalesce_reinsert_after_delete_is_update() {
        let merged = coalesce([EntityChange::deleted("a"), EntityChange::inserted("a")]);
        assert_eq!(merged, vec![EntityChange::updated("a", "a")]);
    }

    #[test]
    fn coalesce_key_swap_keeps_both_rows() {
        let merged = coalesce([
            EntityChange::updated("a", "tmp"),
            EntityChange::updated("b", "a"),
            EntityChange::updated("tmp", "b"),
        ]);
        assert_eq!(
            merged,
            vec![EntityChange::updated("a", "b"), EntityChange::updated("b", "a")]
        );
    }

    #[tokio::test]
    async fn commit_flushes_once_per_entity() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut tx = LiveQueryTransaction::new(notifier.clone());
        tx.record("tasks", EntityChange::inserted("a"));
        tx.record("users", EntityChange::inserted("u"));
        tx.record("tasks", EntityChange::updated("b", "c"));
        tx.commit().await.unwrap();

        let calls = notifier.calls.lock();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0].0, "tasks");
        assert_eq!(calls[0].1.len(), 2);
        assert_eq!(calls[1].0, "users");
    }

    #[tokio::test]
    async fn rollback_and_drop_discard() {
        let notifier = Arc::new(RecordingNotifier::default());
        let mut tx = LiveQueryTransaction::new(notifier.clone());
        tx.record("tasks", EntityChange::inserted("a"));
        assert!(!tx.is_empty());
        tx.rollback();

        let mut tx = LiveQueryTransaction::new(notifier.clone());
        tx.record("tasks", EntityChange::inserted("b"));
        drop(tx);

        assert!(notifier.calls.lock().is_empty());
    }
}
