//! Client-side incremental reducer for live query results.
//!
//! Folds `all` / `add` / `replace` / `remove` messages into a cached array
//! without touching unaffected rows. Every effective change yields a fresh
//! `Arc<Vec<T>>`, so consumers using reference equality observe exactly one
//! update per applied message; no-op messages keep the previous `Arc`.

use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

use crate::messages::LiveQueryMessage;
use crate::query::{compare_rows, FindOptions};
use crate::types::{Row, RowId};

/// Extracts a row's id on the client.
pub type IdFn<T> = Arc<dyn Fn(&T) -> RowId + Send + Sync>;

/// Client-side ordering applied after each message.
pub type OrderFn<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync>;

/// Lifecycle of a client subscription.
///
/// `Unsubscribed -> AwaitingInitial -> Synced`. An `all` message is accepted
/// in any state and moves to `Synced`; incremental messages are only
/// accepted once `Synced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    Unsubscribed,
    AwaitingInitial,
    Synced,
}

/// Applies one message to `prev`, returning `None` when nothing changes.
fn try_reduce<T: Clone>(
    prev: &[T],
    message: &LiveQueryMessage<T>,
    id_of: &(dyn Fn(&T) -> RowId + Send + Sync),
) -> Option<Vec<T>> {
    match message {
        LiveQueryMessage::All(rows) => Some(rows.clone()),
        LiveQueryMessage::Add(row) => {
            let id = id_of(row);
            if prev.iter().any(|x| id_of(x) == id) {
                return None;
            }
            let mut next = Vec::with_capacity(prev.len() + 1);
            next.extend_from_slice(prev);
            next.push(row.clone());
            Some(next)
        }
        LiveQueryMessage::Replace(payload) => {
            let mut next = prev.to_vec();
            match next.iter().position(|x| id_of(x) == payload.old_id) {
                Some(pos) => {
                    let new_id = id_of(&payload.item);
                    next[pos] = payload.item.clone();
                    if new_id != payload.old_id {
                        // A stale copy under the new id would now be a duplicate.
                        let mut index = 0;
                        next.retain(|x| {
                            let keep = index == pos || id_of(x) != new_id;
                            index += 1;
                            keep
                        });
                    }
                }
                None => {
                    // Delivery is at-most-once, so the row may never have
                    // arrived; the new id must still not appear twice.
                    let new_id = id_of(&payload.item);
                    match next.iter().position(|x| id_of(x) == new_id) {
                        Some(pos) => next[pos] = payload.item.clone(),
                        None => next.push(payload.item.clone()),
                    }
                }
            }
            Some(next)
        }
        LiveQueryMessage::Remove(payload) => {
            let pos = prev.iter().position(|x| id_of(x) == payload.id)?;
            let mut next = prev.to_vec();
            next.remove(pos);
            Some(next)
        }
    }
}

/// Pure `(prev) -> next` form of the reducer.
#[must_use]
pub fn reduce<T: Clone>(
    prev: &[T],
    message: &LiveQueryMessage<T>,
    id_of: &(dyn Fn(&T) -> RowId + Send + Sync),
) -> Vec<T> {
    try_reduce(prev, message, id_of).unwrap_or_else(|| prev.to_vec())
}

/// Id extractor for JSON rows keyed by `field`.
///
/// String ids are used verbatim; any other JSON value uses its JSON text.
#[must_use]
pub fn row_id_field(field: impl Into<String>) -> IdFn<Row> {
    let field = field.into();
    Arc::new(move |row: &Row| match row.get(&field) {
        Some(serde_json::Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    })
}

/// Comparator for JSON rows following the query's `orderBy`, if any.
#[must_use]
pub fn row_order(options: &FindOptions) -> Option<OrderFn<Row>> {
    if options.order_by.is_empty() {
        return None;
    }
    let order_by = options.order_by.clone();
    Some(Arc::new(move |a: &Row, b: &Row| compare_rows(&order_by, a, b)))
}

// ---------------------------------------------------------------------------
// LiveQueryState
// ---------------------------------------------------------------------------

/// Cached result of one live query plus its sync state.
pub struct LiveQueryState<T> {
    items: Arc<Vec<T>>,
    state: SyncState,
    id_of: IdFn<T>,
    order: Option<OrderFn<T>>,
}

impl<T> fmt::Debug for LiveQueryState<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryState")
            .field("len", &self.items.len())
            .field("state", &self.state)
            .field("ordered", &self.order.is_some())
            .finish()
    }
}

impl<T: Clone> LiveQueryState<T> {
    /// Creates an empty, unsubscribed state.
    #[must_use]
    pub fn new(id_of: IdFn<T>) -> Self {
        Self {
            items: Arc::new(Vec::new()),
            state: SyncState::Unsubscribed,
            id_of,
            order: None,
        }
    }

    /// Re-sorts items with `order` after every applied message.
    #[must_use]
    pub fn with_order(mut self, order: Option<OrderFn<T>>) -> Self {
        self.order = order;
        self
    }

    /// Marks a (re)subscribe: incremental messages are ignored until the next `all`.
    pub fn begin(&mut self) {
        self.state = SyncState::AwaitingInitial;
    }

    /// Marks the subscription as released. Cached items are kept as-is.
    pub fn reset(&mut self) {
        self.state = SyncState::Unsubscribed;
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.state
    }

    /// Current items; the `Arc` changes identity on every effective update.
    #[must_use]
    pub fn items(&self) -> Arc<Vec<T>> {
        Arc::clone(&self.items)
    }

    #[must_use]
    pub fn id_fn(&self) -> IdFn<T> {
        Arc::clone(&self.id_of)
    }

    #[must_use]
    pub fn order_fn(&self) -> Option<OrderFn<T>> {
        self.order.clone()
    }

    /// Folds one message into the cache.
    ///
    /// Returns `true` when the cached array changed.
    pub fn apply(&mut self, message: &LiveQueryMessage<T>) -> bool {
        let accepted = matches!(message, LiveQueryMessage::All(_))
            || self.state == SyncState::Synced;
        if !accepted {
            tracing::debug!(
                kind = message.kind(),
                state = ?self.state,
                "ignoring incremental live query message before initial sync"
            );
            return false;
        }
        if matches!(message, LiveQueryMessage::All(_)) {
            self.state = SyncState::Synced;
        }
        let Some(mut next) = try_reduce(&self.items, message, self.id_of.as_ref()) else {
            return false;
        };
        if let Some(order) = &self.order {
            next.sort_by(|a, b| order(a, b));
        }
        self.items = Arc::new(next);
        true
    }
}

/// Notification handed to listeners after an applied message.
pub struct LiveQueryChange<T> {
    /// Items after the message was applied.
    pub items: Arc<Vec<T>>,
    /// The message that was applied.
    pub message: LiveQueryMessage<T>,
    id_of: IdFn<T>,
    order: Option<OrderFn<T>>,
}

impl<T: Clone> LiveQueryChange<T> {
    #[must_use]
    pub fn new(
        items: Arc<Vec<T>>,
        message: LiveQueryMessage<T>,
        id_of: IdFn<T>,
        order: Option<OrderFn<T>>,
    ) -> Self {
        Self {
            items,
            message,
            id_of,
            order,
        }
    }

    /// Reducer form for consumers that keep their own copy of the state.
    #[must_use]
    pub fn apply_to(&self, prev: &[T]) -> Vec<T> {
        let mut next = reduce(prev, &self.message, self.id_of.as_ref());
        if let Some(order) = &self.order {
            next.sort_by(|a, b| order(a, b));
        }
        next
    }
}

impl<T: Clone> Clone for LiveQueryChange<T> {
    fn clone(&self) -> Self {
        Self {
            items: Arc::clone(&self.items),
            message: self.message.clone(),
            id_of: Arc::clone(&self.id_of),
            order: self.order.clone(),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for LiveQueryChange<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LiveQueryChange")
            .field("items", &self.items)
            .field("message", &self.message)
            .finish_non_exhaustive()
    }
}
