//! Live query subscriptions held by the client.
//!
//! A [`LiveQuery`] subscribes lazily: the first [`listen`](LiveQuery::listen)
//! call registers the query with the server, the drop of the last
//! [`ListenerGuard`] releases it after `unsubscribe_debounce`. While
//! subscribed, a task keeps the registration alive across reconnects and
//! server-side expiry; each re-subscribe waits for a fresh `all` before
//! incremental messages apply again.
//!
//! Handles with the same entity and options share one server-side query.
//! Each keeps its own cache, and the server query is released only when the
//! last of them tears down.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Weak};

use livesync_core::messages::{ChannelRequest, LiveQuerySubscribeRequest, LiveQuerySubscribeResponse};
use livesync_core::reducer::{row_order, IdFn, OrderFn};
use livesync_core::{
    live_query_id, FindOptions, LiveQueryChange, LiveQueryMessage, LiveQueryState, RowId, SyncState,
};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::ClientError;
use crate::stream::StreamClient;

/// Callback invoked after every applied live query message.
pub type Listener<T> = Arc<dyn Fn(&LiveQueryChange<T>) + Send + Sync>;

/// Bounds on rows a [`LiveQuery`] can hold.
pub trait LiveRow: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl<T> LiveRow for T where T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {}

impl StreamClient {
    /// A live query over `entity_key`, identified client-side by `id_of`.
    ///
    /// Nothing is sent until the first listener is attached.
    #[must_use]
    pub fn subscribe_live_query<T: LiveRow>(
        &self,
        entity_key: impl Into<String>,
        find_options: FindOptions,
        id_of: impl Fn(&T) -> RowId + Send + Sync + 'static,
    ) -> LiveQuery<T> {
        LiveQuery::new(self.clone(), entity_key.into(), find_options, None, Arc::new(id_of))
    }

    /// Like [`subscribe_live_query`](Self::subscribe_live_query), evaluated
    /// on behalf of `user_id`.
    #[must_use]
    pub fn subscribe_live_query_for_user<T: LiveRow>(
        &self,
        entity_key: impl Into<String>,
        find_options: FindOptions,
        user_id: impl Into<String>,
        id_of: impl Fn(&T) -> RowId + Send + Sync + 'static,
    ) -> LiveQuery<T> {
        LiveQuery::new(
            self.clone(),
            entity_key.into(),
            find_options,
            Some(user_id.into()),
            Arc::new(id_of),
        )
    }
}

// ---------------------------------------------------------------------------
// LiveQuery
// ---------------------------------------------------------------------------

/// Handle to one live query's cached result. Cheap to clone.
pub struct LiveQuery<T: LiveRow> {
    inner: Arc<Inner<T>>,
}

impl<T: LiveRow> Clone for LiveQuery<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct Inner<T: LiveRow> {
    client: StreamClient,
    entity_key: String,
    find_options: FindOptions,
    user_id: Option<String>,
    state: Mutex<LiveQueryState<T>>,
    listeners: Mutex<HashMap<u64, Listener<T>>>,
    next_listener: AtomicU64,
    lifecycle: Mutex<Lifecycle>,
}

/// Tasks and server-side handles of the current subscription.
#[derive(Default)]
struct Lifecycle {
    task: Option<JoinHandle<()>>,
    teardown: Option<JoinHandle<()>>,
    /// Channel and id of the installed event handler.
    handler: Option<(String, u64)>,
    /// Query id the server acknowledged.
    query_id: Option<String>,
    /// Signal this query holds `query_id` with on the client.
    resubscribe: Option<Arc<Notify>>,
}

impl<T: LiveRow> LiveQuery<T> {
    fn new(
        client: StreamClient,
        entity_key: String,
        find_options: FindOptions,
        user_id: Option<String>,
        id_of: IdFn<T>,
    ) -> Self {
        let state = LiveQueryState::new(id_of).with_order(order_for(&find_options));
        Self {
            inner: Arc::new(Inner {
                client,
                entity_key,
                find_options,
                user_id,
                state: Mutex::new(state),
                listeners: Mutex::new(HashMap::new()),
                next_listener: AtomicU64::new(0),
                lifecycle: Mutex::new(Lifecycle::default()),
            }),
        }
    }

    /// Current items; the `Arc` changes identity on every effective update.
    #[must_use]
    pub fn items(&self) -> Arc<Vec<T>> {
        self.inner.state.lock().items()
    }

    #[must_use]
    pub fn state(&self) -> SyncState {
        self.inner.state.lock().state()
    }

    #[must_use]
    pub fn entity_key(&self) -> &str {
        &self.inner.entity_key
    }

    /// Query id the server acknowledged, `None` while not subscribed.
    #[must_use]
    pub fn query_id(&self) -> Option<String> {
        self.inner.lifecycle.lock().query_id.clone()
    }

    /// Attaches a listener, subscribing if it is the first one.
    ///
    /// Must be called inside a Tokio runtime.
    #[must_use = "dropping the guard detaches the listener"]
    pub fn listen(
        &self,
        listener: impl Fn(&LiveQueryChange<T>) + Send + Sync + 'static,
    ) -> ListenerGuard<T> {
        let id = self.inner.next_listener.fetch_add(1, AtomicOrdering::Relaxed);
        self.inner.listeners.lock().insert(id, Arc::new(listener));

        let mut lifecycle = self.inner.lifecycle.lock();
        if let Some(teardown) = lifecycle.teardown.take() {
            debug!(entity_key = %self.inner.entity_key, "listener returned, teardown cancelled");
            teardown.abort();
        }
        if lifecycle.task.is_none() {
            lifecycle.task = Some(tokio::spawn(Arc::clone(&self.inner).run()));
        }
        drop(lifecycle);

        ListenerGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Number of attached listeners.
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.inner.listeners.lock().len()
    }
}

// ---------------------------------------------------------------------------
// ListenerGuard
// ---------------------------------------------------------------------------

/// Keeps a listener attached; the last guard dropped schedules the
/// unsubscribe.
pub struct ListenerGuard<T: LiveRow> {
    inner: Arc<Inner<T>>,
    id: u64,
}

impl<T: LiveRow> Drop for ListenerGuard<T> {
    fn drop(&mut self) {
        let empty = {
            let mut listeners = self.inner.listeners.lock();
            listeners.remove(&self.id);
            listeners.is_empty()
        };
        if empty {
            self.inner.schedule_teardown();
        }
    }
}

// ---------------------------------------------------------------------------
// Subscription task
// ---------------------------------------------------------------------------

impl<T: LiveRow> Inner<T> {
    async fn run(self: Arc<Self>) {
        let shared = Arc::clone(&self.client.shared);
        let mut connection = self.client.connection_events();
        let mut attempt: u32 = 0;

        loop {
            let current = match connection.wait_for(Option::is_some).await {
                Ok(id) => id.clone(),
                Err(_) => return,
            };
            let Some(connection_id) = current else {
                continue;
            };

            let expected = live_query_id(&connection_id, &self.entity_key, &self.find_options);
            // Installed before subscribing: the initial `all` may arrive on
            // the stream before the response does.
            self.install_handler(&expected);
            self.state.lock().begin();

            let resubscribe = Arc::new(Notify::new());
            match self.subscribe(&connection_id).await {
                Ok((query_id, items)) => {
                    attempt = 0;
                    if query_id != expected {
                        warn!(expected = %expected, query_id = %query_id, "server assigned a different query id");
                        self.install_handler(&query_id);
                    }
                    if self.state.lock().state() == SyncState::AwaitingInitial {
                        self.apply(LiveQueryMessage::All(items));
                    }
                    shared.hold_query(&query_id, Arc::clone(&resubscribe));
                    {
                        let mut lifecycle = self.lifecycle.lock();
                        lifecycle.query_id = Some(query_id.clone());
                        lifecycle.resubscribe = Some(Arc::clone(&resubscribe));
                    }

                    tokio::select! {
                        changed = connection.changed() => {
                            if changed.is_err() {
                                return;
                            }
                            debug!(query_id = %query_id, "connection changed, re-subscribing");
                        }
                        () = resubscribe.notified() => {}
                    }
                    shared.release_query(&query_id, &resubscribe);
                }
                Err(err) => {
                    warn!(entity_key = %self.entity_key, error = %err, attempt, "live query subscribe failed");
                    if !err.is_transient() {
                        return;
                    }
                    let delay = shared.config.reconnect_delay(attempt);
                    attempt = attempt.saturating_add(1);
                    tokio::select! {
                        () = tokio::time::sleep(delay) => {}
                        changed = connection.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        }
    }

    async fn subscribe(&self, connection_id: &str) -> Result<(String, Vec<T>), ClientError> {
        let request = LiveQuerySubscribeRequest {
            entity_key: self.entity_key.clone(),
            find_options: self.find_options.clone(),
            user_id: self.user_id.clone(),
        };
        let response: LiveQuerySubscribeResponse = self
            .client
            .shared
            .post_json("/live-query", Some(connection_id), &request)
            .await?;
        let items = response
            .items
            .into_iter()
            .map(serde_json::from_value)
            .collect::<Result<Vec<T>, _>>()?;
        Ok((response.query_id, items))
    }

    /// Routes events on `channel` into this query, replacing any earlier handler.
    fn install_handler(self: &Arc<Self>, channel: &str) {
        let weak: Weak<Self> = Arc::downgrade(self);
        let handler_id = self.client.shared.add_handler(
            channel,
            Arc::new(move |data: &serde_json::Value| {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                match serde_json::from_value::<LiveQueryMessage<T>>(data.clone()) {
                    Ok(message) => inner.apply(message),
                    Err(err) => warn!(error = %err, "undecodable live query message"),
                }
            }),
        );
        let previous = self
            .lifecycle
            .lock()
            .handler
            .replace((channel.to_string(), handler_id));
        if let Some((channel, id)) = previous {
            self.client.shared.remove_handler(&channel, id);
        }
    }

    /// Folds a message into the cache and notifies listeners once if it changed.
    fn apply(&self, message: LiveQueryMessage<T>) {
        let change = {
            let mut state = self.state.lock();
            if !state.apply(&message) {
                return;
            }
            LiveQueryChange::new(state.items(), message, state.id_fn(), state.order_fn())
        };
        let listeners: Vec<Listener<T>> = self.listeners.lock().values().cloned().collect();
        for listener in listeners {
            listener(&change);
        }
    }

    fn schedule_teardown(self: &Arc<Self>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            // No runtime left to run the delayed teardown on.
            self.release_local();
            return;
        };
        let inner = Arc::clone(self);
        let debounce = self.client.shared.config.unsubscribe_debounce;
        let task = runtime.spawn(async move {
            tokio::time::sleep(debounce).await;
            inner.teardown().await;
        });
        if let Some(previous) = self.lifecycle.lock().teardown.replace(task) {
            previous.abort();
        }
    }

    /// Stops the subscription task and drops local state; returns the query
    /// id to release on the server, if no other local query still holds it.
    fn release_local(&self) -> Option<String> {
        let (task, handler, query_id, resubscribe) = {
            let mut lifecycle = self.lifecycle.lock();
            if !self.listeners.lock().is_empty() {
                return None;
            }
            lifecycle.teardown = None;
            (
                lifecycle.task.take(),
                lifecycle.handler.take(),
                lifecycle.query_id.take(),
                lifecycle.resubscribe.take(),
            )
        };
        if let Some(task) = task {
            task.abort();
        }
        if let Some((channel, id)) = handler {
            self.client.shared.remove_handler(&channel, id);
        }
        self.state.lock().reset();
        let query_id = query_id?;
        let last = match &resubscribe {
            Some(resubscribe) => self.client.shared.release_query(&query_id, resubscribe),
            None => true,
        };
        if !last {
            debug!(query_id = %query_id, "live query still held by another handle");
            return None;
        }
        Some(query_id)
    }

    async fn teardown(&self) {
        let Some(query_id) = self.release_local() else {
            return;
        };
        let Some(connection_id) = self.client.connection_id() else {
            return;
        };
        debug!(query_id = %query_id, "unsubscribing live query");
        let body = ChannelRequest { channel: query_id };
        if let Err(err) = self
            .client
            .shared
            .post("/live-query/unsubscribe", Some(&connection_id), &body)
            .await
        {
            warn!(error = %err, "live query unsubscribe failed");
        }
    }
}

/// Client-side comparator following `orderBy`, evaluated on the rows' JSON form.
fn order_for<T: LiveRow>(options: &FindOptions) -> Option<OrderFn<T>> {
    let order = row_order(options)?;
    Some(Arc::new(move |a: &T, b: &T| {
        match (serde_json::to_value(a), serde_json::to_value(b)) {
            (Ok(a), Ok(b)) => order(&a, &b),
            _ => Ordering::Equal,
        }
    }))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use livesync_core::{Filter, OrderBy};
    use livesync_server::LiveQueryStorage;
    use serde::Deserialize;
    use serde_json::json;
    use tokio::sync::mpsc;

    use super::*;
    use crate::stream::test_server::TestServer;

    const WAIT: Duration = Duration::from_secs(5);

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        id: String,
        status: String,
        #[serde(default)]
        rank: i64,
    }

    fn task_id(task: &Task) -> RowId {
        task.id.clone()
    }

    fn open_tasks() -> FindOptions {
        FindOptions::filtered(Filter::eq("status", "open"))
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn initial_items_then_incremental_updates() {
        let server = TestServer::start().await;
        server.tasks.seed([json!({"id": "1", "status": "open"})]);
        let client = StreamClient::connect(server.client_config()).unwrap();
        let query = client.subscribe_live_query("tasks", open_tasks(), task_id);
        assert_eq!(query.state(), SyncState::Unsubscribed);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = query.listen(move |change: &LiveQueryChange<Task>| {
            let _ = tx.send(change.message.kind());
        });
        assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some("all"));
        assert_eq!(query.state(), SyncState::Synced);
        assert_eq!(query.items().len(), 1);

        server
            .tasks
            .insert(json!({"id": "2", "status": "open"}))
            .await
            .unwrap();
        assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some("add"));
        let ids: Vec<String> = query.items().iter().map(|t| t.id.clone()).collect();
        assert_eq!(ids, vec!["1", "2"]);

        server
            .tasks
            .update("1", json!({"id": "1", "status": "done"}))
            .await
            .unwrap();
        assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some("remove"));
        assert_eq!(query.items().len(), 1);
    }

    #[tokio::test]
    async fn ordered_query_stays_sorted() {
        let server = TestServer::start().await;
        server.tasks.seed([
            json!({"id": "a", "status": "open", "rank": 1}),
            json!({"id": "b", "status": "open", "rank": 3}),
        ]);
        let client = StreamClient::connect(server.client_config()).unwrap();
        let options = FindOptions {
            order_by: vec![OrderBy::asc("rank")],
            ..open_tasks()
        };
        let query = client.subscribe_live_query("tasks", options, task_id);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = query.listen(move |_: &LiveQueryChange<Task>| {
            let _ = tx.send(());
        });
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap();

        server
            .tasks
            .insert(json!({"id": "c", "status": "open", "rank": 2}))
            .await
            .unwrap();
        tokio::time::timeout(WAIT, rx.recv()).await.unwrap();
        let ranks: Vec<i64> = query.items().iter().map(|t| t.rank).collect();
        assert_eq!(ranks, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn last_listener_unsubscribes_after_debounce() {
        let server = TestServer::start().await;
        let mut config = server.client_config();
        config.unsubscribe_debounce = Duration::from_millis(50);
        let client = StreamClient::connect(config).unwrap();
        let query = client.subscribe_live_query("tasks", open_tasks(), task_id);

        let guard = query.listen(|_: &LiveQueryChange<Task>| {});
        wait_until(|| query.query_id().is_some()).await;
        let query_id = query.query_id().unwrap();
        assert!(server.storage.get(&query_id).await.unwrap().is_some());

        drop(guard);
        tokio::time::timeout(WAIT, async {
            while server.storage.get(&query_id).await.unwrap().is_some() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert_eq!(query.state(), SyncState::Unsubscribed);
        assert!(query.query_id().is_none());
        assert!(server.registry.subscribers(&query_id).is_empty());
    }

    #[tokio::test]
    async fn identical_queries_share_the_server_query() {
        let server = TestServer::start().await;
        let mut config = server.client_config();
        config.unsubscribe_debounce = Duration::from_millis(20);
        let client = StreamClient::connect(config).unwrap();
        let first = client.subscribe_live_query("tasks", open_tasks(), task_id);
        let second = client.subscribe_live_query("tasks", open_tasks(), task_id);

        let first_guard = first.listen(|_: &LiveQueryChange<Task>| {});
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _second_guard = second.listen(move |change: &LiveQueryChange<Task>| {
            let _ = tx.send(change.message.kind());
        });
        wait_until(|| first.query_id().is_some() && second.query_id().is_some()).await;
        let query_id = second.query_id().unwrap();
        assert_eq!(first.query_id(), Some(query_id.clone()));

        drop(first_guard);
        wait_until(|| first.query_id().is_none()).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(server.storage.get(&query_id).await.unwrap().is_some());
        assert_eq!(server.registry.subscribers(&query_id).len(), 1);

        while rx.try_recv().is_ok() {}
        server
            .tasks
            .insert(json!({"id": "9", "status": "open"}))
            .await
            .unwrap();
        assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some("add"));
        assert_eq!(second.items().len(), 1);
    }

    #[tokio::test]
    async fn relisten_within_debounce_keeps_subscription() {
        let server = TestServer::start().await;
        let mut config = server.client_config();
        config.unsubscribe_debounce = Duration::from_millis(200);
        let client = StreamClient::connect(config).unwrap();
        let query = client.subscribe_live_query("tasks", open_tasks(), task_id);

        let first = query.listen(|_: &LiveQueryChange<Task>| {});
        wait_until(|| query.query_id().is_some()).await;
        let query_id = query.query_id().unwrap();

        drop(first);
        let _second = query.listen(|_: &LiveQueryChange<Task>| {});
        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(query.query_id(), Some(query_id.clone()));
        assert!(server.storage.get(&query_id).await.unwrap().is_some());
        assert_eq!(query.listener_count(), 1);
    }

    #[tokio::test]
    async fn resubscribes_with_fresh_all_after_reconnect() {
        let server = TestServer::start().await;
        server.tasks.seed([json!({"id": "1", "status": "open"})]);
        let mut config = server.client_config();
        config.reconnect_initial_delay = Duration::from_millis(10);
        let client = StreamClient::connect(config).unwrap();
        let query = client.subscribe_live_query("tasks", open_tasks(), task_id);

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _guard = query.listen(move |change: &LiveQueryChange<Task>| {
            let _ = tx.send(change.message.kind());
        });
        assert_eq!(tokio::time::timeout(WAIT, rx.recv()).await.unwrap(), Some("all"));
        let first_id = query.query_id().unwrap();
        let first_connection = client.connection_id().unwrap();

        server
            .registry
            .remove(&livesync_server::network::ConnectionId(first_connection.clone()));
        // Changes made while disconnected arrive in the new `all`.
        server
            .tasks
            .insert(json!({"id": "2", "status": "open"}))
            .await
            .unwrap();

        wait_until(|| {
            query
                .query_id()
                .is_some_and(|id| id != first_id && query.state() == SyncState::Synced)
                && query.items().len() == 2
        })
        .await;
        assert_ne!(client.connection_id(), Some(first_connection));
    }

    #[tokio::test]
    async fn forgotten_query_is_resubscribed() {
        let server = TestServer::start().await;
        let client = StreamClient::connect(server.client_config()).unwrap();
        let query = client.subscribe_live_query("tasks", open_tasks(), task_id);
        let _guard = query.listen(|_: &LiveQueryChange<Task>| {});
        wait_until(|| query.query_id().is_some()).await;
        let query_id = query.query_id().unwrap();

        server.storage.remove(&query_id).await.unwrap();
        let connection_id = client.connection_id().unwrap();
        let unknown = crate::stream::keep_alive(&client.shared, &connection_id)
            .await
            .unwrap();
        assert_eq!(unknown, 1);

        tokio::time::timeout(WAIT, async {
            while server.storage.get(&query_id).await.unwrap().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn user_scoped_subscription_sends_user_id() {
        let server = TestServer::start().await;
        let client = StreamClient::connect(server.client_config()).unwrap();
        let query = client.subscribe_live_query_for_user("tasks", open_tasks(), "u1", task_id);
        let _guard = query.listen(|_: &LiveQueryChange<Task>| {});
        wait_until(|| query.query_id().is_some()).await;

        let stored = server
            .storage
            .get(&query.query_id().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.user_id.as_deref(), Some("u1"));
    }

    #[test]
    fn order_for_uses_json_form() {
        let options = FindOptions {
            order_by: vec![OrderBy::desc("rank")],
            ..FindOptions::default()
        };
        let order = order_for::<Task>(&options).unwrap();
        let low = Task {
            id: "a".into(),
            status: "open".into(),
            rank: 1,
        };
        let high = Task { rank: 5, ..low.clone() };
        assert_eq!(order(&high, &low), Ordering::Less);
        assert!(order_for::<Task>(&FindOptions::default()).is_none());
    }
}
