//! The push stream connection and its channel multiplexer.
//!
//! One [`StreamClient`] holds one SSE stream to the server. A background
//! task keeps it open:
//!
//! 1. `GET {prefix}/stream`; the first event carries the connection id
//! 2. every later event is a `{channel, data}` frame, routed to the
//!    handlers registered for `channel`
//! 3. on disconnect, reconnects with exponential backoff and jitter
//! 4. on every (re)connect, re-subscribes all generic channels; live
//!    queries watch [`StreamClient::connection_events`] and re-subscribe
//!    themselves
//!
//! A second task posts keep-alives for the live queries this client holds
//! and tells each query the server no longer knows to re-subscribe.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use futures_util::StreamExt;
use livesync_core::messages::{
    ChannelEvent, ChannelRequest, KeepAliveResponse, CONNECTION_ID_EVENT, CONNECTION_ID_HEADER,
};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ClientConfig;
use crate::error::ClientError;
use crate::sse::SseParser;

/// Callback receiving the `data` of every event on a channel.
pub type ChannelHandler = Arc<dyn Fn(&serde_json::Value) + Send + Sync>;

// ---------------------------------------------------------------------------
// Shared state
// ---------------------------------------------------------------------------

pub(crate) struct Shared {
    pub(crate) config: ClientConfig,
    http: reqwest::Client,
    connection: watch::Sender<Option<String>>,
    handlers: DashMap<String, HashMap<u64, ChannelHandler>>,
    /// Channels subscribed through `/stream/subscribe`, with reference counts.
    generic: DashMap<String, usize>,
    /// Live query ids held by this client, with the signal of every local
    /// query that holds them. Identical queries share one server id.
    held_queries: DashMap<String, Vec<Arc<Notify>>>,
    next_handler: AtomicU64,
    closed: watch::Sender<bool>,
}

impl Shared {
    pub(crate) fn connection_id(&self) -> Option<String> {
        self.connection.borrow().clone()
    }

    pub(crate) fn connection_events(&self) -> watch::Receiver<Option<String>> {
        self.connection.subscribe()
    }

    pub(crate) fn add_handler(&self, channel: &str, handler: ChannelHandler) -> u64 {
        let id = self.next_handler.fetch_add(1, Ordering::Relaxed);
        self.handlers
            .entry(channel.to_string())
            .or_default()
            .insert(id, handler);
        id
    }

    pub(crate) fn remove_handler(&self, channel: &str, id: u64) {
        if let Some(mut handlers) = self.handlers.get_mut(channel) {
            handlers.remove(&id);
        }
        self.handlers.remove_if(channel, |_, handlers| handlers.is_empty());
    }

    pub(crate) fn hold_query(&self, query_id: &str, resubscribe: Arc<Notify>) {
        let mut holders = self.held_queries.entry(query_id.to_string()).or_default();
        if !holders.iter().any(|held| Arc::ptr_eq(held, &resubscribe)) {
            holders.push(resubscribe);
        }
    }

    /// Drops one holder of `query_id`. Returns `true` if no other local
    /// query still holds it.
    pub(crate) fn release_query(&self, query_id: &str, resubscribe: &Arc<Notify>) -> bool {
        if let Some(mut holders) = self.held_queries.get_mut(query_id) {
            holders.retain(|held| !Arc::ptr_eq(held, resubscribe));
        }
        self.held_queries
            .remove_if(query_id, |_, holders| holders.is_empty());
        !self.held_queries.contains_key(query_id)
    }

    fn dispatch(&self, event: &ChannelEvent) {
        // Handlers run outside the map lock; they may (un)register handlers.
        let handlers: Vec<ChannelHandler> = match self.handlers.get(&event.channel) {
            Some(handlers) => handlers.values().cloned().collect(),
            None => {
                debug!(channel = %event.channel, "event for channel without handlers");
                return;
            }
        };
        for handler in handlers {
            handler(&event.data);
        }
    }

    /// POSTs `body` to an API route, failing on non-success statuses.
    pub(crate) async fn post(
        &self,
        path: &str,
        connection_id: Option<&str>,
        body: &impl Serialize,
    ) -> Result<reqwest::Response, ClientError> {
        let mut request = self
            .http
            .post(self.config.endpoint(path))
            .timeout(self.config.request_timeout)
            .json(body);
        if let Some(id) = connection_id {
            request = request.header(CONNECTION_ID_HEADER, id);
        }
        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::Status(status.as_u16()));
        }
        Ok(response)
    }

    pub(crate) async fn post_json<R: DeserializeOwned>(
        &self,
        path: &str,
        connection_id: Option<&str>,
        body: &impl Serialize,
    ) -> Result<R, ClientError> {
        let bytes = self.post(path, connection_id, body).await?.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    async fn subscribe_remote(&self, connection_id: &str, channel: &str) -> Result<(), ClientError> {
        let body = ChannelRequest {
            channel: channel.to_string(),
        };
        self.post("/stream/subscribe", Some(connection_id), &body)
            .await
            .map(drop)
    }

    async fn unsubscribe_remote(&self, connection_id: &str, channel: &str) -> Result<(), ClientError> {
        let body = ChannelRequest {
            channel: channel.to_string(),
        };
        self.post("/stream/unsubscribe", Some(connection_id), &body)
            .await
            .map(drop)
    }
}

// ---------------------------------------------------------------------------
// StreamClient
// ---------------------------------------------------------------------------

/// Handle to the push stream. Cheap to clone; the stream closes when
/// [`close`](Self::close) is called or the last clone is dropped.
#[derive(Clone)]
pub struct StreamClient {
    pub(crate) shared: Arc<Shared>,
    _tasks: Arc<TaskSet>,
}

struct TaskSet(Vec<JoinHandle<()>>);

impl Drop for TaskSet {
    fn drop(&mut self) {
        for task in &self.0 {
            task.abort();
        }
    }
}

impl StreamClient {
    /// Starts connecting in the background. Use
    /// [`wait_connected`](Self::wait_connected) to wait for the stream.
    ///
    /// Must be called inside a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Http`] if the HTTP client cannot be built.
    pub fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .connect_timeout(config.request_timeout)
            .build()?;
        let (connection, _) = watch::channel(None);
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            config,
            http,
            connection,
            handlers: DashMap::new(),
            generic: DashMap::new(),
            held_queries: DashMap::new(),
            next_handler: AtomicU64::new(0),
            closed,
        });

        let tasks = vec![
            tokio::spawn(run_stream(Arc::downgrade(&shared))),
            tokio::spawn(run_keep_alive(Arc::downgrade(&shared))),
        ];
        Ok(Self {
            shared,
            _tasks: Arc::new(TaskSet(tasks)),
        })
    }

    /// Current connection id, `None` while (re)connecting.
    #[must_use]
    pub fn connection_id(&self) -> Option<String> {
        self.shared.connection_id()
    }

    /// Receiver of connection id changes (`None` on disconnect).
    #[must_use]
    pub fn connection_events(&self) -> watch::Receiver<Option<String>> {
        self.shared.connection_events()
    }

    /// Waits until the stream is open and returns its connection id.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::NotConnected`] on timeout and
    /// [`ClientError::Closed`] if the client is closed meanwhile.
    pub async fn wait_connected(&self, timeout: std::time::Duration) -> Result<String, ClientError> {
        let mut events = self.connection_events();
        let waited = tokio::time::timeout(timeout, events.wait_for(Option::is_some)).await;
        match waited {
            Ok(Ok(id)) => id.clone().ok_or(ClientError::NotConnected),
            Ok(Err(_)) => Err(ClientError::Closed),
            Err(_) => Err(ClientError::NotConnected),
        }
    }

    /// Registers `handler` for `channel` and subscribes the stream to it.
    ///
    /// The subscription survives reconnects. If the stream is not open yet,
    /// the server-side subscription is made once it is.
    ///
    /// # Errors
    ///
    /// Returns an error if the server rejects the subscription; the local
    /// registration is rolled back.
    pub async fn subscribe_channel(
        &self,
        channel: &str,
        handler: impl Fn(&serde_json::Value) + Send + Sync + 'static,
    ) -> Result<ChannelSubscription, ClientError> {
        let handler_id = self.shared.add_handler(channel, Arc::new(handler));
        let first = {
            let mut count = self.shared.generic.entry(channel.to_string()).or_insert(0);
            *count += 1;
            *count == 1
        };
        let subscription = ChannelSubscription {
            shared: Arc::downgrade(&self.shared),
            channel: channel.to_string(),
            handler_id,
            released: false,
        };

        if first {
            if let Some(connection_id) = self.connection_id() {
                self.shared.subscribe_remote(&connection_id, channel).await?;
            }
        }
        Ok(subscription)
    }

    /// Stops reconnecting and closes the stream.
    pub fn close(&self) {
        self.shared.closed.send_replace(true);
        self.shared.connection.send_replace(None);
    }
}

// ---------------------------------------------------------------------------
// ChannelSubscription
// ---------------------------------------------------------------------------

/// A generic channel subscription; unsubscribes when dropped.
pub struct ChannelSubscription {
    shared: Weak<Shared>,
    channel: String,
    handler_id: u64,
    released: bool,
}

impl ChannelSubscription {
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Unsubscribes and waits for the server to acknowledge.
    ///
    /// # Errors
    ///
    /// Returns an error if the unsubscribe request fails. The local handler
    /// is removed either way.
    pub async fn unsubscribe(mut self) -> Result<(), ClientError> {
        self.released = true;
        let Some(shared) = self.shared.upgrade() else {
            return Ok(());
        };
        match release_generic(&shared, &self.channel, self.handler_id) {
            Some(connection_id) => shared.unsubscribe_remote(&connection_id, &self.channel).await,
            None => Ok(()),
        }
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let Some(connection_id) = release_generic(&shared, &self.channel, self.handler_id) else {
            return;
        };
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            runtime.spawn(async move {
                if let Err(err) = shared.unsubscribe_remote(&connection_id, &channel).await {
                    debug!(channel = %channel, error = %err, "channel unsubscribe failed");
                }
            });
        }
    }
}

/// Drops one generic reference. Returns the connection id to unsubscribe
/// with when it was the last one and the stream is open.
fn release_generic(shared: &Shared, channel: &str, handler_id: u64) -> Option<String> {
    shared.remove_handler(channel, handler_id);
    let last = {
        let mut entry = shared.generic.get_mut(channel)?;
        *entry = entry.saturating_sub(1);
        *entry == 0
    };
    if !last {
        return None;
    }
    shared.generic.remove_if(channel, |_, count| *count == 0);
    shared.connection_id()
}

// ---------------------------------------------------------------------------
// Background tasks
// ---------------------------------------------------------------------------

async fn run_stream(shared: Weak<Shared>) {
    let mut attempt: u32 = 0;
    loop {
        let Some(strong) = shared.upgrade() else {
            return;
        };
        if *strong.closed.borrow() {
            return;
        }
        let mut closed = strong.closed.subscribe();

        let outcome = tokio::select! {
            outcome = read_stream(&strong, &mut attempt) => outcome,
            _ = closed.changed() => return,
        };
        strong.connection.send_replace(None);
        match outcome {
            Ok(()) => info!("push stream ended, reconnecting"),
            Err(err) => warn!(error = %err, attempt, "push stream failed"),
        }

        let delay = strong.config.reconnect_delay(attempt);
        attempt = attempt.saturating_add(1);
        drop(strong);
        tokio::select! {
            () = tokio::time::sleep(delay) => {}
            _ = closed.changed() => return,
        }
    }
}

/// Reads one stream until it ends. Resets `attempt` once connected.
async fn read_stream(shared: &Arc<Shared>, attempt: &mut u32) -> Result<(), ClientError> {
    let response = shared
        .http
        .get(shared.config.endpoint("/stream"))
        .header(reqwest::header::ACCEPT, "text/event-stream")
        .send()
        .await?;
    if !response.status().is_success() {
        return Err(ClientError::Status(response.status().as_u16()));
    }

    let mut body = response.bytes_stream();
    let mut parser = SseParser::new();
    while let Some(chunk) = body.next().await {
        for event in parser.push(&chunk?) {
            if event.event.as_deref() == Some(CONNECTION_ID_EVENT) {
                *attempt = 0;
                on_connected(shared, event.data);
                continue;
            }
            match serde_json::from_str::<ChannelEvent>(&event.data) {
                Ok(event) => shared.dispatch(&event),
                Err(err) => warn!(error = %err, "undecodable push event"),
            }
        }
    }
    Ok(())
}

fn on_connected(shared: &Arc<Shared>, connection_id: String) {
    info!(connection_id = %connection_id, "push stream connected");
    // Publish the id first: a channel added after this point subscribes itself.
    shared.connection.send_replace(Some(connection_id.clone()));
    let channels: Vec<String> = shared.generic.iter().map(|e| e.key().clone()).collect();

    if channels.is_empty() {
        return;
    }
    let shared = Arc::clone(shared);
    tokio::spawn(async move {
        for channel in channels {
            if let Err(err) = shared.subscribe_remote(&connection_id, &channel).await {
                warn!(channel = %channel, error = %err, "re-subscribe after connect failed");
            }
        }
    });
}

async fn run_keep_alive(shared: Weak<Shared>) {
    let Some(interval) = shared.upgrade().map(|s| s.config.keep_alive_interval) else {
        return;
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(strong) = shared.upgrade() else {
            return;
        };
        if *strong.closed.borrow() {
            return;
        }
        // Sent even without queries: it also keeps the stream from idling out.
        let Some(connection_id) = strong.connection_id() else {
            continue;
        };
        if let Err(err) = keep_alive(&strong, &connection_id).await {
            warn!(error = %err, "keep-alive failed");
        }
    }
}

/// Posts the held query ids and signals every query the server dropped.
pub(crate) async fn keep_alive(shared: &Shared, connection_id: &str) -> Result<usize, ClientError> {
    let ids: Vec<String> = shared.held_queries.iter().map(|e| e.key().clone()).collect();
    let unknown: KeepAliveResponse = shared
        .post_json("/stream/keep-alive", Some(connection_id), &ids)
        .await?;
    for id in &unknown {
        if let Some((_, holders)) = shared.held_queries.remove(id) {
            debug!(query_id = %id, holders = holders.len(), "server forgot live query, re-subscribing");
            for resubscribe in holders {
                resubscribe.notify_one();
            }
        }
    }
    Ok(unknown.len())
}

#[cfg(test)]
pub(crate) mod test_server {
    use std::sync::Arc;

    use livesync_server::live_query::{LiveQueryPublisher, MemoryLiveQueryStorage};
    use livesync_server::network::{LiveQueryWiring, NetworkConfig, NetworkModule};
    use livesync_server::repository::{MemoryRepository, MemoryRepositoryProvider};
    use livesync_server::LiveQueryConfig;
    use tokio::sync::oneshot;

    use crate::config::ClientConfig;

    /// A livesync server on an ephemeral local port.
    pub(crate) struct TestServer {
        pub base_url: String,
        pub tasks: Arc<MemoryRepository>,
        pub storage: Arc<MemoryLiveQueryStorage>,
        pub registry: Arc<livesync_server::ConnectionRegistry>,
        stop: Option<oneshot::Sender<()>>,
    }

    impl TestServer {
        pub(crate) async fn start() -> Self {
            let config = NetworkConfig {
                host: "127.0.0.1".to_string(),
                port: 0,
                ..NetworkConfig::default()
            };
            let mut module = NetworkModule::new(config);
            let storage = Arc::new(MemoryLiveQueryStorage::new());
            let provider = Arc::new(MemoryRepositoryProvider::new("id"));
            let tasks = provider.entity("tasks");
            let publisher = Arc::new(LiveQueryPublisher::new(
                storage.clone(),
                module.registry(),
                provider.clone(),
                LiveQueryConfig::default(),
            ));
            provider.set_notifier(publisher.clone());
            module.attach_live_queries(LiveQueryWiring {
                publisher,
                gc: None,
                local_push: true,
            });
            let registry = module.registry();
            let port = module.start().await.unwrap();

            let (stop, stopped) = oneshot::channel::<()>();
            tokio::spawn(module.serve(async move {
                let _ = stopped.await;
            }));

            Self {
                base_url: format!("http://127.0.0.1:{port}"),
                tasks,
                storage,
                registry,
                stop: Some(stop),
            }
        }

        pub(crate) fn client_config(&self) -> ClientConfig {
            ClientConfig::new(self.base_url.clone())
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            if let Some(stop) = self.stop.take() {
                let _ = stop.send(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio::sync::mpsc;

    use super::test_server::TestServer;
    use super::*;
    use livesync_server::network::ConnectionId;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn connects_and_learns_connection_id() {
        let server = TestServer::start().await;
        let client = StreamClient::connect(server.client_config()).unwrap();
        let id = client.wait_connected(WAIT).await.unwrap();
        assert_eq!(client.connection_id(), Some(id.clone()));
        assert!(server.registry.get(&ConnectionId(id)).is_some());
    }

    #[tokio::test]
    async fn channel_events_reach_handler() {
        let server = TestServer::start().await;
        let client = StreamClient::connect(server.client_config()).unwrap();
        client.wait_connected(WAIT).await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = client
            .subscribe_channel("news", move |data| {
                let _ = tx.send(data.clone());
            })
            .await
            .unwrap();

        server.registry.publish("news", &json!({"n": 1})).unwrap();
        let data = tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap();
        assert_eq!(data, json!({"n": 1}));
    }

    #[tokio::test]
    async fn subscription_made_before_connect_is_applied_on_connect() {
        let server = TestServer::start().await;
        let client = StreamClient::connect(server.client_config()).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _subscription = client
            .subscribe_channel("early", move |data| {
                let _ = tx.send(data.clone());
            })
            .await
            .unwrap();
        client.wait_connected(WAIT).await.unwrap();

        // The re-subscribe runs right after the connection id arrives.
        for _ in 0..100 {
            if !server.registry.subscribers("early").is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        server.registry.publish("early", &json!("hi")).unwrap();
        assert_eq!(
            tokio::time::timeout(WAIT, rx.recv()).await.unwrap().unwrap(),
            json!("hi")
        );
    }

    #[tokio::test]
    async fn unsubscribe_releases_server_channel() {
        let server = TestServer::start().await;
        let client = StreamClient::connect(server.client_config()).unwrap();
        client.wait_connected(WAIT).await.unwrap();

        let subscription = client.subscribe_channel("c", |_| {}).await.unwrap();
        assert_eq!(server.registry.subscribers("c").len(), 1);
        subscription.unsubscribe().await.unwrap();
        assert!(server.registry.subscribers("c").is_empty());
    }

    #[tokio::test]
    async fn reconnects_with_new_connection_id() {
        let server = TestServer::start().await;
        let mut config = server.client_config();
        config.reconnect_initial_delay = Duration::from_millis(10);
        let client = StreamClient::connect(config).unwrap();
        let first = client.wait_connected(WAIT).await.unwrap();

        let mut events = client.connection_events();
        server.registry.remove(&ConnectionId(first.clone()));
        let second = tokio::time::timeout(WAIT, async {
            loop {
                events.changed().await.unwrap();
                if let Some(id) = events.borrow().clone() {
                    if id != first {
                        return id;
                    }
                }
            }
        })
        .await
        .unwrap();
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn keep_alive_reports_forgotten_queries() {
        let server = TestServer::start().await;
        let client = StreamClient::connect(server.client_config()).unwrap();
        let id = client.wait_connected(WAIT).await.unwrap();

        let notify = Arc::new(Notify::new());
        client.shared.hold_query("gone", notify.clone());
        let unknown = keep_alive(&client.shared, &id).await.unwrap();
        assert_eq!(unknown, 1);
        tokio::time::timeout(WAIT, notify.notified()).await.unwrap();
        assert!(client.shared.held_queries.is_empty());
    }

    #[tokio::test]
    async fn query_holds_are_reference_counted() {
        let server = TestServer::start().await;
        let client = StreamClient::connect(server.client_config()).unwrap();
        let id = client.wait_connected(WAIT).await.unwrap();

        let first = Arc::new(Notify::new());
        let second = Arc::new(Notify::new());
        client.shared.hold_query("q1", first.clone());
        client.shared.hold_query("q1", first.clone());
        client.shared.hold_query("q1", second.clone());
        assert!(!client.shared.release_query("q1", &first));
        assert!(client.shared.held_queries.contains_key("q1"));

        client.shared.hold_query("q1", first.clone());
        keep_alive(&client.shared, &id).await.unwrap();
        tokio::time::timeout(WAIT, first.notified()).await.unwrap();
        tokio::time::timeout(WAIT, second.notified()).await.unwrap();
        assert!(client.shared.release_query("q1", &second));
    }

    #[tokio::test]
    async fn close_stops_reconnecting() {
        let server = TestServer::start().await;
        let client = StreamClient::connect(server.client_config()).unwrap();
        client.wait_connected(WAIT).await.unwrap();
        client.close();
        assert!(client.connection_id().is_none());

        for _ in 0..300 {
            if server.registry.count() == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(server.registry.count(), 0);
    }
}
