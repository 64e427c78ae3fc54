//! Push-stream connection management for the livesync server.
//!
//! Every client process holds one SSE stream. This module tracks those
//! streams, multiplexes named channels over them with reference-counted
//! subscriptions, and provides per-connection backpressure via bounded mpsc
//! channels. Lock-free concurrent tracking uses `DashMap`.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use livesync_core::clock::is_expired;
use livesync_core::messages::ChannelEvent;
use livesync_core::{ClockSource, SystemClock};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, warn};

use super::config::ConnectionConfig;
use crate::transport::{SubscriptionServer, TransportError};

/// Unique identifier for a push connection (UUID v4 text on the wire).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub String);

impl ConnectionId {
    #[must_use]
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConnectionId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Message queued for the SSE write loop of one connection.
#[derive(Debug, Clone)]
pub enum OutboundMessage {
    /// JSON-encoded [`ChannelEvent`], shared across all recipients.
    Event(Arc<str>),
    /// Ends the stream with an optional reason.
    Close(Option<String>),
}

/// Mutable metadata associated with a connection.
#[derive(Debug)]
pub struct ConnectionMetadata {
    /// Subscribed channels with their reference counts.
    pub channels: HashMap<String, usize>,
    /// Last time (ms since epoch) any request touched this connection.
    pub last_activity: u64,
}

/// Handle to a single push connection.
///
/// The receiver end of `tx` is held by the SSE response stream.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub tx: mpsc::Sender<OutboundMessage>,
    pub metadata: Mutex<ConnectionMetadata>,
    pub connected_at: Instant,
}

impl ConnectionHandle {
    /// Attempts to enqueue a message without blocking.
    ///
    /// Returns `true` if the message was enqueued, `false` if the queue is
    /// full or the stream has been closed.
    #[must_use]
    pub fn try_send(&self, msg: OutboundMessage) -> bool {
        self.tx.try_send(msg).is_ok()
    }

    /// Checks whether the stream is still open.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Channels this connection is subscribed to.
    #[must_use]
    pub fn channels(&self) -> Vec<String> {
        self.metadata.lock().channels.keys().cloned().collect()
    }
}

/// Registration of one connection on one channel.
///
/// Dropping the handle keeps the registration; call
/// [`unsubscribe`](Self::unsubscribe) to release it.
#[derive(Debug)]
pub struct ChannelSubscription {
    registry: Weak<ConnectionRegistry>,
    connection_id: ConnectionId,
    channel: String,
}

impl ChannelSubscription {
    #[must_use]
    pub fn channel(&self) -> &str {
        &self.channel
    }

    /// Releases this registration (one reference).
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            registry.unsubscribe(&self.connection_id, &self.channel);
        }
    }
}

/// Thread-safe registry of push connections and their channels.
pub struct ConnectionRegistry {
    connections: DashMap<ConnectionId, Arc<ConnectionHandle>>,
    channels: DashMap<String, HashSet<ConnectionId>>,
    clock: Arc<dyn ClockSource>,
}

impl fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("connections", &self.connections.len())
            .field("channels", &self.channels.len())
            .finish_non_exhaustive()
    }
}

impl ConnectionRegistry {
    /// Creates a new empty registry using the system clock.
    #[must_use]
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    #[must_use]
    pub fn with_clock(clock: Arc<dyn ClockSource>) -> Self {
        Self {
            connections: DashMap::new(),
            channels: DashMap::new(),
            clock,
        }
    }

    /// Opens a new connection, returning its handle and the outbound receiver.
    ///
    /// The receiver should be drained by the SSE response stream.
    pub fn register(
        &self,
        config: &ConnectionConfig,
    ) -> (Arc<ConnectionHandle>, mpsc::Receiver<OutboundMessage>) {
        let id = ConnectionId::generate();
        let (tx, rx) = mpsc::channel(config.outbound_channel_capacity);

        let handle = Arc::new(ConnectionHandle {
            id: id.clone(),
            tx,
            metadata: Mutex::new(ConnectionMetadata {
                channels: HashMap::new(),
                last_activity: self.clock.now(),
            }),
            connected_at: Instant::now(),
        });

        self.connections.insert(id, Arc::clone(&handle));
        metrics::gauge!("livesync_connections").increment(1.0);
        (handle, rx)
    }

    /// Removes a connection and all of its channel registrations.
    pub fn remove(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(id)?;
        let channels: Vec<String> = handle.metadata.lock().channels.drain().map(|(c, _)| c).collect();
        for channel in channels {
            self.detach(&channel, id);
        }
        metrics::gauge!("livesync_connections").decrement(1.0);
        debug!(connection_id = %id, "connection removed");
        Some(handle)
    }

    /// Looks up a connection by ID.
    pub fn get(&self, id: &ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(id).map(|r| r.value().clone())
    }

    /// Returns the total number of open connections.
    #[must_use]
    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Number of channels with at least one subscriber.
    #[must_use]
    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Records activity on a connection. Returns `false` for unknown ids.
    pub fn touch(&self, id: &ConnectionId) -> bool {
        match self.get(id) {
            Some(handle) => {
                handle.metadata.lock().last_activity = self.clock.now();
                true
            }
            None => false,
        }
    }

    /// Subscribes a connection to a channel.
    ///
    /// Repeated subscriptions of the same connection to the same channel are
    /// reference-counted; each returned handle releases one reference.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownConnection`] if the connection is not
    /// open (the client should reconnect and re-subscribe).
    pub fn subscribe(
        self: &Arc<Self>,
        id: &ConnectionId,
        channel: &str,
    ) -> Result<ChannelSubscription, TransportError> {
        let handle = self
            .get(id)
            .ok_or_else(|| TransportError::UnknownConnection(id.to_string()))?;
        {
            let mut meta = handle.metadata.lock();
            *meta.channels.entry(channel.to_string()).or_insert(0) += 1;
            meta.last_activity = self.clock.now();
        }
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id.clone());

        Ok(ChannelSubscription {
            registry: Arc::downgrade(self),
            connection_id: id.clone(),
            channel: channel.to_string(),
        })
    }

    /// Subscribes a connection to a channel unless it already holds it.
    ///
    /// Returns `true` if this call added the reference. Unlike
    /// [`subscribe`](Self::subscribe), repeated calls never stack
    /// references, so one [`unsubscribe`](Self::unsubscribe) releases the
    /// channel.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::UnknownConnection`] if the connection is not
    /// open.
    pub fn subscribe_once(&self, id: &ConnectionId, channel: &str) -> Result<bool, TransportError> {
        let handle = self
            .get(id)
            .ok_or_else(|| TransportError::UnknownConnection(id.to_string()))?;
        {
            let mut meta = handle.metadata.lock();
            meta.last_activity = self.clock.now();
            if meta.channels.contains_key(channel) {
                return Ok(false);
            }
            meta.channels.insert(channel.to_string(), 1);
        }
        self.channels
            .entry(channel.to_string())
            .or_default()
            .insert(id.clone());
        Ok(true)
    }

    /// Releases one subscription reference. No-op if absent.
    pub fn unsubscribe(&self, id: &ConnectionId, channel: &str) {
        let Some(handle) = self.get(id) else {
            self.detach(channel, id);
            return;
        };
        let released = {
            let mut meta = handle.metadata.lock();
            match meta.channels.get_mut(channel) {
                Some(count) if *count > 1 => {
                    *count -= 1;
                    false
                }
                Some(_) => {
                    meta.channels.remove(channel);
                    true
                }
                None => false,
            }
        };
        if released {
            self.detach(channel, id);
        }
    }

    fn detach(&self, channel: &str, id: &ConnectionId) {
        if let Some(mut subscribers) = self.channels.get_mut(channel) {
            subscribers.remove(id);
        }
        self.channels.remove_if(channel, |_, subscribers| subscribers.is_empty());
    }

    /// Connections currently subscribed to `channel`.
    #[must_use]
    pub fn subscribers(&self, channel: &str) -> Vec<ConnectionId> {
        self.channels
            .get(channel)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Enqueues an event for every subscriber of `channel`.
    ///
    /// Never blocks: a full queue drops the event for that subscriber, and a
    /// closed stream is removed from the registry. Returns how many
    /// connections accepted the event.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Encode`] if the payload cannot be encoded.
    pub fn publish(&self, channel: &str, data: &serde_json::Value) -> Result<usize, TransportError> {
        let subscribers = self.subscribers(channel);
        if subscribers.is_empty() {
            return Ok(0);
        }

        let event = ChannelEvent {
            channel: channel.to_string(),
            data: data.clone(),
        };
        let encoded: Arc<str> = serde_json::to_string(&event)?.into();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for id in subscribers {
            let Some(handle) = self.get(&id) else {
                self.detach(channel, &id);
                continue;
            };
            match handle.tx.try_send(OutboundMessage::Event(Arc::clone(&encoded))) {
                Ok(()) => delivered += 1,
                Err(TrySendError::Full(_)) => {
                    metrics::counter!("livesync_transport_dropped_total").increment(1);
                    warn!(connection_id = %id, channel, "outbound queue full, dropping event");
                }
                Err(TrySendError::Closed(_)) => dead.push(id),
            }
        }

        for id in dead {
            debug!(connection_id = %id, "stream closed, removing connection");
            self.remove(&id);
        }
        Ok(delivered)
    }

    /// Closes and removes connections idle for longer than `idle_timeout`.
    pub fn expire_idle(&self, idle_timeout: Duration) -> Vec<ConnectionId> {
        let now = self.clock.now();
        let expired: Vec<ConnectionId> = self
            .connections
            .iter()
            .filter(|entry| is_expired(entry.value().metadata.lock().last_activity, now, idle_timeout))
            .map(|entry| entry.key().clone())
            .collect();

        for id in &expired {
            if let Some(handle) = self.remove(id) {
                let _ = handle.try_send(OutboundMessage::Close(Some("idle timeout".to_string())));
            }
        }
        expired
    }

    /// Removes and returns all connections. Used during graceful shutdown.
    pub fn drain_all(&self) -> Vec<Arc<ConnectionHandle>> {
        let keys: Vec<ConnectionId> = self
            .connections
            .iter()
            .map(|entry| entry.key().clone())
            .collect();

        keys.iter().filter_map(|key| self.remove(key)).collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SubscriptionServer for ConnectionRegistry {
    async fn publish_message(
        &self,
        channel: &str,
        message: &serde_json::Value,
    ) -> Result<(), TransportError> {
        self.publish(channel, message)?;
        Ok(())
    }
}
