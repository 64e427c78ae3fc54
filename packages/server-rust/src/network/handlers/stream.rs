//! Push stream endpoints: the SSE stream itself, channel subscribe and
//! unsubscribe, and query keep-alive.
//!
//! A client opens `GET {prefix}/stream`; the first event (named
//! `connectionId`) carries the id it sends back in `X-Connection-Id` on every
//! other request. Each later event is a JSON `{channel, data}` frame.

use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::Json;
use futures_util::stream::{self, Stream};
use livesync_core::messages::{
    ChannelRequest, KeepAliveRequest, KeepAliveResponse, CONNECTION_ID_EVENT,
};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use super::{connection_id_from, ApiError, AppState, ClientConnection};
use crate::live_query::GcTask;
use crate::network::{ConnectionId, ConnectionRegistry, OutboundMessage};

// ---------------------------------------------------------------------------
// Stream
// ---------------------------------------------------------------------------

/// Removes the connection when its stream is dropped (client gone, idle
/// expiry, or shutdown) and asks the GC worker to drop its live queries.
struct StreamGuard {
    registry: Arc<ConnectionRegistry>,
    id: ConnectionId,
    gc: Option<mpsc::Sender<GcTask>>,
}

impl Drop for StreamGuard {
    fn drop(&mut self) {
        self.registry.remove(&self.id);
        if let Some(gc) = &self.gc {
            let task = GcTask::DropClient {
                client_id: self.id.to_string(),
            };
            if gc.try_send(task).is_err() {
                debug!(connection_id = %self.id, "gc queue unavailable, queries left to expiry");
            }
        }
        info!(connection_id = %self.id, "push stream closed");
    }
}

enum Phase {
    Greeting,
    Streaming,
}

struct StreamState {
    phase: Phase,
    rx: mpsc::Receiver<OutboundMessage>,
    shutdown: watch::Receiver<bool>,
    guard: StreamGuard,
}

impl StreamState {
    async fn next_event(mut self) -> Option<(Result<Event, Infallible>, Self)> {
        if matches!(self.phase, Phase::Greeting) {
            self.phase = Phase::Streaming;
            let event = Event::default()
                .event(CONNECTION_ID_EVENT)
                .data(self.guard.id.as_str());
            return Some((Ok(event), self));
        }

        loop {
            if *self.shutdown.borrow() {
                return None;
            }
            tokio::select! {
                message = self.rx.recv() => {
                    return match message {
                        Some(OutboundMessage::Event(text)) => {
                            Some((Ok(Event::default().data(&*text)), self))
                        }
                        Some(OutboundMessage::Close(reason)) => {
                            debug!(connection_id = %self.guard.id, ?reason, "closing push stream");
                            None
                        }
                        None => None,
                    };
                }
                changed = self.shutdown.changed() => {
                    if changed.is_err() {
                        return None;
                    }
                }
            }
        }
    }
}

/// Opens a push stream for a new connection.
///
/// # Errors
///
/// Returns [`ApiError::ShuttingDown`] while the server is not ready.
pub async fn stream_handler(
    State(state): State<AppState>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    if !state.shutdown.is_accepting() {
        return Err(ApiError::ShuttingDown);
    }

    let (handle, rx) = state.registry.register(&state.config.connection);
    let id = handle.id.clone();
    // The registry owns the sender; dropping the connection from it ends the
    // stream.
    drop(handle);
    info!(connection_id = %id, "push stream opened");

    let initial = StreamState {
        phase: Phase::Greeting,
        rx,
        shutdown: state.shutdown.shutdown_receiver(),
        guard: StreamGuard {
            registry: Arc::clone(&state.registry),
            id,
            gc: state.gc.clone(),
        },
    };
    let events = stream::unfold(initial, StreamState::next_event);

    Ok(Sse::new(events)
        .keep_alive(KeepAlive::new().interval(state.config.connection.sse_keep_alive_interval)))
}

// ---------------------------------------------------------------------------
// Channel subscriptions
// ---------------------------------------------------------------------------

/// Subscribes the caller's stream to a channel.
///
/// # Errors
///
/// Returns 404 if the connection is not open.
pub async fn subscribe_handler(
    State(state): State<AppState>,
    ClientConnection(id): ClientConnection,
    Json(request): Json<ChannelRequest>,
) -> Result<StatusCode, ApiError> {
    if !state.shutdown.is_accepting() {
        return Err(ApiError::ShuttingDown);
    }
    // The registration ends with an explicit unsubscribe or with the
    // connection, not with the returned handle.
    let _ = state.registry.subscribe(&id, &request.channel)?;
    debug!(connection_id = %id, channel = %request.channel, "channel subscribed");
    Ok(StatusCode::NO_CONTENT)
}

/// Releases one subscription of the caller's stream to a channel.
pub async fn unsubscribe_handler(
    State(state): State<AppState>,
    ClientConnection(id): ClientConnection,
    Json(request): Json<ChannelRequest>,
) -> StatusCode {
    state.registry.touch(&id);
    state.registry.unsubscribe(&id, &request.channel);
    StatusCode::NO_CONTENT
}

// ---------------------------------------------------------------------------
// Keep-alive
// ---------------------------------------------------------------------------

/// Refreshes the caller's live queries and returns the ids the server no
/// longer knows; the client re-subscribes those.
///
/// # Errors
///
/// Returns 503 if the query registry is unavailable.
pub async fn keep_alive_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(ids): Json<KeepAliveRequest>,
) -> Result<Json<KeepAliveResponse>, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    if let Some(id) = connection_id_from(&headers) {
        state.registry.touch(&id);
    }
    let unknown = state
        .publisher
        .storage()
        .keep_alive_and_return_unknown_query_ids(&ids)
        .await?;
    if !unknown.is_empty() {
        debug!(unknown = unknown.len(), "keep-alive reported unknown queries");
    }
    Ok(Json(unknown))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::body::Body;
    use axum::http::{Method, Request};
    use axum::routing::{get, post};
    use axum::Router;
    use futures_util::StreamExt;
    use livesync_core::messages::{ChannelEvent, CONNECTION_ID_HEADER};
    use livesync_core::{FindOptions, RequestContext};
    use serde_json::json;
    use tower::ServiceExt;

    use super::super::test_support::test_app;
    use super::*;
    use crate::live_query::{LiveQueryStorage, RegisteredQuery};

    fn router(state: AppState) -> Router {
        Router::new()
            .route("/stream", get(stream_handler))
            .route("/stream/subscribe", post(subscribe_handler))
            .route("/stream/unsubscribe", post(unsubscribe_handler))
            .route("/stream/keep-alive", post(keep_alive_handler))
            .with_state(state)
    }

    fn post_json(uri: &str, connection: Option<&str>, body: serde_json::Value) -> Request<Body> {
        let mut builder = Request::builder()
            .method(Method::POST)
            .uri(uri)
            .header("content-type", "application/json");
        if let Some(id) = connection {
            builder = builder.header(CONNECTION_ID_HEADER, id);
        }
        builder.body(Body::from(body.to_string())).unwrap()
    }

    /// Reads body chunks until one complete SSE frame (blank-line terminated)
    /// is buffered, skipping keep-alive comments.
    async fn next_frame(
        body: &mut (impl futures_util::Stream<Item = Result<axum::body::Bytes, axum::Error>> + Unpin),
        buffer: &mut String,
    ) -> Option<String> {
        loop {
            if let Some(end) = buffer.find("\n\n") {
                let frame: String = buffer.drain(..end + 2).collect();
                if frame.starts_with(':') {
                    continue;
                }
                return Some(frame);
            }
            let chunk = tokio::time::timeout(Duration::from_secs(2), body.next())
                .await
                .ok()??
                .ok()?;
            buffer.push_str(std::str::from_utf8(&chunk).unwrap());
        }
    }

    fn field<'a>(frame: &'a str, name: &str) -> Option<&'a str> {
        frame
            .lines()
            .find_map(|line| line.strip_prefix(name)?.strip_prefix(':'))
            .map(str::trim_start)
    }

    #[tokio::test]
    async fn stream_greets_then_delivers_channel_events() {
        let app = test_app();
        let registry = app.state.registry.clone();
        let request = Request::get("/stream").body(Body::empty()).unwrap();
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let mut body = response.into_body().into_data_stream();
        let mut buffer = String::new();
        let greeting = next_frame(&mut body, &mut buffer).await.unwrap();
        assert_eq!(field(&greeting, "event"), Some(CONNECTION_ID_EVENT));
        let id = field(&greeting, "data").unwrap().to_string();
        assert_eq!(registry.count(), 1);

        let status = router(app.state.clone())
            .oneshot(post_json("/stream/subscribe", Some(&id), json!({"channel": "q1"})))
            .await
            .unwrap()
            .status();
        assert_eq!(status, StatusCode::NO_CONTENT);

        registry.publish("q1", &json!({"type": "all", "data": []})).unwrap();
        let frame = next_frame(&mut body, &mut buffer).await.unwrap();
        let event: ChannelEvent = serde_json::from_str(field(&frame, "data").unwrap()).unwrap();
        assert_eq!(event.channel, "q1");
        assert_eq!(event.data, json!({"type": "all", "data": []}));
    }

    #[tokio::test]
    async fn dropping_stream_removes_connection() {
        let app = test_app();
        let registry = app.state.registry.clone();
        let request = Request::get("/stream").body(Body::empty()).unwrap();
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        let mut body = response.into_body().into_data_stream();
        let mut buffer = String::new();
        next_frame(&mut body, &mut buffer).await.unwrap();
        assert_eq!(registry.count(), 1);

        drop(body);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn shutdown_ends_stream() {
        let app = test_app();
        let request = Request::get("/stream").body(Body::empty()).unwrap();
        let response = router(app.state.clone()).oneshot(request).await.unwrap();
        let mut body = response.into_body().into_data_stream();
        let mut buffer = String::new();
        next_frame(&mut body, &mut buffer).await.unwrap();

        app.state.shutdown.trigger_shutdown();
        assert!(next_frame(&mut body, &mut buffer).await.is_none());
    }

    #[tokio::test]
    async fn draining_server_refuses_streams() {
        let app = test_app();
        app.state.shutdown.trigger_shutdown();
        let request = Request::get("/stream").body(Body::empty()).unwrap();
        let response = router(app.state).oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn subscribe_requires_known_connection() {
        let app = test_app();
        let missing = router(app.state.clone())
            .oneshot(post_json("/stream/subscribe", None, json!({"channel": "q1"})))
            .await
            .unwrap();
        assert_eq!(missing.status(), StatusCode::BAD_REQUEST);

        let unknown = router(app.state)
            .oneshot(post_json("/stream/subscribe", Some("nope"), json!({"channel": "q1"})))
            .await
            .unwrap();
        assert_eq!(unknown.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unsubscribe_releases_channel() {
        let app = test_app();
        let (handle, _rx) = app.state.registry.register(&app.state.config.connection);
        let id = handle.id.to_string();
        router(app.state.clone())
            .oneshot(post_json("/stream/subscribe", Some(&id), json!({"channel": "q1"})))
            .await
            .unwrap();
        assert_eq!(app.state.registry.subscribers("q1").len(), 1);

        let response = router(app.state.clone())
            .oneshot(post_json("/stream/unsubscribe", Some(&id), json!({"channel": "q1"})))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        assert!(app.state.registry.subscribers("q1").is_empty());
    }

    #[tokio::test]
    async fn keep_alive_returns_unknown_ids() {
        let app = test_app();
        let known = RegisteredQuery::new(
            RequestContext::new("c1", None),
            "tasks",
            FindOptions::default(),
            vec![],
        );
        app.storage.add(known.clone()).await.unwrap();

        let response = router(app.state)
            .oneshot(post_json(
                "/stream/keep-alive",
                Some("c1"),
                json!([known.id, "forgotten"]),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), 4096).await.unwrap();
        let unknown: Vec<String> = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(unknown, vec!["forgotten".to_string()]);
    }
}
