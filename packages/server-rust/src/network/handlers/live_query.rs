//! Live query subscribe and unsubscribe endpoints.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::Json;
use livesync_core::messages::{
    ChannelRequest, LiveQuerySubscribeRequest, LiveQuerySubscribeResponse,
};
use livesync_core::RequestContext;
use tracing::{debug, warn};

use super::{ApiError, AppState, ClientConnection};
use crate::live_query::{live_query_id, LiveQueryError};

const REQUEST_ID_HEADER: &str = "x-request-id";

/// Registers a live query for the caller's connection and returns its id and
/// initial rows. The same rows are pushed as an `all` message on the query's
/// channel, which the caller's stream is subscribed to before the query is
/// registered.
///
/// # Errors
///
/// Returns 404 if the connection is not open on this server, 503 if the
/// query registry is unavailable, and 500 if the repository fails.
pub async fn live_query_subscribe_handler(
    State(state): State<AppState>,
    ClientConnection(connection): ClientConnection,
    headers: HeaderMap,
    Json(request): Json<LiveQuerySubscribeRequest>,
) -> Result<Json<LiveQuerySubscribeResponse>, ApiError> {
    if !state.shutdown.is_accepting() {
        return Err(ApiError::ShuttingDown);
    }
    let _guard = state.shutdown.in_flight_guard();

    let mut ctx = RequestContext::new(connection.as_str(), request.user_id);
    if let Some(trace_id) = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        ctx.trace_id = trace_id.to_string();
    }

    let repository = state
        .publisher
        .repositories()
        .repository(&request.entity_key, &ctx)
        .await
        .map_err(|source| LiveQueryError::Repository {
            entity_key: request.entity_key.clone(),
            source,
        })?;

    // Re-subscribing the same query keeps the single channel reference the
    // connection already holds.
    let channel = live_query_id(connection.as_str(), &request.entity_key, &request.find_options);
    let subscribed = state.local_push && state.registry.subscribe_once(&connection, &channel)?;

    let defined = state
        .publisher
        .define_live_query_channel(ctx, &request.entity_key, request.find_options, &*repository)
        .await;
    match defined {
        Ok((query_id, items)) => Ok(Json(LiveQuerySubscribeResponse { query_id, items })),
        Err(err) => {
            if subscribed {
                state.registry.unsubscribe(&connection, &channel);
            }
            Err(err.into())
        }
    }
}

/// Stops one of the caller's live queries and unsubscribes its channel.
///
/// Queries owned by another connection are left registered; only the
/// caller's own channel subscription is released.
///
/// # Errors
///
/// Returns 503 if the query registry is unavailable.
pub async fn live_query_unsubscribe_handler(
    State(state): State<AppState>,
    ClientConnection(connection): ClientConnection,
    Json(request): Json<ChannelRequest>,
) -> Result<StatusCode, ApiError> {
    let _guard = state.shutdown.in_flight_guard();
    let query_id = request.channel;

    if state.local_push {
        state.registry.touch(&connection);
        state.registry.unsubscribe(&connection, &query_id);
    }

    match state.publisher.storage().get(&query_id).await? {
        Some(query) if query.owner_client_id == connection.as_str() => {
            state.publisher.stop_live_query(&query_id).await?;
        }
        Some(query) => {
            warn!(
                query_id = %query_id,
                owner = %query.owner_client_id,
                caller = %connection,
                "refusing to stop a live query owned by another connection"
            );
        }
        None => debug!(query_id = %query_id, "stop for unknown live query"),
    }
    Ok(StatusCode::NO_CONTENT)
}
