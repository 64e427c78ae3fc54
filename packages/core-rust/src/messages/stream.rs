//! Request and frame types of the push-stream HTTP surface.

use serde::{Deserialize, Serialize};

use crate::query::FindOptions;
use crate::types::Row;

/// Header carrying the caller's transport connection id.
pub const CONNECTION_ID_HEADER: &str = "x-connection-id";

/// SSE event name of the first frame on every stream; its data is the connection id.
pub const CONNECTION_ID_EVENT: &str = "connectionId";

/// One delivered event on the push stream: a payload tagged with its channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEvent {
    pub channel: String,
    pub data: serde_json::Value,
}

/// Body of the subscribe / unsubscribe endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelRequest {
    pub channel: String,
}

/// Body of the keep-alive endpoint: query ids the client still holds.
pub type KeepAliveRequest = Vec<String>;

/// Body of the keep-alive response: ids the server no longer recognizes.
pub type KeepAliveResponse = Vec<String>;

/// Body of the live query subscribe endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQuerySubscribeRequest {
    pub entity_key: String,
    #[serde(default)]
    pub find_options: FindOptions,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
}

/// Response of the live query subscribe endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveQuerySubscribeResponse {
    /// Channel the query's diff messages are published on.
    pub query_id: String,
    /// Result set at registration time (also pushed as an `all` message).
    pub items: Vec<Row>,
}
