//! The four-variant live query diff message and its routing envelope.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{Row, RowId};

/// Payload of a `replace` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub struct ReplacePayload<T = Row> {
    /// Id the client currently holds for the row.
    pub old_id: RowId,
    /// The row's new API JSON (possibly under a new id).
    pub item: T,
}

/// Payload of a `remove` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemovePayload {
    pub id: RowId,
}

/// Minimal patch that moves a client-held result set to the server's state.
///
/// Wire form: `{"type": "all" | "add" | "replace" | "remove", "data": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "lowercase")]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
pub enum LiveQueryMessage<T = Row> {
    /// Full resync of the result set.
    All(Vec<T>),
    /// A row that now matches and previously did not.
    Add(T),
    /// A row that still matches but changed payload or primary key.
    Replace(ReplacePayload<T>),
    /// A row that stopped matching.
    Remove(RemovePayload),
}

impl<T> LiveQueryMessage<T> {
    /// Wire discriminator of this message.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::All(_) => "all",
            Self::Add(_) => "add",
            Self::Replace(_) => "replace",
            Self::Remove(_) => "remove",
        }
    }

    #[must_use]
    pub fn replace(old_id: impl Into<RowId>, item: T) -> Self {
        Self::Replace(ReplacePayload {
            old_id: old_id.into(),
            item,
        })
    }

    #[must_use]
    pub fn remove(id: impl Into<RowId>) -> Self {
        Self::Remove(RemovePayload { id: id.into() })
    }
}

/// A diff message together with its routing metadata.
///
/// The transport delivers only `message` on the channel named by `query_id`;
/// the client already knows which query owns the channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelEnvelope {
    /// Connection that owns the query.
    pub client_id: String,
    /// Registered query id; doubles as the channel key.
    pub query_id: String,
    pub message: LiveQueryMessage,
}

impl ChannelEnvelope {
    /// Strips routing metadata, yielding what the client reducer consumes.
    #[must_use]
    pub fn into_message(self) -> LiveQueryMessage {
        self.message
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn all_wire_shape() {
        let msg: LiveQueryMessage = LiveQueryMessage::All(vec![json!({"id": "a"})]);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "all", "data": [{"id": "a"}]})
        );
    }

    #[test]
    fn add_wire_shape() {
        let msg: LiveQueryMessage = LiveQueryMessage::Add(json!({"id": "d"}));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "add", "data": {"id": "d"}})
        );
    }

    #[test]
    fn replace_wire_shape() {
        let msg: LiveQueryMessage = LiveQueryMessage::replace("a1", json!({"id": "a2"}));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "replace", "data": {"oldId": "a1", "item": {"id": "a2"}}})
        );
    }

    #[test]
    fn remove_parses_from_wire() {
        let msg: LiveQueryMessage =
            serde_json::from_value(json!({"type": "remove", "data": {"id": "a"}})).unwrap();
        assert_eq!(msg, LiveQueryMessage::remove("a"));
        assert_eq!(msg.kind(), "remove");
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Task {
        id: String,
        title: String,
    }

    #[test]
    fn typed_rows_deserialize() {
        let msg: LiveQueryMessage<Task> = serde_json::from_value(json!({
            "type": "add",
            "data": {"id": "t1", "title": "Ship"}
        }))
        .unwrap();
        assert_eq!(
            msg,
            LiveQueryMessage::Add(Task {
                id: "t1".to_string(),
                title: "Ship".to_string()
            })
        );
    }

    #[test]
    fn envelope_strips_routing() {
        let env = ChannelEnvelope {
            client_id: "c1".to_string(),
            query_id: "q1".to_string(),
            message: LiveQueryMessage::remove("a"),
        };
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["clientId"], "c1");
        assert_eq!(json["queryId"], "q1");
        assert_eq!(env.into_message(), LiveQueryMessage::remove("a"));
    }
}
