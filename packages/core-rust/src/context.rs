use serde::{Deserialize, Serialize};

/// Serializable per-request context stored alongside every registered live query.
///
/// Any server process can rebuild a request-scoped repository (with the same
/// user and prefilters) from this value, which is what lets a process other
/// than the one that accepted the subscription re-evaluate the query.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestContext {
    /// Transport connection that owns the subscription.
    pub client_id: String,
    /// Authenticated user, if any.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub user_id: Option<String>,
    /// Distributed trace identifier for observability.
    #[serde(default)]
    pub trace_id: String,
}

impl RequestContext {
    /// Creates a context for the given connection and optional user.
    #[must_use]
    pub fn new(client_id: impl Into<String>, user_id: Option<String>) -> Self {
        Self {
            client_id: client_id.into(),
            user_id,
            trace_id: String::new(),
        }
    }
}
