//! Row, id, and mutation-notification types shared by server and client.

use serde::{Deserialize, Serialize};

/// A single entity row as it travels over the wire (API JSON form).
pub type Row = serde_json::Value;

/// Stringified primary key of a row, as computed by `Repository::get_id`.
pub type RowId = String;

/// One row-level change reported by the CRUD layer after a commit.
///
/// `old_id` equals `id` unless the primary key itself was changed. For inserts
/// both carry the new id; for deletes both carry the id of the removed row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EntityChange {
    /// Id of the row after the mutation.
    pub id: RowId,
    /// Id of the row before the mutation.
    pub old_id: RowId,
    /// Whether the row no longer exists.
    pub deleted: bool,
}

impl EntityChange {
    /// A newly inserted row.
    #[must_use]
    pub fn inserted(id: impl Into<RowId>) -> Self {
        let id = id.into();
        Self {
            old_id: id.clone(),
            id,
            deleted: false,
        }
    }

    /// An updated row, possibly with a changed primary key.
    #[must_use]
    pub fn updated(old_id: impl Into<RowId>, id: impl Into<RowId>) -> Self {
        Self {
            id: id.into(),
            old_id: old_id.into(),
            deleted: false,
        }
    }

    /// A deleted row.
    #[must_use]
    pub fn deleted(id: impl Into<RowId>) -> Self {
        let id = id.into();
        Self {
            old_id: id.clone(),
            id,
            deleted: true,
        }
    }

    /// Whether this change moved the row to a new primary key.
    #[must_use]
    pub fn id_changed(&self) -> bool {
        self.id != self.old_id
    }
}
