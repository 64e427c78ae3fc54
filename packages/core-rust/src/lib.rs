//! livesync core: live query messages, find options, collaborator traits,
//! and the client-side incremental reducer.

pub mod clock;
pub mod context;
pub mod messages;
pub mod query;
pub mod reducer;
pub mod traits;
pub mod types;

pub use clock::{ClockSource, ManualClock, SystemClock};
pub use context::RequestContext;
pub use messages::{ChannelEnvelope, LiveQueryMessage, RemovePayload, ReplacePayload};
pub use query::{live_query_id, Filter, FilterError, FindOptions, OrderBy, SortDirection};
pub use reducer::{LiveQueryChange, LiveQueryState, SyncState};
pub use traits::{QueryNotifier, Repository, RepositoryProvider};
pub use types::{EntityChange, Row, RowId};
