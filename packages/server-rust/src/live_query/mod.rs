//! Live queries: registry, diff publisher, transaction batching, and GC.
//!
//! A client subscribes through [`LiveQueryPublisher::define_live_query_channel`],
//! which stores a [`RegisteredQuery`] and sends the initial result. From then
//! on, every committed mutation reaches the publisher through
//! [`QueryNotifier::item_changed`](livesync_core::QueryNotifier::item_changed)
//! and is turned into `add` / `replace` / `remove` messages on the query's
//! channel.

pub mod error;
pub mod gc;
pub mod publisher;
pub mod storage;
pub mod transaction;

pub use error::{LiveQueryError, RegistryError};
pub use gc::{GcTask, LiveQueryGc, SweepReport};
pub use publisher::LiveQueryPublisher;
pub use storage::{live_query_id, LiveQueryStorage, MemoryLiveQueryStorage, RegisteredQuery};
#[cfg(feature = "postgres")]
pub use storage::PostgresLiveQueryStorage;
#[cfg(feature = "redb")]
pub use storage::RedbLiveQueryStorage;
pub use transaction::{coalesce, LiveQueryTransaction};
