//! livesync client: push stream connection, channel subscriptions, and
//! live queries kept in sync with the server.
//!
//! ```no_run
//! # async fn demo() -> Result<(), livesync_client::ClientError> {
//! use livesync_client::{ClientConfig, StreamClient};
//! use livesync_core::{Filter, FindOptions, Row};
//!
//! let client = StreamClient::connect(ClientConfig::new("http://localhost:8080"))?;
//! let open = client.subscribe_live_query::<Row>(
//!     "tasks",
//!     FindOptions::filtered(Filter::eq("status", "open")),
//!     |row| row["id"].to_string(),
//! );
//! let _guard = open.listen(|change| println!("{} rows", change.items.len()));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod live_query;
pub mod sse;
pub mod stream;

pub use config::ClientConfig;
pub use error::ClientError;
pub use live_query::{ListenerGuard, LiveQuery, LiveRow};
pub use stream::{ChannelSubscription, StreamClient};
