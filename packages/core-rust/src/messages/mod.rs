//! Wire message types for live queries and the push stream.
//!
//! All structs use `#[serde(rename_all = "camelCase")]` so the JSON produced
//! here matches what browser clients send and expect.

pub mod live_query;
pub mod stream;

pub use live_query::*;
pub use stream::*;
