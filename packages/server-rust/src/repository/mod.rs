//! Built-in entity repositories.
//!
//! Production deployments plug their own data-access layer in through
//! [`RepositoryProvider`](livesync_core::RepositoryProvider); the in-memory
//! implementation here backs the standalone server and the tests.

pub mod memory;

pub use memory::{MemoryRepository, MemoryRepositoryProvider};
