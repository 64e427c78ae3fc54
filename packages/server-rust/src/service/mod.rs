//! Server services outside the HTTP layer: configuration and background work.

pub mod config;
pub mod worker;

pub use config::{LiveQueryConfig, ServerConfig};
pub use worker::{BackgroundRunnable, BackgroundWorker};
