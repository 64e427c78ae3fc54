//! HTTP surface: configuration, push connections, handlers, middleware,
//! shutdown control, and the server lifecycle.

pub mod config;
pub mod connection;
pub mod handlers;
pub mod middleware;
pub mod module;
pub mod shutdown;

pub use config::*;
pub use connection::*;
pub use handlers::{ApiError, AppState};
pub use module::{LiveQueryWiring, NetworkModule};
pub use shutdown::*;
