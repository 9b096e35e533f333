//! FileCache bus API
//!
//! This crate provides the command dispatcher that maps bus commands onto
//! the cache manager, and the Axum-based HTTP transport that carries those
//! commands, the server status query, health checks and metrics.

pub mod dispatcher;
pub mod error;
pub mod routes;
pub mod state;

pub use dispatcher::{Command, Dispatcher, Reply, SERVICE_VERSION};
pub use error::BusError;
pub use routes::create_router;
pub use state::{AppState, MetricsHandle};
