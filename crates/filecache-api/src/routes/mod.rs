//! API routes

pub mod bus;
mod health;
pub mod metrics;

use axum::Router;
use std::sync::Arc;

use crate::state::{AppState, MetricsHandle};

/// Create the main router
pub fn create_router(state: AppState, metrics_handle: Option<Arc<MetricsHandle>>) -> Router {
    let cache = state.cache.clone();
    let mut router = Router::new()
        // Health check
        .merge(health::routes())
        // Bus commands and server status query
        .merge(bus::routes())
        .with_state(state);

    // Add metrics endpoint if handle is provided
    if let Some(handle) = metrics_handle {
        router = router.merge(metrics::routes(handle, cache));
    }

    router
}
