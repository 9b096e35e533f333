//! Application state

use filecache_core::CacheManager;
use metrics_exporter_prometheus::PrometheusHandle;
use std::sync::Arc;

use crate::dispatcher::Dispatcher;

/// Handle used to render the Prometheus exposition
pub type MetricsHandle = PrometheusHandle;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<CacheManager>,
    pub dispatcher: Arc<Dispatcher>,
    /// Bus name this service answers to
    pub service_name: Arc<str>,
}

impl AppState {
    pub fn new(cache: Arc<CacheManager>, service_name: &str) -> Self {
        Self {
            dispatcher: Arc::new(Dispatcher::new(cache.clone())),
            cache,
            service_name: Arc::from(service_name),
        }
    }
}
