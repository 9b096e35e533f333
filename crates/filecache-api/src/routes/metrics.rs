//! Prometheus metrics endpoint

use axum::{Router, extract::State, response::IntoResponse, routing::get};
use filecache_core::CacheManager;
use metrics::{describe_counter, describe_gauge, gauge};
use std::sync::Arc;

use crate::state::MetricsHandle;

#[derive(Clone)]
struct MetricsState {
    handle: Arc<MetricsHandle>,
    cache: Arc<CacheManager>,
}

/// Create metrics routes with the Prometheus handle
///
/// Cache totals are sampled into gauges on every scrape.
pub fn routes(handle: Arc<MetricsHandle>, cache: Arc<CacheManager>) -> Router {
    Router::new()
        .route("/metrics", get(get_metrics))
        .with_state(MetricsState { handle, cache })
}

/// Register help texts for the metrics the service records
pub fn describe_metrics() {
    describe_counter!("filecache_bus_calls_total", "Bus commands handled");
    describe_counter!("filecache_objects_inserted_total", "Objects inserted");
    describe_counter!(
        "filecache_objects_evicted_total",
        "Objects whose files were reclaimed by eviction"
    );
    describe_counter!(
        "filecache_objects_expired_total",
        "Subscribed objects expired by eviction"
    );
    describe_counter!("filecache_objects_deleted_total", "Objects deleted on request");
    describe_counter!("filecache_copies_total", "Completed copy-outs");
    describe_counter!("filecache_copy_failures_total", "Failed or timed out copy-outs");
    describe_counter!("filecache_health_checks_total", "Health checks served");
    describe_gauge!("filecache_type_usage_bytes", "Bytes reserved per cache type");
    describe_gauge!("filecache_types", "Defined cache types");
    describe_gauge!("filecache_objects", "Cached objects");
    describe_gauge!("filecache_usage_bytes", "Bytes reserved by all cached objects");
    describe_gauge!(
        "filecache_avail_bytes",
        "Low watermark space not yet used by any type"
    );
}

/// GET /metrics - Prometheus metrics endpoint
async fn get_metrics(State(state): State<MetricsState>) -> impl IntoResponse {
    record_cache_totals(&state.cache);
    state.handle.render()
}

fn record_cache_totals(cache: &CacheManager) {
    let status = cache.cache_status();
    gauge!("filecache_types").set(status.num_types as f64);
    gauge!("filecache_objects").set(status.num_objects as f64);
    gauge!("filecache_usage_bytes").set(status.size as f64);
    gauge!("filecache_avail_bytes").set(status.avail_space as f64);
}
