//! Health check endpoints

use axum::{Json, Router, extract::State, routing::get};
use serde::Serialize;

use crate::state::AppState;

/// Health status response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub service_name: String,
    pub num_types: u64,
    pub num_objects: u64,
    /// Bytes reserved by all cached objects
    pub size: u64,
}

/// Health check handler
///
/// Reads the published per-type totals only, so it answers while types
/// are locked.
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    metrics::counter!("filecache_health_checks_total").increment(1);

    let status = state.cache.cache_status();
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        service_name: state.service_name.to_string(),
        num_types: status.num_types,
        num_objects: status.num_objects,
        size: status.size,
    })
}

/// Create health routes
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use filecache_core::{CacheConfig, CacheManager};
    use filecache_storage::LocalObjectStore;
    use serde_json::Value;
    use std::sync::Arc;
    use tempfile::TempDir;
    use tower::ServiceExt;

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let response = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn test_health_reports_cache_totals() {
        let dir = TempDir::new().unwrap();
        let storage = LocalObjectStore::new(dir.path().join("cache")).await.unwrap();
        let config = CacheConfig {
            default_download_dir: dir.path().join("downloads"),
            ..CacheConfig::default()
        };
        let cache = Arc::new(CacheManager::open(Arc::new(storage), config).await.unwrap());
        cache.define_type("docs", 0, 1000, 0).await.unwrap();
        cache.insert("docs", "a", 100, false).await.unwrap();
        cache.insert("docs", "b", 50, false).await.unwrap();

        let app = routes().with_state(AppState::new(cache, "com.palm.filecache"));
        for uri in ["/health", "/healthz"] {
            let (status, body) = get_json(app.clone(), uri).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(body["status"], "healthy");
            assert_eq!(body["version"], env!("CARGO_PKG_VERSION"));
            assert_eq!(body["serviceName"], "com.palm.filecache");
            assert_eq!(body["numTypes"], 1);
            assert_eq!(body["numObjects"], 2);
            assert_eq!(body["size"], 150);
        }
    }
}
