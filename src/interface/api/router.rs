//! API Router configuration

use super::metrics_handler::metrics_handler;
use super::relay::{relay_router, RelayState};
use axum::{extract::State, routing::get, Json, Router};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Build the relay server router
pub fn build_router(relay: Arc<RelayState>, prometheus_handle: PrometheusHandle) -> Router {
    // Health check route
    let health_routes = Router::new()
        .route("/health", get(health_check))
        .with_state(relay.clone());

    // Metrics route (separate state)
    let metrics_routes = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(prometheus_handle);

    Router::new()
        .merge(health_routes)
        .merge(metrics_routes)
        .merge(relay_router(relay))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http())
}

/// Health check handler
async fn health_check(State(relay): State<Arc<RelayState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "yaktalk",
        "online_users": relay.online_count().await,
    }))
}
