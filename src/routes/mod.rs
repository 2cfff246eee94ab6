pub mod health;
pub mod metrics;
pub mod tasks;

use axum::routing::{get, post};
use axum::Router;
use tower_http::compression::CompressionLayer;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::app_state::{AppState, MetricsState};

/// HTTP surface of the service.
pub fn router(state: AppState, metrics_handle: MetricsState) -> Router {
    Router::new()
        .route("/health", get(health::health_check))
        .route("/api/v1/tasks/process-next", post(tasks::process_next))
        .with_state(state)
        .route("/metrics", get(metrics::prometheus_metrics).with_state(metrics_handle))
        .layer(TraceLayer::new_for_http())
        .layer(CompressionLayer::new())
        .layer(CorsLayer::permissive())
}
