//! Router configuration for the web server.

use axum::extract::DefaultBodyLimit;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    let body_limit = state.max_upload_bytes;
    Router::new()
        // Liveness for container probes
        .route("/", get(handlers::health))
        .route("/api/health", get(handlers::health))
        .route("/api/analyze", post(handlers::analyze))
        .route("/api/feedback", post(handlers::submit_feedback))
        .route("/api/context", post(handlers::add_context))
        .route("/api/stats", get(handlers::stats))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
