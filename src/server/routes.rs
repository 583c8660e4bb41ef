//! Router configuration for the web server.

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;

use super::handlers;
use super::AppState;

/// Create the main router with all routes.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        // Job-based extraction flow
        .route("/api/jobs", post(handlers::submit_jobs))
        .route("/api/jobs/:job_id", get(handlers::job_status))
        .route("/api/jobs/:job_id/events", get(handlers::job_events))
        .route("/api/jobs/:job_id/download", get(handlers::download_artifact))
        // Single-request inline scrape
        .route("/api/scrape", post(handlers::scrape_stream))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
