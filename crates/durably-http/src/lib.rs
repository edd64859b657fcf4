//! Thin `axum` adapter exposing a `Durably` instance over HTTP.

mod routes;
mod sse;

use std::sync::Arc;

use durably_core::Durably;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use routes::{AppState, TriggerRequest, TriggerResponse};

/// Builds the full router: every route from `routes::router`, wrapped with
/// request tracing and a permissive CORS layer.
pub fn build_router(durably: Arc<Durably>) -> axum::Router {
    routes::router(durably)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}
