//! HTTP API handlers and routing.

pub mod error;
mod health;
mod instances;
pub mod tenant;

use axum::{
    http::{header, Method},
    Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

use crate::state::AppState;

/// Create the main API router with all routes and middleware.
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static(tenant::TENANT_HEADER),
        ])
        .allow_origin(Any);

    Router::new()
        // Health endpoints (no tenant required)
        .merge(health::routes())
        // Tenant-facing v1 routes
        .nest("/v1", instances::routes())
        // Middleware
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        // Application state
        .with_state(state)
}
