//! Admin API router

use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::handlers;
use crate::state::BrokerState;

/// Build the admin router over shared broker state
pub fn router(state: Arc<BrokerState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // Health & Overview
        .route("/api/health", get(handlers::health_check))
        .route("/api/overview", get(handlers::get_overview))
        // Workers
        .route("/api/workers", get(handlers::list_workers))
        .route("/api/workers/:id", get(handlers::get_worker))
        // Items
        .route("/api/items", post(handlers::submit_item))
        .route("/api/items/:id", get(handlers::get_item))
        .route("/api/items/:id/abandon", post(handlers::abandon_item))
        // Metrics
        .route("/api/metrics", get(handlers::get_metrics))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// API endpoint documentation
pub struct ApiEndpoint {
    pub method: &'static str,
    pub path: &'static str,
    pub description: &'static str,
}

/// Endpoints printed at startup
pub fn api_endpoints() -> Vec<ApiEndpoint> {
    vec![
        ApiEndpoint {
            method: "GET",
            path: "/api/health",
            description: "Health check",
        },
        ApiEndpoint {
            method: "GET",
            path: "/api/overview",
            description: "Queue and worker counts",
        },
        ApiEndpoint {
            method: "GET",
            path: "/api/workers",
            description: "List registered workers",
        },
        ApiEndpoint {
            method: "GET",
            path: "/api/workers/:id",
            description: "Get worker details",
        },
        ApiEndpoint {
            method: "POST",
            path: "/api/items",
            description: "Submit a work item",
        },
        ApiEndpoint {
            method: "GET",
            path: "/api/items/:id",
            description: "Get item status",
        },
        ApiEndpoint {
            method: "POST",
            path: "/api/items/:id/abandon",
            description: "Abandon a pending or dispatched item",
        },
        ApiEndpoint {
            method: "GET",
            path: "/api/metrics",
            description: "Prometheus metrics",
        },
    ]
}
