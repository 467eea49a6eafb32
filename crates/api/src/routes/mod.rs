//! API routes

pub mod billing;
pub mod health;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness));

    let api_routes = Router::new()
        // Webhook (public, relies on signature verification)
        .route("/billing/webhook", post(billing::webhook))
        // Plan catalog
        .route("/billing/plans", get(billing::list_plans))
        // Per-user billing operations
        .route("/users/:user_id/balance", get(billing::get_balance))
        .route("/users/:user_id/transactions", get(billing::get_history))
        .route("/users/:user_id/purchases", post(billing::purchase_one_time))
        .route(
            "/users/:user_id/subscriptions",
            post(billing::purchase_subscription),
        )
        .route(
            "/users/:user_id/subscriptions/:subscription_id/upgrade",
            post(billing::upgrade_subscription),
        )
        .route(
            "/users/:user_id/subscriptions/:subscription_id/cancel",
            post(billing::cancel_subscription),
        );

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
