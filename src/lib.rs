pub mod config;
pub mod game;
pub mod handlers;
pub mod middleware;
pub mod services;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::trace::TraceLayer;

use crate::services::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws", get(handlers::ws::ws_handler))
        // Health
        .route("/health", get(handlers::health::health_check))
        .route("/health/store", get(handlers::health::store_health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}
