//! HTTP routes

pub mod admin;
pub mod chat;

use axum::Router;
use axum::routing::{get, post};
use tower_http::cors::CorsLayer;

use crate::state::AppContext;

/// Build the full router.
pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/api/health", get(admin::health))
        .route("/api/chat", post(chat::send_message))
        .route("/api/feedback", post(admin::feedback))
        .route("/api/skills/stats", get(admin::skill_stats))
        .route("/api/learning/stats", get(admin::learning_stats))
        .route("/api/outcomes", post(admin::record_outcome))
        .route("/api/smart-context", post(admin::smart_context))
        .layer(CorsLayer::permissive())
        .with_state(ctx)
}
