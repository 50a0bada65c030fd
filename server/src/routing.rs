//! HTTP routing configuration

use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::hub::Hub;

/// Create the application router.
pub fn create_router(hub: Arc<Hub>) -> Router {
    Router::new()
        .route("/ws", get(crate::ws::handle_websocket))
        .route("/health", get(health_check))
        .with_state(hub)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Health check with current store counts.
async fn health_check(State(hub): State<Arc<Hub>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "room_count": hub.room_count().await,
        "user_count": hub.user_count().await,
    }))
}
