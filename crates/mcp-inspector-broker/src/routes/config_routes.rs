use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::config::InitialConfig;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/config", get(handle_config))
        .route("/health", get(handle_health))
}

/// The environment-derived initial configuration for the connect form.
async fn handle_config(State(state): State<Arc<AppState>>) -> Json<InitialConfig> {
    Json(state.initial_config.clone())
}

async fn handle_health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}
