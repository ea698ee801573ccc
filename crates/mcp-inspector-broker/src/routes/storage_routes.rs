use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::get,
    Json, Router,
};
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::error::BrokerResult;
use crate::routes::parse_body;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route(
        "/api/storage/{store_id}",
        get(handle_get).post(handle_set).delete(handle_delete),
    )
}

async fn handle_get(
    State(state): State<Arc<AppState>>,
    Path(store_id): Path<String>,
) -> BrokerResult<Json<Value>> {
    Ok(Json(state.storage.read(&store_id).await?))
}

async fn handle_set(
    State(state): State<Arc<AppState>>,
    Path(store_id): Path<String>,
    body: Bytes,
) -> BrokerResult<Json<Value>> {
    let document: Value = parse_body(&body)?;
    state.storage.write(&store_id, &document).await?;
    Ok(Json(json!({ "ok": true })))
}

async fn handle_delete(
    State(state): State<Arc<AppState>>,
    Path(store_id): Path<String>,
) -> BrokerResult<Json<Value>> {
    state.storage.delete(&store_id).await?;
    Ok(Json(json!({ "ok": true })))
}
