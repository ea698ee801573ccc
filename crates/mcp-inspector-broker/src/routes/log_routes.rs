use std::sync::Arc;

use axum::{body::Bytes, extract::State, routing::post, Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;
use crate::error::BrokerResult;
use crate::routes::parse_body;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/log", post(handle_log))
}

#[derive(Debug, Deserialize)]
struct LogRecord {
    #[serde(default)]
    level: Option<String>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

/// Accepts a structured client-side log record and forwards it into the
/// broker's own subscriber under the `client` target. Always acknowledges;
/// whether a file sink is configured is the subscriber's business.
async fn handle_log(State(_state): State<Arc<AppState>>, body: Bytes) -> BrokerResult<Json<Value>> {
    let record: LogRecord = parse_body(&body)?;
    let message = record.message.unwrap_or_default();
    let data = record.data.unwrap_or(Value::Null);

    match record.level.as_deref() {
        Some("error") => tracing::error!(target: "client", %data, "{message}"),
        Some("warn") => tracing::warn!(target: "client", %data, "{message}"),
        Some("debug") => tracing::debug!(target: "client", %data, "{message}"),
        Some("trace") => tracing::trace!(target: "client", %data, "{message}"),
        _ => tracing::info!(target: "client", %data, "{message}"),
    }

    Ok(Json(json!({ "ok": true })))
}
