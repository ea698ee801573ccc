use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    body::Bytes,
    extract::State,
    routing::post,
    Json, Router,
};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Map, Value};

use mcp_inspector_transport::is_streaming_content_type;

use crate::app_state::AppState;
use crate::error::{BrokerError, BrokerResult};
use crate::routes::parse_body;

pub fn routes() -> Router<Arc<AppState>> {
    Router::new().route("/api/fetch", post(handle_fetch))
}

#[derive(Debug, Deserialize)]
struct FetchRequest {
    url: String,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    headers: Option<HashMap<String, String>>,
    #[serde(default)]
    body: Option<String>,
}

/// Proxies one HTTP request on the UI's behalf, sidestepping browser CORS
/// for OAuth discovery and similar probes. Streaming response bodies are
/// reported by status/headers only.
async fn handle_fetch(State(state): State<Arc<AppState>>, body: Bytes) -> BrokerResult<Json<Value>> {
    let request: FetchRequest = parse_body(&body)?;

    let url: reqwest::Url = request
        .url
        .parse()
        .map_err(|err| BrokerError::BadRequest(format!("Invalid URL: {err}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(BrokerError::BadRequest(format!(
            "Only http(s) URLs can be proxied, got scheme {:?}",
            url.scheme()
        )));
    }

    let method = request
        .method
        .as_deref()
        .unwrap_or("GET")
        .parse::<Method>()
        .map_err(|err| BrokerError::BadRequest(format!("Invalid method: {err}")))?;

    let mut headers = HeaderMap::new();
    if let Some(raw_headers) = &request.headers {
        for (name, value) in raw_headers {
            let name = name
                .parse::<HeaderName>()
                .map_err(|err| BrokerError::BadRequest(format!("Invalid header name: {err}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|err| BrokerError::BadRequest(format!("Invalid header value: {err}")))?;
            headers.insert(name, value);
        }
    }

    let mut builder = state.http_client.request(method, url).headers(headers);
    if let Some(body) = request.body {
        builder = builder.body(body);
    }

    let response = tokio::time::timeout(state.request_timeout, builder.send())
        .await
        .map_err(|_| BrokerError::Upstream("Fetch timed out".into()))?
        .map_err(|err| BrokerError::Upstream(format!("Fetch failed: {err}")))?;

    let status = response.status();
    let mut response_headers = Map::new();
    for (name, value) in response.headers() {
        response_headers.insert(
            name.to_string(),
            Value::String(String::from_utf8_lossy(value.as_bytes()).to_string()),
        );
    }

    let streaming = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(is_streaming_content_type);

    let mut reply = json!({
        "ok": status.is_success(),
        "status": status.as_u16(),
        "statusText": status.canonical_reason().unwrap_or_default(),
        "headers": Value::Object(response_headers),
    });
    if !streaming {
        let text = response
            .text()
            .await
            .map_err(|err| BrokerError::Upstream(format!("Failed to read response: {err}")))?;
        reply["body"] = Value::String(text);
    }

    Ok(Json(reply))
}
