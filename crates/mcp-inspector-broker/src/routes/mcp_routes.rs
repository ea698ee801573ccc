use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::{Body, Bytes},
    extract::{Query, State},
    http::header::{CACHE_CONTROL, CONTENT_TYPE},
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;

use mcp_inspector_transport::{OauthTokens, RequestId, ServerConfig, SseEvent};

use crate::app_state::AppState;
use crate::error::{BrokerError, BrokerResult};
use crate::registry::SessionRegistry;
use crate::routes::parse_body;
use crate::session::SessionConsumer;

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/mcp/connect", post(handle_connect))
        .route("/api/mcp/send", post(handle_send))
        .route("/api/mcp/events", get(handle_events))
        .route("/api/mcp/disconnect", post(handle_disconnect))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectRequest {
    config: ServerConfig,
    #[serde(default)]
    oauth_tokens: Option<OauthTokens>,
}

/// Opens a session against the described upstream. An upstream 401 maps to
/// HTTP 401 so the client can launch its OAuth flow; every other start
/// failure is a 500 carrying the captured error text.
async fn handle_connect(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> BrokerResult<Json<Value>> {
    let request: ConnectRequest = parse_body(&body)?;

    let created = tokio::time::timeout(
        state.request_timeout,
        state.registry.create(&request.config, request.oauth_tokens),
    )
    .await
    .map_err(|_| BrokerError::Upstream("Failed to start transport: timed out".into()))?;

    let session_id = created.map_err(|err| {
        if err.is_unauthorized() {
            BrokerError::Unauthorized(format!("Upstream authorization required: {err}"))
        } else {
            BrokerError::Upstream(format!("Failed to start transport: {err}"))
        }
    })?;

    Ok(Json(json!({ "sessionId": session_id })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SendRequest {
    session_id: String,
    message: Value,
    #[serde(default)]
    related_request_id: Option<RequestId>,
}

async fn handle_send(State(state): State<Arc<AppState>>, body: Bytes) -> BrokerResult<Json<Value>> {
    let request: SendRequest = parse_body(&body)?;
    let session = state
        .registry
        .get(&request.session_id)
        .await
        .ok_or_else(|| BrokerError::SessionNotFound(request.session_id.clone()))?;

    tokio::time::timeout(
        state.request_timeout,
        session.send(&request.message, request.related_request_id.as_ref()),
    )
    .await
    .map_err(|_| BrokerError::Upstream("Send timed out".into()))??;

    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct EventsQuery {
    session_id: String,
}

/// Binds the caller as the session's consumer and streams its events as
/// `text/event-stream`. Queued events flush first; the response headers go
/// out before the first event so a quiet session still observes the 200.
async fn handle_events(
    State(state): State<Arc<AppState>>,
    Query(query): Query<EventsQuery>,
) -> BrokerResult<Response> {
    let session = state
        .registry
        .get(&query.session_id)
        .await
        .ok_or_else(|| BrokerError::SessionNotFound(query.session_id.clone()))?;

    let consumer = session.bind_consumer();
    let guard = ReapGuard {
        registry: Arc::clone(&state.registry),
        session_id: query.session_id,
    };

    let body = Body::from_stream(events_stream(consumer, guard).map(Ok::<_, Infallible>));
    Response::builder()
        .header(CONTENT_TYPE, "text/event-stream")
        .header(CACHE_CONTROL, "no-cache")
        .body(body)
        .map_err(|err| BrokerError::Internal(format!("failed to build SSE response: {err}")))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisconnectRequest {
    session_id: String,
}

async fn handle_disconnect(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> BrokerResult<Json<Value>> {
    let request: DisconnectRequest = parse_body(&body)?;
    state.registry.delete(&request.session_id).await;
    Ok(Json(json!({ "ok": true })))
}

/// Applies the registry reap policy once the SSE response winds down, no
/// matter whether the client aborted or the stream ended on the terminal
/// event. Declared after the consumer in [`EventsStreamState`] so the
/// consumer slot is already released when it fires.
struct ReapGuard {
    registry: Arc<SessionRegistry>,
    session_id: String,
}

impl Drop for ReapGuard {
    fn drop(&mut self) {
        let registry = Arc::clone(&self.registry);
        let session_id = std::mem::take(&mut self.session_id);
        tokio::spawn(async move {
            registry.reap_if_unconsumed(&session_id).await;
        });
    }
}

struct EventsStreamState {
    consumer: SessionConsumer,
    _guard: ReapGuard,
    keep_alive: tokio::time::Interval,
    opened: bool,
}

fn events_stream(
    consumer: SessionConsumer,
    guard: ReapGuard,
) -> impl futures::Stream<Item = String> + Send {
    let start = tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL;
    let mut keep_alive = tokio::time::interval_at(start, KEEP_ALIVE_INTERVAL);
    keep_alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let state = EventsStreamState {
        consumer,
        _guard: guard,
        keep_alive,
        opened: false,
    };

    futures::stream::unfold(state, |mut state| async move {
        if !state.opened {
            state.opened = true;
            // An immediate comment makes the headers flush right away.
            return Some((": connected\n\n".to_string(), state));
        }
        // `None` from the consumer means this binding was preempted; the
        // stream ends and the drop guard applies the reap policy.
        let item = {
            let EventsStreamState {
                consumer,
                keep_alive,
                ..
            } = &mut state;
            tokio::select! {
                event = consumer.next_event() => event.map(|event| {
                    SseEvent::new(event.data().to_string())
                        .with_event(event.name())
                        .to_string()
                }),
                _ = keep_alive.tick() => Some(": keep-alive\n\n".to_string()),
            }
        };
        item.map(|frame| (frame, state))
    })
}
