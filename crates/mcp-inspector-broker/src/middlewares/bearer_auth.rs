use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};
use subtle::ConstantTimeEq;

use crate::app_state::AppState;
use crate::error::BrokerError;

/// Header carrying the broker bearer token. Deliberately not
/// `Authorization`: that header belongs to the upstream server and is
/// forwarded through `/api/fetch` untouched.
pub const MCP_REMOTE_AUTH_HEADER: &str = "x-mcp-remote-auth";

/// Enforces `x-mcp-remote-auth: Bearer <token>` on every request except
/// CORS preflights and the liveness probe. Disabled when no token is
/// configured (the dangerous override).
pub async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.api_token.as_deref() else {
        return next.run(request).await;
    };
    // Preflights carry no credentials by design; the probe stays open.
    if request.method() == Method::OPTIONS || request.uri().path() == "/health" {
        return next.run(request).await;
    }

    let provided = request
        .headers()
        .get(MCP_REMOTE_AUTH_HEADER)
        .and_then(|v| v.to_str().ok());

    match provided {
        Some(value) if bearer_token_matches(value, expected) => next.run(request).await,
        Some(_) => BrokerError::Unauthorized("Invalid authentication token".into()).into_response(),
        None => BrokerError::Unauthorized(format!(
            "Missing {MCP_REMOTE_AUTH_HEADER} header, expected 'Bearer <token>'"
        ))
        .into_response(),
    }
}

/// Parses `Bearer <token>` and compares the token against the expected one.
///
/// The comparison goes through `subtle::ConstantTimeEq`: equal-length byte
/// buffers are compared in full with no data-dependent branch, and unequal
/// lengths are rejected up front without touching token bytes.
fn bearer_token_matches(header_value: &str, expected: &str) -> bool {
    let mut parts = header_value.trim().splitn(2, ' ');
    let (Some(scheme), Some(token)) = (parts.next(), parts.next()) else {
        return false;
    };
    if !scheme.eq_ignore_ascii_case("bearer") {
        return false;
    }
    token.trim().as_bytes().ct_eq(expected.as_bytes()).into()
}
