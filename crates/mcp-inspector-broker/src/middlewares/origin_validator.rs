//! Origin validation for DNS rebinding protection.
//!
//! A malicious page can re-resolve its own hostname to 127.0.0.1 and drive
//! this broker from the victim's browser; the `Origin` header is the one
//! signal the attacker cannot forge. Requests without an `Origin` header
//! (same-origin requests, curl, non-browser clients) pass through;
//! credentials are the bearer middleware's concern, not this one's.

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ORIGIN,
        },
        HeaderValue, Method, StatusCode,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::app_state::AppState;
use crate::error::BrokerError;

const ALLOWED_METHODS: &str = "GET, POST, DELETE, OPTIONS";
const ALLOWED_HEADERS: &str = "Content-Type, x-mcp-remote-auth";
const MAX_AGE_SECONDS: &str = "86400";

/// Validates the `Origin` header against the allowlist and answers CORS
/// preflights. With an empty allowlist the check is disabled entirely.
pub async fn validate_origin(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    if state.allowed_origins.is_empty() {
        return next.run(request).await;
    }

    let origin = request
        .headers()
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string());
    let origin_allowed = origin.as_deref().map(|origin| {
        state
            .allowed_origins
            .iter()
            .any(|allowed| allowed.eq_ignore_ascii_case(origin))
    });

    if request.method() == Method::OPTIONS {
        return match (&origin, origin_allowed) {
            (Some(origin), Some(true)) => preflight_response(origin),
            (Some(origin), _) => {
                BrokerError::Forbidden(format!("Invalid origin: \"{origin}\"")).into_response()
            }
            (None, _) => {
                BrokerError::Forbidden("Invalid origin: preflight without Origin header".into())
                    .into_response()
            }
        };
    }

    match (origin, origin_allowed) {
        // Same-origin or non-browser request.
        (None, _) => next.run(request).await,
        (Some(origin), Some(true)) => {
            let mut response = next.run(request).await;
            if let Ok(value) = HeaderValue::from_str(&origin) {
                response
                    .headers_mut()
                    .insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
            }
            response
        }
        (Some(origin), _) => {
            BrokerError::Forbidden(format!("Invalid origin: \"{origin}\"")).into_response()
        }
    }
}

fn preflight_response(origin: &str) -> Response {
    let mut response = StatusCode::NO_CONTENT.into_response();
    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(origin) {
        headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, value);
    }
    headers.insert(
        ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static(ALLOWED_METHODS),
    );
    headers.insert(
        ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static(ALLOWED_HEADERS),
    );
    headers.insert(
        ACCESS_CONTROL_MAX_AGE,
        HeaderValue::from_static(MAX_AGE_SECONDS),
    );
    response
}
