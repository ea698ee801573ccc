pub mod config_routes;
pub mod fetch_routes;
pub mod log_routes;
pub mod mcp_routes;
pub mod storage_routes;

use std::sync::Arc;

use axum::{middleware, Router};
use serde::de::DeserializeOwned;

use crate::app_state::AppState;
use crate::error::{BrokerError, BrokerResult};
use crate::middlewares::{bearer_auth, origin_validator};

/// Constructs the Axum router with all application routes.
///
/// The policy middlewares wrap everything, origin validation outermost so a
/// disallowed page never even reaches the auth check.
pub fn app_routes(state: Arc<AppState>) -> Router {
    Router::new()
        .merge(mcp_routes::routes())
        .merge(fetch_routes::routes())
        .merge(storage_routes::routes())
        .merge(log_routes::routes())
        .merge(config_routes::routes())
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            bearer_auth::require_bearer,
        ))
        .layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            origin_validator::validate_origin,
        ))
        .with_state(state)
}

/// Parses a JSON request body, translating failures into the edge 400 shape
/// instead of the extractor's plain-text rejection.
pub(crate) fn parse_body<T: DeserializeOwned>(body: &[u8]) -> BrokerResult<T> {
    serde_json::from_slice(body)
        .map_err(|err| BrokerError::BadRequest(format!("Invalid JSON body: {err}")))
}
