use axum::{http::StatusCode, response::IntoResponse, Json};
use serde_json::json;
use thiserror::Error;

pub type BrokerResult<T> = core::result::Result<T, BrokerError>;

/// Edge-level failure taxonomy. Every handler translates failures into one
/// of these; nothing else crosses the handler boundary.
#[derive(Debug, Error, Clone)]
pub enum BrokerError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    Unauthorized(String),

    #[error("{0}")]
    Forbidden(String),

    #[error("No session found for the given ID: {0}")]
    SessionNotFound(String),

    /// Upstream transport failure (spawn/start failure, send on a dead
    /// transport). The message carries the captured upstream error text.
    #[error("{0}")]
    Upstream(String),

    #[error("{0}")]
    Internal(String),
}

impl BrokerError {
    pub fn status(&self) -> StatusCode {
        match self {
            BrokerError::BadRequest(_) => StatusCode::BAD_REQUEST,
            BrokerError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            BrokerError::Forbidden(_) => StatusCode::FORBIDDEN,
            BrokerError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            BrokerError::Upstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            BrokerError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short tag carried in the `error` field. Upstream failures carry the
    /// captured error text itself so clients can show it verbatim.
    fn tag(&self) -> String {
        match self {
            BrokerError::BadRequest(_) => "Bad Request".into(),
            BrokerError::Unauthorized(_) => "Unauthorized".into(),
            BrokerError::Forbidden(_) => "Forbidden".into(),
            BrokerError::SessionNotFound(_) => "Not Found".into(),
            BrokerError::Upstream(message) => message.clone(),
            BrokerError::Internal(_) => "Internal Server Error".into(),
        }
    }
}

impl IntoResponse for BrokerError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({
            "error": self.tag(),
            "message": self.to_string(),
        });
        (self.status(), Json(body)).into_response()
    }
}
