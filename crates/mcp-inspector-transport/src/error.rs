#[cfg(any(feature = "sse", feature = "streamable-http"))]
use reqwest::Error as ReqwestError;
use std::io::Error as IoError;
use thiserror::Error;

pub type TransportResult<T> = core::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("Session expired or not found")]
    SessionExpired,

    #[error("Failed to open SSE stream: {0}")]
    FailedToOpenSseStream(String),

    #[error("Unexpected content type: '{0}'")]
    UnexpectedContentType(String),

    #[error("Failed to send message: {0}")]
    SendFailure(String),

    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[cfg(any(feature = "sse", feature = "streamable-http"))]
    #[error("HTTP connection error: {0}")]
    HttpConnection(#[from] ReqwestError),

    #[cfg(any(feature = "sse", feature = "streamable-http"))]
    #[error("HTTP error: status {0}")]
    HttpStatus(u16),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Shutdown timed out")]
    ShutdownTimeout,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// Numeric HTTP status attached to this error, when one is known.
    pub fn http_status(&self) -> Option<u16> {
        match self {
            #[cfg(any(feature = "sse", feature = "streamable-http"))]
            TransportError::HttpStatus(status) => Some(*status),
            #[cfg(any(feature = "sse", feature = "streamable-http"))]
            TransportError::HttpConnection(err) => err.status().map(|s| s.as_u16()),
            _ => None,
        }
    }

    /// Whether this error indicates the upstream rejected our credentials.
    ///
    /// Prefers the structured status; falls back to scanning the error text
    /// for transports that only surface a message.
    pub fn is_unauthorized(&self) -> bool {
        match self.http_status() {
            Some(status) => status == 401,
            None => {
                let text = self.to_string();
                text.contains("401") || text.contains("Unauthorized")
            }
        }
    }
}
