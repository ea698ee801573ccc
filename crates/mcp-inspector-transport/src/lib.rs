mod auth;
#[cfg(feature = "sse")]
mod client_sse;
#[cfg(feature = "streamable-http")]
mod client_streamable_http;
pub mod error;
mod event;
mod fetch_tracer;
#[cfg(feature = "stdio")]
mod stdio;
mod transport;
mod utils;

pub use auth::*;
#[cfg(feature = "sse")]
pub use client_sse::*;
#[cfg(feature = "streamable-http")]
pub use client_streamable_http::*;
pub use event::*;
pub use fetch_tracer::*;
#[cfg(feature = "stdio")]
pub use stdio::*;
pub use transport::*;
pub use utils::sse_parser::{SseEvent, SseParser};

// Type alias for the upstream session identifier assigned by a streamable
// HTTP server (carried in the `Mcp-Session-Id` header), represented as a String
pub type SessionId = String;
