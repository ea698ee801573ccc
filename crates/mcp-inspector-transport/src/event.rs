use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::fetch_tracer::FetchTraceEntry;

/// A single occurrence on an upstream transport, delivered to the session
/// layer over one mpsc channel so that arrival order is preserved without
/// any cross-callback coordination.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    /// A JSON-RPC frame received from the upstream server, forwarded verbatim.
    Message(Value),
    /// One line of the child process stderr (stdio transports only).
    Stderr {
        timestamp: DateTime<Utc>,
        line: String,
    },
    /// One HTTP request issued by an http-based transport (sse / streamable HTTP).
    FetchTrace(FetchTraceEntry),
    /// A terminal transport failure. Followed by exactly one `Closed`.
    Error {
        message: String,
        code: Option<i64>,
    },
    /// The upstream channel is gone. Emitted at most once, always last.
    Closed,
}
