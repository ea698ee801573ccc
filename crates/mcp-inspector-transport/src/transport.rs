use crate::error::TransportResult;
use crate::event::TransportEvent;
use crate::SessionId;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, fmt, path::PathBuf, time::Duration};
use tokio_stream::wrappers::ReceiverStream;

/// Default Timeout in milliseconds
const DEFAULT_TIMEOUT_MSEC: u64 = 30_000;

/// Configuration for the transport layer
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// The timeout for upstream operations (start handshakes, outbound sends).
    pub timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MSEC),
        }
    }
}

/// Identifier correlating an outbound frame with the request it answers.
/// JSON-RPC allows both string and numeric ids.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestId {
    String(String),
    Number(i64),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::String(s) => write!(f, "{s}"),
            RequestId::Number(n) => write!(f, "{n}"),
        }
    }
}

/// Declarative description of an upstream MCP server, as received from the
/// broker client on connect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum ServerConfig {
    /// Launch a local server as a child process and speak newline-delimited
    /// JSON over its stdio pipes.
    Stdio {
        command: String,
        #[serde(default)]
        args: Vec<String>,
        #[serde(default)]
        env: HashMap<String, String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cwd: Option<PathBuf>,
    },
    /// Subscribe to a remote server over the legacy HTTP+SSE transport.
    Sse {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
    /// Talk to a remote server over the streamable HTTP transport.
    StreamableHttp {
        url: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        headers: Option<HashMap<String, String>>,
    },
}

impl ServerConfig {
    /// Short label used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ServerConfig::Stdio { .. } => "stdio",
            ServerConfig::Sse { .. } => "sse",
            ServerConfig::StreamableHttp { .. } => "streamableHttp",
        }
    }
}

/// A trait representing one upstream carrier of MCP frames.
///
/// Implementations relay opaque JSON-RPC values in both directions and
/// report everything else that happens on the wire (stderr output, traced
/// HTTP requests, terminal failures) through the single event stream
/// returned by [`Transport::start`].
#[async_trait]
pub trait Transport: Send + Sync {
    /// Opens the upstream channel.
    ///
    /// A successful return means the channel is usable: the child process is
    /// spawned, the SSE endpoint handshake completed, or the streamable HTTP
    /// stream was accepted. Failures during this window surface here as an
    /// error rather than as a later `Closed` event.
    async fn start(&self) -> TransportResult<ReceiverStream<TransportEvent>>;

    /// Pushes one JSON-RPC frame upstream, optionally tagged with the id of
    /// the request it relates to.
    async fn send(
        &self,
        message: &serde_json::Value,
        related_request_id: Option<&RequestId>,
    ) -> TransportResult<()>;

    /// Releases all resources. After this returns no further events are
    /// produced on the stream returned by `start`.
    async fn shut_down(&self) -> TransportResult<()>;

    async fn is_shut_down(&self) -> bool;

    /// The session identifier assigned by the upstream server, when the
    /// transport kind has one (streamable HTTP).
    async fn session_id(&self) -> Option<SessionId> {
        None
    }
}

/// Builds the transport matching `config`, wiring the fetch tracer and the
/// token injector into http-based variants.
pub fn create_transport(
    config: &ServerConfig,
    injector: crate::TokenInjector,
    options: TransportOptions,
) -> TransportResult<Box<dyn Transport>> {
    match config {
        #[cfg(feature = "stdio")]
        ServerConfig::Stdio {
            command,
            args,
            env,
            cwd,
        } => Ok(Box::new(crate::StdioTransport::new(
            command.clone(),
            args.clone(),
            env.clone(),
            cwd.clone(),
            options,
        )?)),
        #[cfg(feature = "sse")]
        ServerConfig::Sse { url, headers } => Ok(Box::new(crate::SseTransport::new(
            url.clone(),
            headers.clone(),
            injector,
            options,
        )?)),
        #[cfg(feature = "streamable-http")]
        ServerConfig::StreamableHttp { url, headers } => {
            Ok(Box::new(crate::StreamableHttpTransport::new(
                url.clone(),
                headers.clone(),
                injector,
                options,
            )?))
        }
        #[allow(unreachable_patterns)]
        other => Err(crate::error::TransportError::Configuration {
            message: format!("transport kind '{}' is not enabled", other.kind()),
        }),
    }
}
