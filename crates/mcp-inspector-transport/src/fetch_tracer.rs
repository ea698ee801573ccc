use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[cfg(any(feature = "sse", feature = "streamable-http"))]
use crate::error::{TransportError, TransportResult};
#[cfg(any(feature = "sse", feature = "streamable-http"))]
use reqwest::{
    header::{HeaderMap, CONTENT_TYPE},
    Client, Method,
};
#[cfg(any(feature = "sse", feature = "streamable-http"))]
use std::time::Instant;
#[cfg(any(feature = "sse", feature = "streamable-http"))]
use tokio::sync::mpsc;

/// Which machinery issued a traced request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TraceCategory {
    /// OAuth machinery (token refresh, metadata discovery).
    Auth,
    /// Regular transport traffic (SSE subscribe, frame POSTs).
    Transport,
}

/// Record of one HTTP request/response pair, captured for diagnostics.
///
/// Body fields are omitted rather than empty when they were not captured:
/// a streaming response (`text/event-stream`, `application/x-ndjson`) keeps
/// `response_body` absent because consuming it would break the stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FetchTraceEntry {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub method: String,
    pub url: String,
    pub request_headers: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_body: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_status_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<HashMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_body: Option<String>,
    /// Wall-clock milliseconds from call entry until response headers (or error).
    pub duration: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub category: TraceCategory,
}

/// Content types whose bodies must be left unconsumed.
pub fn is_streaming_content_type(content_type: &str) -> bool {
    let essence = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();
    essence == "text/event-stream" || essence == "application/x-ndjson"
}

#[cfg(any(feature = "sse", feature = "streamable-http"))]
pub type TraceSink = mpsc::UnboundedSender<FetchTraceEntry>;

/// Response handed back by [`TracedClient::execute`].
///
/// Non-streaming bodies are buffered (the trace entry already captured
/// them); streaming responses keep the live [`reqwest::Response`] so the
/// caller can consume the stream itself.
#[cfg(any(feature = "sse", feature = "streamable-http"))]
pub struct TracedResponse {
    pub status: u16,
    pub status_text: String,
    pub headers: HeaderMap,
    body: TracedBody,
}

#[cfg(any(feature = "sse", feature = "streamable-http"))]
enum TracedBody {
    Buffered(String),
    Streaming(reqwest::Response),
}

#[cfg(any(feature = "sse", feature = "streamable-http"))]
impl TracedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// The buffered body text; `None` for streaming responses.
    pub fn text(&self) -> Option<&str> {
        match &self.body {
            TracedBody::Buffered(text) => Some(text),
            TracedBody::Streaming(_) => None,
        }
    }

    /// Consumes self, yielding the live response of a streaming reply.
    pub fn into_stream(self) -> Option<reqwest::Response> {
        match self.body {
            TracedBody::Streaming(response) => Some(response),
            TracedBody::Buffered(_) => None,
        }
    }

    pub fn content_type(&self) -> Option<String> {
        self.headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
    }
}

/// Wraps a [`reqwest::Client`] so every request yields one
/// [`FetchTraceEntry`] on the sink, without altering observable
/// request/response behavior.
#[cfg(any(feature = "sse", feature = "streamable-http"))]
#[derive(Clone)]
pub struct TracedClient {
    client: Client,
    sink: TraceSink,
    category: TraceCategory,
}

#[cfg(any(feature = "sse", feature = "streamable-http"))]
impl TracedClient {
    pub fn new(client: Client, sink: TraceSink, category: TraceCategory) -> Self {
        Self {
            client,
            sink,
            category,
        }
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Executes one request, emitting exactly one trace entry.
    ///
    /// On a network error the entry carries `error` and no response fields,
    /// and the error is returned to the caller unchanged.
    pub async fn execute(
        &self,
        method: Method,
        url: &str,
        headers: HeaderMap,
        body: Option<String>,
    ) -> TransportResult<TracedResponse> {
        let mut entry = FetchTraceEntry {
            id: uuid::Uuid::new_v4().simple().to_string(),
            timestamp: Utc::now(),
            method: method.to_string(),
            url: url.to_string(),
            request_headers: header_map_to_hash_map(&headers),
            request_body: body.clone(),
            response_status: None,
            response_status_text: None,
            response_headers: None,
            response_body: None,
            duration: 0,
            error: None,
            category: self.category,
        };

        let mut request = self.client.request(method, url).headers(headers);
        if let Some(body) = body {
            request = request.body(body);
        }

        let started = Instant::now();
        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                entry.duration = started.elapsed().as_millis() as u64;
                entry.error = Some(err.to_string());
                let _ = self.sink.send(entry);
                return Err(TransportError::HttpConnection(err));
            }
        };

        // Headers are in; the duration does not include body consumption.
        entry.duration = started.elapsed().as_millis() as u64;
        entry.response_status = Some(response.status().as_u16());
        entry.response_status_text = response
            .status()
            .canonical_reason()
            .map(|reason| reason.to_string());
        entry.response_headers = Some(header_map_to_hash_map(response.headers()));

        let status = response.status().as_u16();
        let status_text = response
            .status()
            .canonical_reason()
            .unwrap_or_default()
            .to_string();
        let headers = response.headers().clone();

        let streaming = headers
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(is_streaming_content_type);

        let traced = if streaming {
            let _ = self.sink.send(entry);
            TracedResponse {
                status,
                status_text,
                headers,
                body: TracedBody::Streaming(response),
            }
        } else {
            let text = response.text().await.unwrap_or_default();
            entry.response_body = Some(text.clone());
            let _ = self.sink.send(entry);
            TracedResponse {
                status,
                status_text,
                headers,
                body: TracedBody::Buffered(text),
            }
        };

        Ok(traced)
    }
}

#[cfg(any(feature = "sse", feature = "streamable-http"))]
fn header_map_to_hash_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                String::from_utf8_lossy(value.as_bytes()).to_string(),
            )
        })
        .collect()
}
