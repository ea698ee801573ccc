use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use tokio::sync::watch::Sender;
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{TransportError, TransportResult};
use crate::event::TransportEvent;
use crate::fetch_tracer::{is_streaming_content_type, TraceCategory, TracedClient};
use crate::transport::{RequestId, Transport, TransportOptions};
use crate::utils::sse_parser::SseParser;
use crate::utils::validate_headers;
use crate::{SessionId, TokenInjector};

const CHANNEL_CAPACITY: usize = 64;

/// Header carrying the server-assigned session identifier.
pub const MCP_SESSION_ID_HEADER: &str = "mcp-session-id";

/// Transport for the streamable HTTP upstream flavor.
///
/// Every outbound frame is POSTed to the MCP endpoint; the server answers
/// with either a single JSON body or a per-request `text/event-stream` that
/// is pumped in the background. `start` additionally opens the optional
/// standalone GET stream used by servers to push unsolicited messages.
/// Servers without one answer 404/405, which is tolerated, while a 401
/// fails the connect.
pub struct StreamableHttpTransport {
    url: String,
    custom_headers: Option<HashMap<String, String>>,
    injector: TokenInjector,
    options: TransportOptions,
    client: Client,
    session_id: Arc<RwLock<Option<SessionId>>>,
    traced: RwLock<Option<TracedClient>>,
    event_tx: RwLock<Option<mpsc::Sender<TransportEvent>>>,
    shutdown_tx: RwLock<Option<Sender<bool>>>,
    is_shut_down: Mutex<bool>,
}

impl StreamableHttpTransport {
    pub fn new(
        url: String,
        custom_headers: Option<HashMap<String, String>>,
        injector: TokenInjector,
        options: TransportOptions,
    ) -> TransportResult<Self> {
        Ok(Self {
            url,
            custom_headers,
            injector,
            options,
            client: Client::new(),
            session_id: Arc::new(RwLock::new(None)),
            traced: RwLock::new(None),
            event_tx: RwLock::new(None),
            shutdown_tx: RwLock::new(None),
            is_shut_down: Mutex::new(false),
        })
    }

    async fn request_headers(&self) -> TransportResult<HeaderMap> {
        let mut headers = validate_headers(&self.custom_headers)?;
        if let Some(authorization) = self.injector.authorization_header() {
            let value = HeaderValue::from_str(&authorization).map_err(|e| {
                TransportError::Configuration {
                    message: format!("Invalid access token: {e}"),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        if let Some(session_id) = self.session_id.read().await.as_ref() {
            let value = HeaderValue::from_str(session_id).map_err(|e| {
                TransportError::Configuration {
                    message: format!("Invalid session id: {e}"),
                }
            })?;
            headers.insert(HeaderName::from_static(MCP_SESSION_ID_HEADER), value);
        }
        Ok(headers)
    }

    /// Records the server-assigned session id from a response, if present.
    async fn capture_session_id(&self, headers: &HeaderMap) {
        if let Some(value) = headers
            .get(MCP_SESSION_ID_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            let mut lock = self.session_id.write().await;
            if lock.as_deref() != Some(value) {
                tracing::debug!("upstream assigned session id {value}");
                *lock = Some(value.to_string());
            }
        }
    }

    /// Pumps one `text/event-stream` response body into message events.
    fn spawn_stream_pump(
        response: reqwest::Response,
        event_tx: mpsc::Sender<TransportEvent>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        tokio::spawn(async move {
            let mut parser = SseParser::new();
            let mut stream = response.bytes_stream();
            loop {
                let chunk = tokio::select! {
                    chunk = stream.next() => chunk,
                    _ = shutdown_rx.changed() => return,
                };
                let bytes = match chunk {
                    Some(Ok(bytes)) => bytes,
                    Some(Err(err)) => {
                        tracing::debug!("response stream ended with error: {err}");
                        return;
                    }
                    None => return,
                };
                for event in parser.process_chunk(&bytes) {
                    let Some(data) = event.data else { continue };
                    let frame: serde_json::Value = match serde_json::from_str(&data) {
                        Ok(frame) => frame,
                        Err(_) => {
                            tracing::warn!("skipping malformed SSE message: {data}");
                            continue;
                        }
                    };
                    if event_tx.send(TransportEvent::Message(frame)).await.is_err() {
                        return;
                    }
                }
            }
        });
    }

    /// Emits every message contained in a buffered JSON response body.
    async fn emit_json_body(&self, body: &str) -> TransportResult<()> {
        if body.trim().is_empty() {
            return Ok(());
        }
        let tx = self
            .event_tx
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::Internal("event channel not initialized".into()))?;
        let value: serde_json::Value = serde_json::from_str(body)
            .map_err(|err| TransportError::SendFailure(format!("invalid JSON response: {err}")))?;
        match value {
            serde_json::Value::Array(frames) => {
                for frame in frames {
                    let _ = tx.send(TransportEvent::Message(frame)).await;
                }
            }
            frame => {
                let _ = tx.send(TransportEvent::Message(frame)).await;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl Transport for StreamableHttpTransport {
    async fn start(&self) -> TransportResult<ReceiverStream<TransportEvent>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut lock = self.shutdown_tx.write().await;
            *lock = Some(shutdown_tx);
        }

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);
        {
            let mut lock = self.event_tx.write().await;
            *lock = Some(event_tx.clone());
        }

        let (trace_tx, mut trace_rx) = mpsc::unbounded_channel();
        let forward_tx = event_tx.clone();
        tokio::spawn(async move {
            while let Some(entry) = trace_rx.recv().await {
                if forward_tx
                    .send(TransportEvent::FetchTrace(entry))
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        let traced = TracedClient::new(self.client.clone(), trace_tx, TraceCategory::Transport);
        {
            let mut lock = self.traced.write().await;
            *lock = Some(traced.clone());
        }

        // Standalone GET stream: optional per protocol, but a 401 here means
        // the server wants credentials before anything else will work.
        let mut headers = self.request_headers().await?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));
        let response = tokio::time::timeout(
            self.options.timeout,
            traced.execute(Method::GET, &self.url, headers, None),
        )
        .await
        .map_err(|_| {
            TransportError::FailedToOpenSseStream("timed out opening standalone stream".into())
        })??;

        self.capture_session_id(&response.headers).await;

        match response.status {
            200 => {
                if let Some(stream) = response.into_stream() {
                    Self::spawn_stream_pump(stream, event_tx, shutdown_rx);
                }
            }
            401 | 403 => return Err(TransportError::HttpStatus(response.status)),
            // Stream-less servers answer 404 or 405; nothing to pump.
            404 | 405 => {}
            status if (200..300).contains(&status) => {}
            status => {
                tracing::debug!("standalone stream request returned status {status}");
            }
        }

        Ok(ReceiverStream::new(event_rx))
    }

    async fn send(
        &self,
        message: &serde_json::Value,
        _related_request_id: Option<&RequestId>,
    ) -> TransportResult<()> {
        if self.is_shut_down().await {
            return Err(TransportError::SendFailure("transport is shut down".into()));
        }
        let traced = self
            .traced
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::SendFailure("transport not started".into()))?;

        let mut headers = self.request_headers().await?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(
            ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream"),
        );

        let payload = serde_json::to_string(message)
            .map_err(|err| TransportError::SendFailure(err.to_string()))?;
        let response = traced
            .execute(Method::POST, &self.url, headers, Some(payload))
            .await?;

        self.capture_session_id(&response.headers).await;

        if response.status == 404 && self.session_id.read().await.is_some() {
            return Err(TransportError::SessionExpired);
        }
        if !response.is_success() {
            return Err(TransportError::HttpStatus(response.status));
        }

        let content_type = response.content_type().unwrap_or_default();
        if is_streaming_content_type(&content_type) {
            let event_tx = self
                .event_tx
                .read()
                .await
                .clone()
                .ok_or_else(|| TransportError::Internal("event channel not initialized".into()))?;
            let shutdown_rx = {
                let lock = self.shutdown_tx.read().await;
                lock.as_ref()
                    .map(|tx| tx.subscribe())
                    .ok_or_else(|| TransportError::SendFailure("transport not started".into()))?
            };
            if let Some(stream) = response.into_stream() {
                Self::spawn_stream_pump(stream, event_tx, shutdown_rx);
            }
        } else if let Some(body) = response.text() {
            self.emit_json_body(body).await?;
        }
        Ok(())
    }

    async fn shut_down(&self) -> TransportResult<()> {
        {
            let mut lock = self.is_shut_down.lock().await;
            if *lock {
                return Ok(());
            }
            *lock = true;
        }
        let lock = self.shutdown_tx.write().await;
        if let Some(tx) = lock.as_ref() {
            let _ = tx.send(true);
        }
        drop(lock);
        {
            let mut traced = self.traced.write().await;
            *traced = None;
        }
        {
            let mut event_tx = self.event_tx.write().await;
            *event_tx = None;
        }
        Ok(())
    }

    async fn is_shut_down(&self) -> bool {
        *self.is_shut_down.lock().await
    }

    async fn session_id(&self) -> Option<SessionId> {
        self.session_id.read().await.clone()
    }
}
