use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Client, Method};
use tokio::sync::watch::Sender;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio_stream::wrappers::ReceiverStream;

use crate::error::{TransportError, TransportResult};
use crate::event::TransportEvent;
use crate::fetch_tracer::{TraceCategory, TracedClient};
use crate::transport::{RequestId, Transport, TransportOptions};
use crate::utils::sse_parser::SseParser;
use crate::utils::validate_headers;
use crate::TokenInjector;

const CHANNEL_CAPACITY: usize = 64;
const DEFAULT_MAX_RETRIES: usize = 2;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);
const ENDPOINT_SSE_EVENT: &str = "endpoint";

/// Transport for the legacy HTTP+SSE upstream flavor.
///
/// The server pushes frames on a long-lived `text/event-stream` GET; the
/// client POSTs frames to a per-session messages endpoint announced through
/// the stream's first `endpoint` event. `start` does not return until that
/// handshake completes, so a refused or unauthorized stream fails connect
/// instead of surfacing as a later close.
pub struct SseTransport {
    url: String,
    custom_headers: Option<HashMap<String, String>>,
    injector: TokenInjector,
    options: TransportOptions,
    client: Client,
    endpoint_url: tokio::sync::RwLock<Option<String>>,
    traced: tokio::sync::RwLock<Option<TracedClient>>,
    shutdown_tx: tokio::sync::RwLock<Option<Sender<bool>>>,
    is_shut_down: Mutex<bool>,
}

impl SseTransport {
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
            endpoint_url: tokio::sync::RwLock::new(None),
            traced: tokio::sync::RwLock::new(None),
            shutdown_tx: tokio::sync::RwLock::new(None),
            is_shut_down: Mutex::new(false),
        })
    }

    fn request_headers(&self) -> TransportResult<HeaderMap> {
        let mut headers = validate_headers(&self.custom_headers)?;
        if let Some(authorization) = self.injector.authorization_header() {
            let value = HeaderValue::from_str(&authorization).map_err(|e| {
                TransportError::Configuration {
                    message: format!("Invalid access token: {e}"),
                }
            })?;
            headers.insert(AUTHORIZATION, value);
        }
        Ok(headers)
    }

    /// Resolves the `endpoint` event payload against the SSE URL.
    fn resolve_endpoint(base: &str, endpoint: &str) -> TransportResult<String> {
        let base = url::Url::parse(base).map_err(|e| TransportError::Configuration {
            message: format!("Invalid SSE URL: {e}"),
        })?;
        let resolved = base
            .join(endpoint)
            .map_err(|e| TransportError::Configuration {
                message: format!("Invalid endpoint event payload '{endpoint}': {e}"),
            })?;
        Ok(resolved.to_string())
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> TransportResult<ReceiverStream<TransportEvent>> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        {
            let mut lock = self.shutdown_tx.write().await;
            *lock = Some(shutdown_tx);
        }

        let (event_tx, event_rx) = mpsc::channel::<TransportEvent>(CHANNEL_CAPACITY);

        // Fetch traces ride the same event channel as frames so the session
        // sequencer sees them in arrival order.
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

        let mut headers = self.request_headers()?;
        headers.insert(ACCEPT, HeaderValue::from_static("text/event-stream"));

        // Initial subscribe; failures here are start failures.
        let response = tokio::time::timeout(
            self.options.timeout,
            traced.execute(Method::GET, &self.url, headers.clone(), None),
        )
        .await
        .map_err(|_| {
            TransportError::FailedToOpenSseStream("timed out waiting for SSE stream".into())
        })??;

        if !response.is_success() {
            return Err(TransportError::HttpStatus(response.status));
        }
        let content_type = response.content_type().unwrap_or_default();
        let first_response = response.into_stream().ok_or_else(|| {
            TransportError::UnexpectedContentType(content_type)
        })?;

        let (endpoint_tx, endpoint_rx) = oneshot::channel::<String>();
        let pump = SsePump {
            traced,
            url: self.url.clone(),
            headers,
            event_tx,
            shutdown_rx,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_delay: DEFAULT_RETRY_DELAY,
        };
        tokio::spawn(pump.run(first_response, endpoint_tx));

        // The handshake is the first `endpoint` event.
        let endpoint = tokio::time::timeout(self.options.timeout, endpoint_rx)
            .await
            .map_err(|_| {
                TransportError::FailedToOpenSseStream(
                    "timed out waiting for endpoint event".into(),
                )
            })?
            .map_err(|_| {
                TransportError::FailedToOpenSseStream(
                    "SSE stream closed before endpoint event".into(),
                )
            })?;
        let endpoint = Self::resolve_endpoint(&self.url, &endpoint)?;
        {
            let mut lock = self.endpoint_url.write().await;
            *lock = Some(endpoint);
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
        let endpoint = self
            .endpoint_url
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::SendFailure("SSE endpoint not established".into()))?;
        let traced = self
            .traced
            .read()
            .await
            .clone()
            .ok_or_else(|| TransportError::SendFailure("transport not started".into()))?;

        let mut headers = self.request_headers()?;
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let payload = serde_json::to_string(message)
            .map_err(|err| TransportError::SendFailure(err.to_string()))?;
        let response = traced
            .execute(Method::POST, &endpoint, headers, Some(payload))
            .await?;
        if !response.is_success() {
            return Err(TransportError::HttpStatus(response.status));
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
        // Dropping our traced clone lets the trace forwarder (and with it
        // the event stream) wind down once the pump exits.
        let mut traced = self.traced.write().await;
        *traced = None;
        Ok(())
    }

    async fn is_shut_down(&self) -> bool {
        *self.is_shut_down.lock().await
    }
}

/// The long-lived stream reader: parses chunks, reconnects on stream loss,
/// and reports exhaustion as a terminal event pair.
struct SsePump {
    traced: TracedClient,
    url: String,
    headers: HeaderMap,
    event_tx: mpsc::Sender<TransportEvent>,
    shutdown_rx: watch::Receiver<bool>,
    max_retries: usize,
    retry_delay: Duration,
}

impl SsePump {
    async fn run(mut self, first_response: reqwest::Response, endpoint_tx: oneshot::Sender<String>) {
        let mut endpoint_tx = Some(endpoint_tx);
        let mut response = Some(first_response);
        let mut retry_count = 0;

        loop {
            let current = match response.take() {
                Some(current) => current,
                None => {
                    if *self.shutdown_rx.borrow() {
                        return;
                    }
                    match self
                        .traced
                        .execute(Method::GET, &self.url, self.headers.clone(), None)
                        .await
                    {
                        Ok(reconnected) if reconnected.is_success() => {
                            match reconnected.into_stream() {
                                Some(stream) => {
                                    retry_count = 0;
                                    stream
                                }
                                None => {
                                    self.fail(
                                        "SSE reconnect returned a non-streaming response".into(),
                                    )
                                    .await;
                                    return;
                                }
                            }
                        }
                        // A definitive refusal (401, 404) is terminal.
                        Ok(reconnected) => {
                            self.fail(format!(
                                "SSE reconnect failed with status {}",
                                reconnected.status
                            ))
                            .await;
                            return;
                        }
                        Err(err) => {
                            retry_count += 1;
                            if retry_count > self.max_retries {
                                self.fail(format!("SSE reconnect failed: {err}")).await;
                                return;
                            }
                            tokio::time::sleep(self.retry_delay).await;
                            continue;
                        }
                    }
                }
            };

            match self.drain_stream(current, &mut endpoint_tx).await {
                StreamOutcome::Shutdown => return,
                StreamOutcome::Lost(reason) => {
                    retry_count += 1;
                    if retry_count > self.max_retries {
                        self.fail(format!("SSE stream lost: {reason}")).await;
                        return;
                    }
                    tokio::time::sleep(self.retry_delay).await;
                }
            }
        }
    }

    /// Reads one response stream to its end, emitting message events.
    async fn drain_stream(
        &mut self,
        response: reqwest::Response,
        endpoint_tx: &mut Option<oneshot::Sender<String>>,
    ) -> StreamOutcome {
        let mut parser = SseParser::new();
        let mut stream = response.bytes_stream();

        loop {
            let chunk = tokio::select! {
                chunk = stream.next() => chunk,
                _ = self.shutdown_rx.changed() => return StreamOutcome::Shutdown,
            };

            let bytes = match chunk {
                Some(Ok(bytes)) => bytes,
                Some(Err(err)) => return StreamOutcome::Lost(err.to_string()),
                None => return StreamOutcome::Lost("stream ended".into()),
            };

            for event in parser.process_chunk(&bytes) {
                let Some(data) = event.data else { continue };
                match event.event.as_deref() {
                    Some(ENDPOINT_SSE_EVENT) => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(data.trim().to_string());
                        }
                    }
                    Some("message") | None => {
                        let frame: serde_json::Value = match serde_json::from_str(&data) {
                            Ok(frame) => frame,
                            Err(_) => {
                                tracing::warn!("skipping malformed SSE message: {data}");
                                continue;
                            }
                        };
                        if self
                            .event_tx
                            .send(TransportEvent::Message(frame))
                            .await
                            .is_err()
                        {
                            return StreamOutcome::Shutdown;
                        }
                    }
                    Some(other) => {
                        tracing::debug!("ignoring SSE event of type '{other}'");
                    }
                }
            }
        }
    }

    async fn fail(&self, message: String) {
        let _ = self
            .event_tx
            .send(TransportEvent::Error {
                message,
                code: None,
            })
            .await;
        let _ = self.event_tx.send(TransportEvent::Closed).await;
    }
}

enum StreamOutcome {
    /// Deliberate shutdown was requested.
    Shutdown,
    /// The stream ended or errored; reconnect may be attempted.
    Lost(String),
}
