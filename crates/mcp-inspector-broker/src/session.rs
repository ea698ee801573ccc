use std::collections::VecDeque;
use std::pin::pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::sync::Notify;

use mcp_inspector_transport::{FetchTraceEntry, RequestId, Transport};

use crate::error::{BrokerError, BrokerResult};
use crate::SessionId;

pub const DEFAULT_EVENT_QUEUE_LIMIT: usize = 4096;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// One event on a session's wire to the client, in SSE terms.
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// An upstream JSON-RPC frame, forwarded verbatim.
    Message(Value),
    /// One line of upstream stderr.
    Stderr {
        timestamp: DateTime<Utc>,
        message: String,
    },
    /// One traced HTTP request.
    FetchRequest(FetchTraceEntry),
    /// Terminal: the upstream transport died. Always the last event.
    TransportError {
        error: String,
        code: Option<i64>,
    },
}

impl SessionEvent {
    /// SSE event name on the wire.
    pub fn name(&self) -> &'static str {
        match self {
            SessionEvent::Message(_) => "message",
            SessionEvent::Stderr { .. } => "stderr",
            SessionEvent::FetchRequest(_) => "fetch_request",
            SessionEvent::TransportError { .. } => "transport_error",
        }
    }

    /// SSE data payload on the wire.
    pub fn data(&self) -> Value {
        match self {
            SessionEvent::Message(frame) => frame.clone(),
            SessionEvent::Stderr { timestamp, message } => json!({
                "timestamp": timestamp,
                "message": message,
            }),
            SessionEvent::FetchRequest(entry) => {
                serde_json::to_value(entry).unwrap_or_default()
            }
            SessionEvent::TransportError { error, code } => match code {
                Some(code) => json!({ "error": error, "code": code }),
                None => json!({ "error": error }),
            },
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(self, SessionEvent::TransportError { .. })
    }
}

#[derive(Default)]
struct SessionState {
    queue: VecDeque<SessionEvent>,
    /// Bumped on every consumer bind; a stale generation means the consumer
    /// was preempted and must stop.
    consumer_generation: u64,
    consumer_attached: bool,
    /// Monotonic: once true, never false again.
    transport_dead: bool,
    terminal_enqueued: bool,
    last_error: Option<String>,
    last_error_code: Option<i64>,
}

/// A broker-held handle tying one client to one upstream transport.
///
/// The session is the single sequencer: frames, stderr lines, and fetch
/// traces are queued in arrival order and drained strictly FIFO by at most
/// one consumer. All mutable state sits behind one short-lived lock; nothing
/// awaits while holding it.
pub struct Session {
    id: SessionId,
    transport: Box<dyn Transport>,
    state: Mutex<SessionState>,
    notify: Notify,
    queue_limit: usize,
}

impl Session {
    pub(crate) fn new(id: SessionId, transport: Box<dyn Transport>, queue_limit: usize) -> Self {
        Self {
            id,
            transport,
            state: Mutex::new(SessionState::default()),
            notify: Notify::new(),
            queue_limit: queue_limit.max(1),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn state(&self) -> MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn is_dead(&self) -> bool {
        self.state().transport_dead
    }

    pub fn has_consumer(&self) -> bool {
        self.state().consumer_attached
    }

    pub fn last_error(&self) -> Option<String> {
        self.state().last_error.clone()
    }

    /// Numeric code (JSON-RPC or HTTP status) attached to the terminal
    /// error, when the transport reported one.
    pub fn last_error_code(&self) -> Option<i64> {
        self.state().last_error_code
    }

    /// Enqueues one event, enforcing the queue contract: bounded with
    /// drop-oldest for non-terminal events, exactly one terminal event, and
    /// nothing at all after it.
    pub(crate) fn push(&self, event: SessionEvent) {
        {
            let mut st = self.state();
            if st.terminal_enqueued {
                return;
            }
            if event.is_terminal() {
                if let SessionEvent::TransportError { error, code } = &event {
                    st.last_error = Some(error.clone());
                    st.last_error_code = *code;
                }
                st.transport_dead = true;
                st.terminal_enqueued = true;
                st.queue.push_back(event);
            } else {
                st.queue.push_back(event);
                if st.queue.len() > self.queue_limit {
                    st.queue.pop_front();
                }
            }
        }
        self.notify.notify_waiters();
    }

    /// Binds the caller as the session's consumer, preempting any previous
    /// one. Everything queued since the last consumer detached is delivered
    /// first, in FIFO order.
    pub fn bind_consumer(self: &Arc<Self>) -> SessionConsumer {
        let generation = {
            let mut st = self.state();
            st.consumer_generation += 1;
            st.consumer_attached = true;
            st.consumer_generation
        };
        // Wake a preempted consumer so it observes the generation change.
        self.notify.notify_waiters();
        SessionConsumer {
            session: Arc::clone(self),
            generation,
        }
    }

    /// Relays one frame upstream. Rejected once the transport is dead, with
    /// the preserved error text.
    pub async fn send(
        &self,
        message: &Value,
        related_request_id: Option<&RequestId>,
    ) -> BrokerResult<()> {
        {
            let st = self.state();
            if st.transport_dead {
                let error = st
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "Transport closed".to_string());
                return Err(BrokerError::Upstream(error));
            }
        }
        self.transport
            .send(message, related_request_id)
            .await
            .map_err(|err| BrokerError::Upstream(err.to_string()))
    }

    /// Closes the transport, bounded in time; errors are logged and
    /// swallowed.
    pub async fn close(&self) {
        match tokio::time::timeout(SHUTDOWN_TIMEOUT, self.transport.shut_down()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => {
                tracing::warn!("error shutting down transport for session {}: {err}", self.id);
            }
            Err(_) => {
                tracing::warn!(
                    "transport shutdown for session {} timed out after {SHUTDOWN_TIMEOUT:?}",
                    self.id
                );
            }
        }
    }
}

/// The borrowed consumer slot of a [`Session`].
///
/// Dropping the handle detaches the consumer; the session keeps running and
/// accumulating events while the transport is alive.
pub struct SessionConsumer {
    session: Arc<Session>,
    generation: u64,
}

impl SessionConsumer {
    pub fn session_id(&self) -> &str {
        self.session.id()
    }

    /// The next event in FIFO order.
    ///
    /// Returns `None` when this consumer was preempted by a newer binding.
    /// After the terminal event is delivered the queue stays empty forever
    /// and this simply blocks; the stream to the client stays open (with
    /// keep-alives) until the client goes away.
    pub async fn next_event(&mut self) -> Option<SessionEvent> {
        loop {
            let mut notified = pin!(self.session.notify.notified());
            notified.as_mut().enable();
            {
                let mut st = self.session.state();
                if st.consumer_generation != self.generation {
                    return None;
                }
                if let Some(event) = st.queue.pop_front() {
                    return Some(event);
                }
            }
            notified.await;
        }
    }
}

impl Drop for SessionConsumer {
    fn drop(&mut self) {
        let mut st = self.session.state();
        if st.consumer_generation == self.generation {
            st.consumer_attached = false;
        }
    }
}
