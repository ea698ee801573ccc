use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use tokio::sync::RwLock;
use tokio_stream::wrappers::ReceiverStream;

use mcp_inspector_transport::error::TransportResult;
use mcp_inspector_transport::{
    create_transport, OauthTokens, ServerConfig, TokenInjector, Transport, TransportEvent,
    TransportOptions,
};

use crate::session::{Session, SessionEvent};
use crate::SessionId;

/// Process-wide mapping from session id to [`Session`].
///
/// The registry exclusively owns every session; lookups are O(1) reads and
/// all mutations go through the write lock. The lock is never held across
/// transport I/O.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    transport_options: TransportOptions,
    queue_limit: usize,
}

impl SessionRegistry {
    pub fn new(transport_options: TransportOptions, queue_limit: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            transport_options,
            queue_limit,
        }
    }

    /// Builds and starts the transport described by `config`, then inserts a
    /// session owning it. Start failures (spawn errors, upstream 401) are
    /// returned to the caller; nothing is inserted in that case.
    pub async fn create(
        self: &Arc<Self>,
        config: &ServerConfig,
        tokens: Option<OauthTokens>,
    ) -> TransportResult<SessionId> {
        tracing::debug!("creating session for {} upstream", config.kind());
        let transport = create_transport(
            config,
            TokenInjector::new(tokens),
            self.transport_options.clone(),
        )?;
        self.register(transport).await
    }

    /// Starts `transport` and wires it into a new session. Split from
    /// [`SessionRegistry::create`] so tests can drive sessions with an
    /// in-process transport.
    pub(crate) async fn register(
        self: &Arc<Self>,
        transport: Box<dyn Transport>,
    ) -> TransportResult<SessionId> {
        let events = transport.start().await?;
        let id = uuid::Uuid::new_v4().simple().to_string();
        let session = Arc::new(Session::new(id.clone(), transport, self.queue_limit));
        {
            let mut sessions = self.sessions.write().await;
            sessions.insert(id.clone(), Arc::clone(&session));
        }
        tokio::spawn(pump_events(session, events));
        tracing::info!("session {id} connected");
        Ok(id)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        let sessions = self.sessions.read().await;
        sessions.get(id).cloned()
    }

    /// Closes the session's transport and drops the entry. Safe to call for
    /// unknown ids and safe to call repeatedly.
    pub async fn delete(&self, id: &str) {
        let session = {
            let mut sessions = self.sessions.write().await;
            sessions.remove(id)
        };
        if let Some(session) = session {
            session.close().await;
            tracing::info!("session {id} disconnected");
        }
    }

    /// Reap policy: a session that is transport-dead with no consumer bound
    /// has nobody left to observe it and is removed. Invoked when a consumer
    /// unbinds: a dead session keeps its queued events until a client has
    /// had the chance to read them.
    pub async fn reap_if_unconsumed(&self, id: &str) {
        let should_remove = {
            let sessions = self.sessions.read().await;
            sessions
                .get(id)
                .is_some_and(|s| s.is_dead() && !s.has_consumer())
        };
        if should_remove {
            tracing::debug!("reaping dead session {id}");
            self.delete(id).await;
        }
    }

    pub async fn size(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Best-effort close of every session; errors are logged and swallowed
    /// inside [`Session::close`].
    pub async fn shutdown_all(&self) {
        let sessions: Vec<(SessionId, Arc<Session>)> = {
            let mut lock = self.sessions.write().await;
            lock.drain().collect()
        };
        for (id, session) in sessions {
            tracing::debug!("shutting down session {id}");
            session.close().await;
        }
    }
}

/// Per-session pump: moves transport events into the session queue in
/// arrival order and folds the terminal `Error`/`Closed` pair into exactly
/// one `transport_error` event. The session itself stays registered until a
/// disconnect or the unbind-time reap policy removes it, so a client that
/// binds late still observes the death.
async fn pump_events(session: Arc<Session>, mut events: ReceiverStream<TransportEvent>) {
    let mut last_error: Option<(String, Option<i64>)> = None;

    while let Some(event) = events.next().await {
        match event {
            TransportEvent::Message(frame) => session.push(SessionEvent::Message(frame)),
            TransportEvent::Stderr { timestamp, line } => session.push(SessionEvent::Stderr {
                timestamp,
                message: line,
            }),
            TransportEvent::FetchTrace(entry) => {
                session.push(SessionEvent::FetchRequest(entry))
            }
            TransportEvent::Error { message, code } => {
                last_error = Some((message, code));
            }
            TransportEvent::Closed => break,
        }
    }

    // The stream ending without a `Closed` means the transport dropped its
    // sender; either way the upstream is gone.
    let (error, code) =
        last_error.unwrap_or_else(|| ("Transport closed".to_string(), None));
    session.push(SessionEvent::TransportError { error, code });
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcp_inspector_transport::error::TransportError;
    use mcp_inspector_transport::RequestId;
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio::sync::mpsc;

    /// Transport driven from the test through a channel handed out at
    /// construction.
    struct ScriptedTransport {
        events: std::sync::Mutex<Option<mpsc::Receiver<TransportEvent>>>,
    }

    impl ScriptedTransport {
        fn new() -> (Self, mpsc::Sender<TransportEvent>) {
            let (tx, rx) = mpsc::channel(16);
            (
                Self {
                    events: std::sync::Mutex::new(Some(rx)),
                },
                tx,
            )
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn start(&self) -> TransportResult<ReceiverStream<TransportEvent>> {
            let rx = self
                .events
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .take()
                .ok_or_else(|| TransportError::Internal("started twice".into()))?;
            Ok(ReceiverStream::new(rx))
        }

        async fn send(&self, _: &Value, _: Option<&RequestId>) -> TransportResult<()> {
            Ok(())
        }

        async fn shut_down(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn is_shut_down(&self) -> bool {
            false
        }
    }

    /// Transport that refuses to start.
    struct BrokenTransport;

    #[async_trait]
    impl Transport for BrokenTransport {
        async fn start(&self) -> TransportResult<ReceiverStream<TransportEvent>> {
            Err(TransportError::ProcessError(
                "failed to spawn 'missing'".into(),
            ))
        }

        async fn send(&self, _: &Value, _: Option<&RequestId>) -> TransportResult<()> {
            Err(TransportError::SendFailure("never started".into()))
        }

        async fn shut_down(&self) -> TransportResult<()> {
            Ok(())
        }

        async fn is_shut_down(&self) -> bool {
            true
        }
    }

    fn registry() -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(TransportOptions::default(), 64))
    }

    #[tokio::test]
    async fn test_start_failure_inserts_nothing() {
        let registry = registry();
        let result = registry.register(Box::new(BrokenTransport)).await;
        assert!(result.is_err());
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_register_then_delete_restores_size() {
        let registry = registry();
        let (transport, _tx) = ScriptedTransport::new();
        let id = registry.register(Box::new(transport)).await.unwrap();
        assert_eq!(registry.size().await, 1);
        assert!(registry.get(&id).await.is_some());

        registry.delete(&id).await;
        assert_eq!(registry.size().await, 0);
        // Idempotent.
        registry.delete(&id).await;
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_pump_folds_error_and_close_into_one_terminal_event() {
        let registry = registry();
        let (transport, tx) = ScriptedTransport::new();
        let id = registry.register(Box::new(transport)).await.unwrap();
        let session = registry.get(&id).await.unwrap();
        let mut consumer = session.bind_consumer();

        tx.send(TransportEvent::Message(json!({"jsonrpc":"2.0","id":1})))
            .await
            .unwrap();
        tx.send(TransportEvent::Error {
            message: "process exited with code 3".into(),
            code: None,
        })
        .await
        .unwrap();
        tx.send(TransportEvent::Closed).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), consumer.next_event())
                .await
                .expect("timed out")
                .expect("event");
            seen.push(event);
        }
        assert!(matches!(seen[0], SessionEvent::Message(_)));
        match &seen[1] {
            SessionEvent::TransportError { error, .. } => {
                assert_eq!(error, "process exited with code 3");
            }
            other => panic!("unexpected event: {other:?}"),
        }
        assert!(session.is_dead());
    }

    #[tokio::test]
    async fn test_dead_session_survives_until_observed() {
        let registry = registry();
        let (transport, tx) = ScriptedTransport::new();
        let id = registry.register(Box::new(transport)).await.unwrap();

        // Kill the transport with no consumer ever bound; the session stays
        // registered so a late client can still read the terminal event.
        tx.send(TransportEvent::Closed).await.unwrap();
        drop(tx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(registry.size().await, 1);
        assert!(registry.get(&id).await.unwrap().is_dead());

        // The unbind-time policy then removes it.
        registry.reap_if_unconsumed(&id).await;
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_dead_session_with_consumer_not_reaped() {
        let registry = registry();
        let (transport, tx) = ScriptedTransport::new();
        let id = registry.register(Box::new(transport)).await.unwrap();
        let session = registry.get(&id).await.unwrap();
        let mut consumer = session.bind_consumer();

        tx.send(TransportEvent::Closed).await.unwrap();
        drop(tx);

        // The consumer observes the terminal event.
        let event = tokio::time::timeout(Duration::from_secs(2), consumer.next_event())
            .await
            .expect("timed out")
            .expect("terminal event");
        assert!(matches!(event, SessionEvent::TransportError { .. }));

        // While the consumer is attached the reap policy does not apply.
        registry.reap_if_unconsumed(&id).await;
        assert_eq!(registry.size().await, 1);

        // Unbinding releases it.
        drop(consumer);
        registry.reap_if_unconsumed(&id).await;
        assert_eq!(registry.size().await, 0);
    }

    #[tokio::test]
    async fn test_shutdown_all_clears_registry() {
        let registry = registry();
        for _ in 0..3 {
            let (transport, tx) = ScriptedTransport::new();
            registry.register(Box::new(transport)).await.unwrap();
            // Keep senders alive long enough; leak them into the runtime.
            std::mem::forget(tx);
        }
        assert_eq!(registry.size().await, 3);
        registry.shutdown_all().await;
        assert_eq!(registry.size().await, 0);
    }
}
