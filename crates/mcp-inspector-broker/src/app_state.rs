use std::sync::Arc;
use std::time::Duration;

use crate::config::InitialConfig;
use crate::registry::SessionRegistry;
use crate::storage::KvStore;

/// Shared application state handed to every handler and middleware.
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<SessionRegistry>,
    pub storage: KvStore,
    pub initial_config: InitialConfig,
    /// Origin allowlist; empty disables the origin check.
    pub allowed_origins: Vec<String>,
    /// Bearer token compared against `x-mcp-remote-auth`; `None` when auth
    /// was dangerously omitted.
    pub api_token: Option<String>,
    /// Timeout for upstream-touching endpoints (connect/send/fetch). The
    /// events stream is exempt.
    pub request_timeout: Duration,
    /// Shared client for the `/api/fetch` proxy.
    pub http_client: reqwest::Client,
}
