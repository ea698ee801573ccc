use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::Router;

use mcp_inspector_transport::TransportOptions;

use crate::app_state::AppState;
use crate::config::{self, InitialConfig};
use crate::error::{BrokerError, BrokerResult};
use crate::registry::SessionRegistry;
use crate::routes::app_routes;
use crate::session::DEFAULT_EVENT_QUEUE_LIMIT;
use crate::storage::KvStore;

// Default broker port; the companion web client conventionally runs on 6274.
const DEFAULT_PORT: u16 = 6277;

// Default origins of the local inspector client.
const DEFAULT_ALLOWED_ORIGINS: &[&str] =
    &["http://localhost:6274", "http://127.0.0.1:6274"];

// Timeout for endpoints that touch the upstream (the events stream is exempt).
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// Bound on the graceful drain after a shutdown signal.
const SHUTDOWN_DRAIN: Duration = Duration::from_secs(5);

/// Configuration struct for the broker server.
pub struct BrokerOptions {
    /// Hostname or IP address the server will bind to (default: "127.0.0.1")
    pub host: String,
    pub port: u16,
    /// Origin allowlist; empty disables origin validation.
    pub allowed_origins: Vec<String>,
    /// Bearer token required in `x-mcp-remote-auth`; `None` disables auth
    /// (the dangerous override; origin validation still applies).
    pub api_token: Option<String>,
    /// Root directory of the KV store.
    pub storage_dir: PathBuf,
    /// Per-session event queue bound.
    pub event_queue_limit: usize,
    pub request_timeout: Duration,
    /// Initial configuration served on `GET /api/config`.
    pub initial_config: InitialConfig,
    /// Shared transport configuration for upstream connections.
    pub transport_options: TransportOptions,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            allowed_origins: DEFAULT_ALLOWED_ORIGINS
                .iter()
                .map(|s| s.to_string())
                .collect(),
            api_token: None,
            storage_dir: config::resolve_storage_dir(),
            event_queue_limit: DEFAULT_EVENT_QUEUE_LIMIT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            initial_config: InitialConfig::default(),
            transport_options: TransportOptions::default(),
        }
    }
}

impl BrokerOptions {
    /// Assembles options from the environment (see `config` for the
    /// variable names).
    pub fn from_env() -> Self {
        let api_token = if config::env_flag(config::DANGEROUSLY_OMIT_AUTH_ENV) {
            tracing::warn!(
                "{} is set: bearer auth is DISABLED (origin validation remains)",
                config::DANGEROUSLY_OMIT_AUTH_ENV
            );
            None
        } else {
            let (token, generated) = config::resolve_api_token();
            if generated {
                tracing::info!("generated a session token; it is printed at startup");
            }
            Some(token)
        };

        let mut options = Self {
            api_token,
            storage_dir: config::resolve_storage_dir(),
            initial_config: InitialConfig::from_env(),
            ..Self::default()
        };

        if let Ok(host) = std::env::var("HOST") {
            if !host.is_empty() {
                options.host = host;
            }
        }
        if let Some(port) = std::env::var("PORT")
            .ok()
            .and_then(|p| p.parse::<u16>().ok())
        {
            options.port = port;
        }
        if let Ok(origins) = std::env::var("ALLOWED_ORIGINS") {
            if !origins.is_empty() {
                options.allowed_origins = origins
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect();
            }
        }

        options
    }

    /// Resolves the server address from host and port, tolerating a scheme
    /// prefix on the host.
    pub fn resolve_server_address(&self) -> BrokerResult<SocketAddr> {
        let mut host = self.host.clone();
        for scheme in ["http://", "https://"] {
            if let Some(stripped) = host.strip_prefix(scheme) {
                host = stripped.to_string();
            }
        }

        let mut iter = (host.as_str(), self.port)
            .to_socket_addrs()
            .map_err(|err| BrokerError::Internal(format!("Server start error: {err}")))?;
        iter.next().ok_or_else(|| {
            BrokerError::Internal(format!(
                "Server start error: could not resolve {}:{}",
                self.host, self.port
            ))
        })
    }
}

/// The long-lived broker process: owns the session registry and the HTTP
/// surface, and drains sessions on SIGINT/SIGTERM.
pub struct BrokerServer {
    app: Router,
    state: Arc<AppState>,
    options: BrokerOptions,
}

impl BrokerServer {
    pub fn new(options: BrokerOptions) -> Self {
        let registry = Arc::new(SessionRegistry::new(
            options.transport_options.clone(),
            options.event_queue_limit,
        ));
        let state = Arc::new(AppState {
            registry,
            storage: KvStore::new(options.storage_dir.clone()),
            initial_config: options.initial_config.clone(),
            allowed_origins: options.allowed_origins.clone(),
            api_token: options.api_token.clone(),
            request_timeout: options.request_timeout,
            http_client: reqwest::Client::new(),
        });
        let app = app_routes(Arc::clone(&state));
        Self {
            app,
            state,
            options,
        }
    }

    /// Returns a shared reference to the application state.
    pub fn state(&self) -> Arc<AppState> {
        Arc::clone(&self.state)
    }

    /// Binds and serves until a shutdown signal arrives, then closes every
    /// session and drains within a bounded window.
    pub async fn start(self) -> BrokerResult<()> {
        let handle = axum_server::Handle::new();

        let shutdown_handle = handle.clone();
        let registry = Arc::clone(&self.state.registry);
        tokio::spawn(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, closing sessions");
            registry.shutdown_all().await;
            shutdown_handle.graceful_shutdown(Some(SHUTDOWN_DRAIN));
        });

        self.serve(handle).await
    }

    /// Binds and serves on the caller-supplied handle. `handle.listening()`
    /// reports the bound address, which is how tests (and port-0 setups)
    /// learn the actual port.
    pub async fn serve(self, handle: axum_server::Handle) -> BrokerResult<()> {
        let addr = self.options.resolve_server_address()?;

        tracing::info!("Broker is available at http://{addr}");
        if let Some(token) = &self.options.api_token {
            tracing::info!("Session token: {token}");
            tracing::info!("Use it as: x-mcp-remote-auth: Bearer {token}");
        }

        axum_server::bind(addr)
            .handle(handle)
            .serve(self.app.into_make_service())
            .await
            .map_err(|err| BrokerError::Internal(format!("Server start error: {err}")))
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigint = match signal(SignalKind::interrupt()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!("failed to install SIGINT handler: {err}");
                return std::future::pending().await;
            }
        };
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(sig) => sig,
            Err(err) => {
                tracing::error!("failed to install SIGTERM handler: {err}");
                return std::future::pending().await;
            }
        };
        tokio::select! {
            _ = sigint.recv() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_address_strips_scheme() {
        let options = BrokerOptions {
            host: "http://127.0.0.1".into(),
            port: 6277,
            ..Default::default()
        };
        let addr = options.resolve_server_address().unwrap();
        assert_eq!(addr.to_string(), "127.0.0.1:6277");
    }

    #[test]
    fn test_default_options_carry_local_client_origins() {
        let options = BrokerOptions::default();
        assert!(options
            .allowed_origins
            .iter()
            .any(|o| o == "http://localhost:6274"));
        assert_eq!(options.port, 6277);
    }
}
