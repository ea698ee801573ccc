use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt::Write as _;
use std::path::PathBuf;

/// Primary bearer-token variable.
pub const API_TOKEN_ENV: &str = "MCP_INSPECTOR_API_TOKEN";
/// Legacy name, honored when the primary is unset.
pub const LEGACY_API_TOKEN_ENV: &str = "MCP_PROXY_AUTH_TOKEN";
/// Disables bearer auth (origin validation remains).
pub const DANGEROUSLY_OMIT_AUTH_ENV: &str = "DANGEROUSLY_OMIT_AUTH";
/// Overrides the KV storage root.
pub const STORAGE_DIR_ENV: &str = "MCP_STORAGE_DIR";
/// Switches the tracing subscriber's writer to an append-mode file.
pub const LOG_FILE_ENV: &str = "MCP_LOG_FILE";

/// Read-only "initial configuration" document served on `GET /api/config`,
/// assembled from the environment once at startup. The UI uses it to
/// pre-fill its connect form.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitialConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_args: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_transport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_server_url: Option<String>,
    pub default_environment: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_url: Option<String>,
}

impl InitialConfig {
    /// Reads the `MCP_INITIAL_*` seed variables.
    pub fn from_env() -> Self {
        Self {
            default_command: non_empty_env("MCP_INITIAL_COMMAND"),
            default_args: non_empty_env("MCP_INITIAL_ARGS"),
            default_transport: non_empty_env("MCP_INITIAL_TRANSPORT"),
            default_server_url: non_empty_env("MCP_INITIAL_SERVER_URL"),
            default_environment: env_vars_from_env(),
            sandbox_url: non_empty_env("MCP_SANDBOX_URL"),
        }
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn env_vars_from_env() -> HashMap<String, String> {
    let Some(raw) = non_empty_env("MCP_ENV_VARS") else {
        return HashMap::new();
    };
    match serde_json::from_str::<HashMap<String, String>>(&raw) {
        Ok(vars) => vars,
        Err(err) => {
            tracing::warn!("ignoring malformed MCP_ENV_VARS: {err}");
            HashMap::new()
        }
    }
}

/// The bearer token to enforce: the configured one, or a freshly generated
/// 32-byte random hex token. The second element reports whether the token
/// was generated (so the caller can print it for the operator).
pub fn resolve_api_token() -> (String, bool) {
    if let Some(token) = non_empty_env(API_TOKEN_ENV) {
        return (token, false);
    }
    if let Some(token) = non_empty_env(LEGACY_API_TOKEN_ENV) {
        tracing::warn!("{LEGACY_API_TOKEN_ENV} is deprecated; use {API_TOKEN_ENV}");
        return (token, false);
    }
    (generate_token(), true)
}

fn generate_token() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut token = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(token, "{byte:02x}");
    }
    token
}

/// Truthy check for opt-in environment switches.
pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .map(|v| !v.is_empty() && v != "0" && !v.eq_ignore_ascii_case("false"))
        .unwrap_or(false)
}

/// KV storage root: `MCP_STORAGE_DIR`, else `$HOME/.mcp-inspector/storage`
/// (platform equivalent on Windows).
pub fn resolve_storage_dir() -> PathBuf {
    if let Some(dir) = non_empty_env(STORAGE_DIR_ENV) {
        return PathBuf::from(dir);
    }
    home_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join(".mcp-inspector")
        .join("storage")
}

fn home_dir() -> Option<PathBuf> {
    #[cfg(unix)]
    let home = std::env::var_os("HOME");
    #[cfg(windows)]
    let home = std::env::var_os("USERPROFILE");
    home.filter(|v| !v.is_empty()).map(PathBuf::from)
}
