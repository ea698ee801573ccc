use serde::{Deserialize, Serialize};

/// A pre-issued OAuth token set, as delivered by the broker client on
/// connect. Field names follow the token endpoint response of RFC 6749.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OauthTokens {
    /// The access token string issued by the authorization server.
    pub access_token: String,

    /// The token type, typically `"Bearer"`.
    pub token_type: String,

    /// Lifetime of the access token in seconds, when the server reported one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,

    /// Refresh token, carried through for the client's benefit; the broker
    /// never exchanges it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,

    /// Space-separated scopes granted by the authorization server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
}

/// Read-only adapter over already-acquired credentials.
///
/// The broker performs no OAuth ceremony of its own; the client runs the
/// flow and hands the resulting tokens over on connect. This type's only job
/// is to surface those tokens to the http-based transports as an
/// `Authorization` header value. There is deliberately no save / refresh /
/// clear surface here.
#[derive(Debug, Clone, Default)]
pub struct TokenInjector {
    tokens: Option<OauthTokens>,
}

impl TokenInjector {
    pub fn new(tokens: Option<OauthTokens>) -> Self {
        Self { tokens }
    }

    pub fn tokens(&self) -> Option<&OauthTokens> {
        self.tokens.as_ref()
    }

    /// Renders the `Authorization` header value, when tokens are present.
    pub fn authorization_header(&self) -> Option<String> {
        self.tokens
            .as_ref()
            .map(|t| format!("Bearer {}", t.access_token))
    }
}
