//! Pluggable authentication: credential providers, header injection, and
//! inbound verification.

mod hmac;
mod jwt;
mod providers;

pub use hmac::{HmacAlgorithm, HmacAuth};
pub use jwt::JwtAuth;
pub use providers::{ApiKeyAuth, BasicAuth, BearerAuth, NoAuth};

use crate::error::FabricError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Default header carrying an API key.
pub const DEFAULT_API_KEY_HEADER: &str = "X-API-Key";

/// Authentication configuration, one variant per credential scheme.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthConfig {
    None,
    ApiKey {
        key: String,
        #[serde(default = "default_api_key_header")]
        header: String,
    },
    Bearer {
        token: String,
    },
    Basic {
        username: String,
        password: String,
    },
    Hmac {
        key_id: String,
        secret: String,
        #[serde(default)]
        algorithm: HmacAlgorithm,
    },
    Jwt {
        #[serde(default)]
        token: Option<String>,
        #[serde(default)]
        secret: Option<String>,
        #[serde(default = "default_jwt_algorithm")]
        algorithm: String,
        issuer: String,
        audience: String,
    },
}

fn default_api_key_header() -> String {
    DEFAULT_API_KEY_HEADER.to_string()
}

fn default_jwt_algorithm() -> String {
    "HS256".to_string()
}

/// Inbound request context handed to `authenticate`.
#[derive(Debug, Clone, Default)]
pub struct AuthContext {
    pub headers: HashMap<String, String>,
    pub method: String,
    pub path: String,
    pub body: String,
}

impl AuthContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }

    pub fn with_request(
        mut self,
        method: impl Into<String>,
        path: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        self.method = method.into();
        self.path = path.into();
        self.body = body.into();
        self
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Result of verifying inbound credentials.
#[derive(Debug, Clone, PartialEq)]
pub struct AuthOutcome {
    pub authenticated: bool,
    pub client_id: Option<String>,
    pub method: Option<String>,
    pub claims: Option<Value>,
}

impl AuthOutcome {
    pub fn granted(client_id: impl Into<String>, method: &str) -> Self {
        Self {
            authenticated: true,
            client_id: Some(client_id.into()),
            method: Some(method.to_string()),
            claims: None,
        }
    }

    pub fn granted_with_claims(
        client_id: impl Into<String>,
        method: &str,
        claims: Value,
    ) -> Self {
        Self { claims: Some(claims), ..Self::granted(client_id, method) }
    }

    pub fn denied() -> Self {
        Self { authenticated: false, client_id: None, method: None, claims: None }
    }
}

/// A credential provider: supplies outbound headers and verifies inbound
/// requests.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Short scheme name ("none", "api_key", "hmac", ...).
    fn scheme(&self) -> &'static str;

    /// Headers attached to every outbound request.
    fn headers(&self) -> Result<Vec<(String, String)>, FabricError>;

    /// Headers for a specific request. Schemes that sign the request line
    /// (HMAC) override this; everything else reuses [`headers`](Self::headers).
    fn request_headers(
        &self,
        _method: &str,
        _path: &str,
        _body: &str,
    ) -> Result<Vec<(String, String)>, FabricError> {
        self.headers()
    }

    /// Parameters merged into the transport connection (headers today).
    fn connection_params(&self) -> Result<Vec<(String, String)>, FabricError> {
        self.headers()
    }

    /// Verify inbound credentials.
    async fn authenticate(&self, context: &AuthContext) -> AuthOutcome;
}

/// Holds the active provider for one protocol binding.
///
/// Each `AuthConfig` variant maps to exactly one provider; the mapping is the
/// exhaustive match in [`AuthManager::from_config`].
#[derive(Clone)]
pub struct AuthManager {
    provider: Arc<dyn AuthProvider>,
}

impl Default for AuthManager {
    fn default() -> Self {
        Self::new()
    }
}

impl AuthManager {
    /// Manager with no authentication.
    pub fn new() -> Self {
        Self { provider: Arc::new(NoAuth) }
    }

    pub fn from_config(config: &AuthConfig) -> Result<Self, FabricError> {
        let provider: Arc<dyn AuthProvider> = match config {
            AuthConfig::None => Arc::new(NoAuth),
            AuthConfig::ApiKey { key, header } => {
                Arc::new(ApiKeyAuth::new(key.clone(), header.clone()))
            }
            AuthConfig::Bearer { token } => Arc::new(BearerAuth::new(token.clone())),
            AuthConfig::Basic { username, password } => {
                Arc::new(BasicAuth::new(username.clone(), password.clone()))
            }
            AuthConfig::Hmac { key_id, secret, algorithm } => {
                Arc::new(HmacAuth::new(key_id.clone(), secret.clone(), *algorithm))
            }
            AuthConfig::Jwt { token, secret, algorithm, issuer, audience } => Arc::new(
                JwtAuth::new(
                    token.clone(),
                    secret.clone(),
                    algorithm,
                    issuer.clone(),
                    audience.clone(),
                )?,
            ),
        };
        Ok(Self { provider })
    }

    pub fn set_provider(&mut self, provider: Arc<dyn AuthProvider>) {
        self.provider = provider;
    }

    pub fn provider(&self) -> &Arc<dyn AuthProvider> {
        &self.provider
    }

    pub fn scheme(&self) -> &'static str {
        self.provider.scheme()
    }

    pub fn headers(&self) -> Result<Vec<(String, String)>, FabricError> {
        self.provider.headers()
    }

    pub fn request_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Vec<(String, String)>, FabricError> {
        self.provider.request_headers(method, path, body)
    }

    pub async fn authenticate(&self, context: &AuthContext) -> AuthOutcome {
        self.provider.authenticate(context).await
    }
}

impl std::fmt::Debug for AuthManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthManager").field("scheme", &self.provider.scheme()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_config_picks_matching_provider() {
        let cases = [
            (AuthConfig::None, "none"),
            (
                AuthConfig::ApiKey { key: "k".into(), header: DEFAULT_API_KEY_HEADER.into() },
                "api_key",
            ),
            (AuthConfig::Bearer { token: "t".into() }, "bearer"),
            (AuthConfig::Basic { username: "u".into(), password: "p".into() }, "basic"),
            (
                AuthConfig::Hmac {
                    key_id: "id".into(),
                    secret: "s".into(),
                    algorithm: HmacAlgorithm::Sha256,
                },
                "hmac",
            ),
        ];
        for (config, scheme) in cases {
            assert_eq!(AuthManager::from_config(&config).unwrap().scheme(), scheme);
        }
    }

    #[test]
    fn config_round_trips_through_serde() {
        let config = AuthConfig::ApiKey { key: "secret".into(), header: "X-Key".into() };
        let raw = serde_json::to_string(&config).unwrap();
        assert!(raw.contains("\"type\":\"api_key\""));
        let back: AuthConfig = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn header_lookup_is_case_insensitive() {
        let ctx = AuthContext::new().with_header("Authorization", "Bearer x");
        assert_eq!(ctx.header("authorization"), Some("Bearer x"));
        assert_eq!(ctx.header("AUTHORIZATION"), Some("Bearer x"));
        assert_eq!(ctx.header("X-Other"), None);
    }
}
