//! Header-based credential providers: none, API key, bearer, basic.

use super::{AuthContext, AuthOutcome, AuthProvider};
use crate::error::FabricError;
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;

/// No authentication; every request is anonymous and accepted.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl AuthProvider for NoAuth {
    fn scheme(&self) -> &'static str {
        "none"
    }

    fn headers(&self) -> Result<Vec<(String, String)>, FabricError> {
        Ok(Vec::new())
    }

    async fn authenticate(&self, _context: &AuthContext) -> AuthOutcome {
        AuthOutcome::granted("anonymous", "none")
    }
}

/// Static API key carried in a configurable header.
#[derive(Debug, Clone)]
pub struct ApiKeyAuth {
    key: String,
    header: String,
}

impl ApiKeyAuth {
    pub fn new(key: impl Into<String>, header: impl Into<String>) -> Self {
        Self { key: key.into(), header: header.into() }
    }
}

#[async_trait]
impl AuthProvider for ApiKeyAuth {
    fn scheme(&self) -> &'static str {
        "api_key"
    }

    fn headers(&self) -> Result<Vec<(String, String)>, FabricError> {
        Ok(vec![(self.header.clone(), self.key.clone())])
    }

    async fn authenticate(&self, context: &AuthContext) -> AuthOutcome {
        match context.header(&self.header) {
            Some(provided) if provided == self.key => {
                AuthOutcome::granted("api_key_client", "api_key")
            }
            _ => AuthOutcome::denied(),
        }
    }
}

/// Static bearer token.
#[derive(Debug, Clone)]
pub struct BearerAuth {
    token: String,
}

impl BearerAuth {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }
}

#[async_trait]
impl AuthProvider for BearerAuth {
    fn scheme(&self) -> &'static str {
        "bearer"
    }

    fn headers(&self) -> Result<Vec<(String, String)>, FabricError> {
        Ok(vec![("Authorization".to_string(), format!("Bearer {}", self.token))])
    }

    async fn authenticate(&self, context: &AuthContext) -> AuthOutcome {
        match context.header("Authorization").and_then(|h| h.strip_prefix("Bearer ")) {
            Some(token) if token == self.token => AuthOutcome::granted("bearer_client", "bearer"),
            _ => AuthOutcome::denied(),
        }
    }
}

/// Username/password over the Basic scheme.
#[derive(Debug, Clone)]
pub struct BasicAuth {
    username: String,
    password: String,
}

impl BasicAuth {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self { username: username.into(), password: password.into() }
    }
}

#[async_trait]
impl AuthProvider for BasicAuth {
    fn scheme(&self) -> &'static str {
        "basic"
    }

    fn headers(&self) -> Result<Vec<(String, String)>, FabricError> {
        let credentials = BASE64.encode(format!("{}:{}", self.username, self.password));
        Ok(vec![("Authorization".to_string(), format!("Basic {credentials}"))])
    }

    async fn authenticate(&self, context: &AuthContext) -> AuthOutcome {
        let encoded = match context.header("Authorization").and_then(|h| h.strip_prefix("Basic "))
        {
            Some(encoded) => encoded,
            None => return AuthOutcome::denied(),
        };

        let decoded = match BASE64.decode(encoded).ok().and_then(|b| String::from_utf8(b).ok()) {
            Some(decoded) => decoded,
            None => return AuthOutcome::denied(),
        };

        match decoded.split_once(':') {
            Some((user, pass)) if user == self.username && pass == self.password => {
                AuthOutcome::granted(user, "basic")
            }
            _ => AuthOutcome::denied(),
        }
    }
}
