//! JWT issuance and validation.

use super::{AuthContext, AuthOutcome, AuthProvider};
use crate::error::FabricError;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use tracing::warn;

const TOKEN_LIFETIME_SECS: i64 = 3600;
/// Re-issue slightly before expiry so a cached token is never handed out stale.
const REFRESH_MARGIN_SECS: i64 = 30;

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Claims {
    sub: String,
    iss: String,
    aud: String,
    iat: i64,
    exp: i64,
}

/// JWT provider: presents a preset or self-issued token, validates inbound
/// tokens against signature, expiry, issuer, and audience.
pub struct JwtAuth {
    token: Option<String>,
    secret: Option<String>,
    algorithm: Algorithm,
    issuer: String,
    audience: String,
    cached: Mutex<Option<(String, i64)>>,
}

impl JwtAuth {
    pub fn new(
        token: Option<String>,
        secret: Option<String>,
        algorithm: &str,
        issuer: impl Into<String>,
        audience: impl Into<String>,
    ) -> Result<Self, FabricError> {
        let algorithm = algorithm
            .parse::<Algorithm>()
            .map_err(|_| FabricError::Validation(format!("unsupported jwt algorithm: {algorithm}")))?;
        Ok(Self {
            token,
            secret,
            algorithm,
            issuer: issuer.into(),
            audience: audience.into(),
            cached: Mutex::new(None),
        })
    }

    fn issue(&self) -> Result<String, FabricError> {
        let secret = self
            .secret
            .as_ref()
            .ok_or_else(|| FabricError::Auth("jwt secret not configured".into()))?;

        let now = Utc::now().timestamp();
        {
            let cached = self.cached.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            if let Some((token, expiry)) = cached.as_ref() {
                if now < expiry - REFRESH_MARGIN_SECS {
                    return Ok(token.clone());
                }
            }
        }

        let expiry = now + TOKEN_LIFETIME_SECS;
        let claims = Claims {
            sub: format!("{}-client", self.issuer),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
            iat: now,
            exp: expiry,
        };
        let token = encode(
            &Header::new(self.algorithm),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .map_err(|e| FabricError::Auth(format!("jwt signing failed: {e}")))?;

        *self.cached.lock().unwrap_or_else(|poisoned| poisoned.into_inner()) =
            Some((token.clone(), expiry));
        Ok(token)
    }

    fn current_token(&self) -> Result<String, FabricError> {
        match &self.token {
            Some(token) => Ok(token.clone()),
            None => self.issue(),
        }
    }
}

#[async_trait]
impl AuthProvider for JwtAuth {
    fn scheme(&self) -> &'static str {
        "jwt"
    }

    fn headers(&self) -> Result<Vec<(String, String)>, FabricError> {
        Ok(vec![("Authorization".to_string(), format!("Bearer {}", self.current_token()?))])
    }

    async fn authenticate(&self, context: &AuthContext) -> AuthOutcome {
        let token = match context.header("Authorization").and_then(|h| h.strip_prefix("Bearer "))
        {
            Some(token) => token,
            None => return AuthOutcome::denied(),
        };

        let secret = match &self.secret {
            Some(secret) => secret,
            None => return AuthOutcome::denied(),
        };

        let mut validation = Validation::new(self.algorithm);
        validation.set_issuer(&[&self.issuer]);
        validation.set_audience(&[&self.audience]);

        match decode::<Claims>(token, &DecodingKey::from_secret(secret.as_bytes()), &validation) {
            Ok(data) => {
                let claims = serde_json::to_value(&data.claims).unwrap_or_default();
                AuthOutcome::granted_with_claims(data.claims.sub.clone(), "jwt", claims)
            }
            Err(e) => {
                warn!(error = %e, "jwt validation failed");
                AuthOutcome::denied()
            }
        }
    }
}

impl std::fmt::Debug for JwtAuth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JwtAuth")
            .field("algorithm", &self.algorithm)
            .field("issuer", &self.issuer)
            .field("audience", &self.audience)
            .field("preset_token", &self.token.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn provider() -> JwtAuth {
        JwtAuth::new(None, Some("secret".into()), "HS256", "teamwire", "workers").unwrap()
    }

    #[tokio::test]
    async fn issued_token_validates() {
        let auth = provider();
        let headers = auth.headers().unwrap();
        let (_, value) = &headers[0];
        assert!(value.starts_with("Bearer "));

        let outcome = auth
            .authenticate(&AuthContext::new().with_header("Authorization", value.clone()))
            .await;
        assert!(outcome.authenticated);
        assert_eq!(outcome.client_id.as_deref(), Some("teamwire-client"));
        let claims = outcome.claims.unwrap();
        assert_eq!(claims["iss"], "teamwire");
        assert_eq!(claims["aud"], "workers");
    }

    #[tokio::test]
    async fn token_is_cached_between_calls() {
        let auth = provider();
        let first = auth.headers().unwrap();
        let second = auth.headers().unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn wrong_secret_rejected() {
        let auth = provider();
        let header = auth.headers().unwrap().remove(0).1;

        let other =
            JwtAuth::new(None, Some("other".into()), "HS256", "teamwire", "workers").unwrap();
        let outcome =
            other.authenticate(&AuthContext::new().with_header("Authorization", header)).await;
        assert!(!outcome.authenticated);
    }

    #[tokio::test]
    async fn wrong_audience_rejected() {
        let auth = provider();
        let header = auth.headers().unwrap().remove(0).1;

        let other =
            JwtAuth::new(None, Some("secret".into()), "HS256", "teamwire", "elsewhere").unwrap();
        let outcome =
            other.authenticate(&AuthContext::new().with_header("Authorization", header)).await;
        assert!(!outcome.authenticated);
    }

    #[test]
    fn unknown_algorithm_is_a_validation_error() {
        let err = JwtAuth::new(None, None, "HS9000", "i", "a").unwrap_err();
        assert!(matches!(err, FabricError::Validation(_)));
    }

    #[test]
    fn issuing_without_secret_fails() {
        let auth = JwtAuth::new(None, None, "HS256", "i", "a").unwrap();
        assert!(matches!(auth.headers().unwrap_err(), FabricError::Auth(_)));
    }
}
