//! HMAC request signing.
//!
//! The canonical string is `METHOD\nPATH\nTIMESTAMP\nhex(H(body))` (the body
//! hash component is empty for an empty body); the signature is
//! `hex(HMAC_H(secret, canonical))`. Verification requires the timestamp to
//! be within 300 seconds of now and uses a constant-time comparison.

use super::{AuthContext, AuthOutcome, AuthProvider};
use crate::error::FabricError;
use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use serde_json::json;
use sha2::{Digest, Sha256, Sha384, Sha512};

/// Maximum clock skew accepted during verification.
pub const MAX_TIMESTAMP_SKEW_SECS: i64 = 300;

/// Hash algorithm used for both the body digest and the HMAC.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HmacAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

/// HMAC signature provider.
#[derive(Debug, Clone)]
pub struct HmacAuth {
    key_id: String,
    secret: String,
    algorithm: HmacAlgorithm,
}

impl HmacAuth {
    pub fn new(key_id: impl Into<String>, secret: impl Into<String>, algorithm: HmacAlgorithm) -> Self {
        Self { key_id: key_id.into(), secret: secret.into(), algorithm }
    }

    fn body_hash(&self, body: &str) -> String {
        if body.is_empty() {
            return String::new();
        }
        match self.algorithm {
            HmacAlgorithm::Sha256 => hex::encode(Sha256::digest(body.as_bytes())),
            HmacAlgorithm::Sha384 => hex::encode(Sha384::digest(body.as_bytes())),
            HmacAlgorithm::Sha512 => hex::encode(Sha512::digest(body.as_bytes())),
        }
    }

    /// Build the canonical string for signing.
    pub fn canonical_string(&self, method: &str, path: &str, timestamp: &str, body: &str) -> String {
        [method.to_uppercase().as_str(), path, timestamp, &self.body_hash(body)].join("\n")
    }

    /// Sign the canonical string for a request.
    pub fn sign(&self, method: &str, path: &str, timestamp: &str, body: &str) -> String {
        let canonical = self.canonical_string(method, path, timestamp, body);
        let key = self.secret.as_bytes();
        match self.algorithm {
            HmacAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(canonical.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            HmacAlgorithm::Sha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(canonical.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
            HmacAlgorithm::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(canonical.as_bytes());
                hex::encode(mac.finalize().into_bytes())
            }
        }
    }

    // Constant-time comparison via `Mac::verify_slice`.
    fn verify_mac(&self, canonical: &str, signature: &[u8]) -> bool {
        let key = self.secret.as_bytes();
        match self.algorithm {
            HmacAlgorithm::Sha256 => {
                let mut mac = Hmac::<Sha256>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(canonical.as_bytes());
                mac.verify_slice(signature).is_ok()
            }
            HmacAlgorithm::Sha384 => {
                let mut mac = Hmac::<Sha384>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(canonical.as_bytes());
                mac.verify_slice(signature).is_ok()
            }
            HmacAlgorithm::Sha512 => {
                let mut mac = Hmac::<Sha512>::new_from_slice(key)
                    .unwrap_or_else(|_| unreachable!("hmac accepts any key length"));
                mac.update(canonical.as_bytes());
                mac.verify_slice(signature).is_ok()
            }
        }
    }

    /// Verify a signature against method/path/body and a Unix-seconds
    /// timestamp. Rejects timestamps outside the skew window.
    pub fn verify(
        &self,
        signature_hex: &str,
        method: &str,
        path: &str,
        timestamp: &str,
        body: &str,
    ) -> bool {
        let ts: i64 = match timestamp.parse() {
            Ok(ts) => ts,
            Err(_) => return false,
        };
        if (Utc::now().timestamp() - ts).abs() > MAX_TIMESTAMP_SKEW_SECS {
            return false;
        }

        let signature = match hex::decode(signature_hex) {
            Ok(bytes) => bytes,
            Err(_) => return false,
        };
        let canonical = self.canonical_string(method, path, timestamp, body);
        self.verify_mac(&canonical, &signature)
    }
}

#[async_trait]
impl AuthProvider for HmacAuth {
    fn scheme(&self) -> &'static str {
        "hmac"
    }

    /// HMAC headers are request-specific; use
    /// [`request_headers`](AuthProvider::request_headers).
    fn headers(&self) -> Result<Vec<(String, String)>, FabricError> {
        Ok(Vec::new())
    }

    fn request_headers(
        &self,
        method: &str,
        path: &str,
        body: &str,
    ) -> Result<Vec<(String, String)>, FabricError> {
        let timestamp = Utc::now().timestamp().to_string();
        let signature = self.sign(method, path, &timestamp, body);
        Ok(vec![
            ("X-Client-ID".to_string(), self.key_id.clone()),
            ("X-Timestamp".to_string(), timestamp),
            ("X-Signature".to_string(), signature),
        ])
    }

    async fn authenticate(&self, context: &AuthContext) -> AuthOutcome {
        let (client_id, signature, timestamp) = match (
            context.header("X-Client-ID"),
            context.header("X-Signature"),
            context.header("X-Timestamp"),
        ) {
            (Some(c), Some(s), Some(t)) => (c, s, t),
            _ => return AuthOutcome::denied(),
        };

        if client_id != self.key_id {
            return AuthOutcome::denied();
        }

        if self.verify(signature, &context.method, &context.path, timestamp, &context.body) {
            AuthOutcome::granted_with_claims(client_id, "hmac", json!({ "key_id": client_id }))
        } else {
            AuthOutcome::denied()
        }
    }
}
