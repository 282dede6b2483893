//! Opaque security tokens.
//!
//! The queue engine (pb-queue) never sees a principal's structure: it asks
//! this capability to mint an opaque token at enqueue time and to recover
//! the principal from that token at dequeue time. The principal itself is
//! caller-defined; we carry it as an opaque `serde_json::Value`.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    #[error("token is malformed")]
    Malformed,

    #[error("token signature does not match")]
    BadSignature,

    #[error("token has expired")]
    Expired,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal(pub serde_json::Value);

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Issues and validates opaque security tokens carrying a principal and an
/// expiry. The queue depends only on this trait.
pub trait SecurityTokenService: Send + Sync {
    fn issue(&self, principal: &Principal, expires_at: Option<DateTime<Utc>>) -> String;
    fn validate(&self, token: &str) -> Result<Principal, TokenError>;
}

#[derive(Serialize, Deserialize)]
struct TokenPayload {
    principal: serde_json::Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<DateTime<Utc>>,
}

/// HMAC-SHA256 signed token, the same construction `fc-router::mediator`
/// uses for its webhook signature: base64 payload + hex HMAC digest,
/// dot-separated.
pub struct HmacTokenService {
    key: Vec<u8>,
}

impl HmacTokenService {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }

    fn sign(&self, payload: &str) -> String {
        let mut mac = HmacSha256::new_from_slice(&self.key).expect("HMAC accepts any key length");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }
}

impl SecurityTokenService for HmacTokenService {
    fn issue(&self, principal: &Principal, expires_at: Option<DateTime<Utc>>) -> String {
        let payload = TokenPayload {
            principal: principal.0.clone(),
            expires_at,
        };
        let payload_json = serde_json::to_string(&payload).expect("payload is always serializable");
        let payload_b64 = BASE64.encode(payload_json.as_bytes());
        let signature = self.sign(&payload_b64);
        format!("{}.{}", payload_b64, signature)
    }

    fn validate(&self, token: &str) -> Result<Principal, TokenError> {
        let (payload_b64, signature) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let expected = self.sign(payload_b64);
        if expected != signature {
            return Err(TokenError::BadSignature);
        }
        let payload_json = BASE64.decode(payload_b64).map_err(|_| TokenError::Malformed)?;
        let payload: TokenPayload =
            serde_json::from_slice(&payload_json).map_err(|_| TokenError::Malformed)?;
        if let Some(expires_at) = payload.expires_at {
            if expires_at < Utc::now() {
                return Err(TokenError::Expired);
            }
        }
        Ok(Principal(payload.principal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn issues_and_validates_round_trip() {
        let svc = HmacTokenService::new(b"test-key".to_vec());
        let principal = Principal(json!({ "sub": "user-1" }));
        let token = svc.issue(&principal, None);
        let recovered = svc.validate(&token).unwrap();
        assert_eq!(recovered, principal);
    }

    #[test]
    fn rejects_tampered_token() {
        let svc = HmacTokenService::new(b"test-key".to_vec());
        let token = svc.issue(&Principal(json!({"sub": "u"})), None);
        let mut tampered = token.clone();
        tampered.push('x');
        assert!(matches!(svc.validate(&tampered), Err(TokenError::BadSignature)));
    }

    #[test]
    fn rejects_expired_token() {
        let svc = HmacTokenService::new(b"test-key".to_vec());
        let token = svc.issue(&Principal(json!({"sub": "u"})), Some(Utc::now() - chrono::Duration::seconds(1)));
        assert!(matches!(svc.validate(&token), Err(TokenError::Expired)));
    }
}
