//! tollgate_auth
//!
//! Bearer-token verification for the gateway trust boundary. Agents
//! authenticate with HS256 tokens (three base64url segments signed over
//! `header.payload` with the shared gateway secret); provider credentials
//! never reach them.
//!
//! With no secret configured the verifier runs in development mode and
//! hands every request a synthetic admin principal. Callers are expected
//! to advertise that loudly at startup.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

/// Paths served without authentication.
pub const PUBLIC_PATHS: &[&str] = &["/health", "/ready", "/openapi.json"];

pub fn is_public(path: &str) -> bool {
    PUBLIC_PATHS.contains(&path)
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("missing bearer token")]
    MissingToken,
    #[error("malformed token")]
    Malformed,
    #[error("invalid signature")]
    BadSignature,
    #[error("token expired")]
    Expired,
}

/// The client identity established for one request. Never persisted.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Principal {
    pub sub: String,
    pub role: String,
    pub dev: bool,
}

impl Principal {
    fn development() -> Self {
        Self {
            sub: "anonymous".to_string(),
            role: "admin".to_string(),
            dev: true,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct Claims {
    sub: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    role: Option<String>,
    exp: u64,
}

/// HS256 verifier. `secret: None` is explicit development mode.
pub struct TokenVerifier {
    secret: Option<Vec<u8>>,
}

impl TokenVerifier {
    pub fn new(secret: Option<String>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()).map(String::into_bytes),
        }
    }

    pub fn dev_mode(&self) -> bool {
        self.secret.is_none()
    }

    /// Verify the `Authorization` header value (if any) against `now`
    /// (unix seconds). In development mode every request succeeds with
    /// the synthetic principal regardless of the header.
    pub fn verify_bearer(
        &self,
        authorization: Option<&str>,
        now_unix: u64,
    ) -> Result<Principal, AuthError> {
        let secret = match &self.secret {
            Some(s) => s,
            None => return Ok(Principal::development()),
        };
        let token = authorization
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(AuthError::MissingToken)?;
        self.verify_token(secret, token, now_unix)
    }

    fn verify_token(
        &self,
        secret: &[u8],
        token: &str,
        now_unix: u64,
    ) -> Result<Principal, AuthError> {
        let mut parts = token.split('.');
        let (header, payload, signature) = match (parts.next(), parts.next(), parts.next()) {
            (Some(h), Some(p), Some(s)) if parts.next().is_none() => (h, p, s),
            _ => return Err(AuthError::Malformed),
        };

        let signing_input = format!("{header}.{payload}");
        let sig_bytes = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| AuthError::Malformed)?;
        let mut mac =
            HmacSha256::new_from_slice(secret).map_err(|_| AuthError::BadSignature)?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&sig_bytes)
            .map_err(|_| AuthError::BadSignature)?;

        let payload_bytes = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| AuthError::Malformed)?;
        let claims: Claims =
            serde_json::from_slice(&payload_bytes).map_err(|_| AuthError::Malformed)?;
        if claims.exp <= now_unix {
            return Err(AuthError::Expired);
        }

        Ok(Principal {
            sub: claims.sub,
            role: claims.role.unwrap_or_else(|| "agent".to_string()),
            dev: false,
        })
    }
}

/// Sign a token the verifier accepts. Used by tests and operator tooling;
/// the gateway itself never mints tokens for agents.
pub fn mint_token(secret: &str, sub: &str, role: Option<&str>, exp_unix: u64) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let claims = Claims {
        sub: sub.to_string(),
        role: role.map(str::to_string),
        exp: exp_unix,
    };
    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims).unwrap_or_default());
    let signing_input = format!("{header}.{payload}");
    let mut mac =
        HmacSha256::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(signing_input.as_bytes());
    let signature = URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());
    format!("{signing_input}.{signature}")
}
