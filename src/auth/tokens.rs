//! Token storage and management

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::models::wire::now_secs;

/// Seconds before `exp` at which a token is already treated as expired.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// Stored bearer token
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredToken {
    pub token: String,
    /// Unix seconds, taken from the JWT `exp` claim when present.
    pub expires_at: Option<i64>,
}

impl StoredToken {
    /// Wrap a JWT, reading its expiry from the payload.
    ///
    /// Opaque (non-JWT) tokens are accepted and never expire.
    pub fn from_jwt(token: &str) -> Self {
        Self {
            token: token.trim().to_string(),
            expires_at: jwt_expiry(token.trim()),
        }
    }

    pub fn is_expired(&self) -> bool {
        match self.expires_at {
            Some(exp) => now_secs() + EXPIRY_MARGIN_SECS >= exp,
            None => false,
        }
    }
}

/// Decode the `exp` claim of a JWT without verifying it.
fn jwt_expiry(token: &str) -> Option<i64> {
    let payload = token.split('.').nth(1)?;
    // Some issuers pad despite RFC 7515.
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: serde_json::Value = serde_json::from_slice(&bytes).ok()?;
    claims.get("exp").and_then(|e| e.as_i64())
}

/// Token store trait for different storage backends
pub trait TokenStore {
    fn get_access_token(&self) -> Option<StoredToken>;
    fn set_access_token(&mut self, token: &str);
    fn clear_tokens(&mut self);
}
