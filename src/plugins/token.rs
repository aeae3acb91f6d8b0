//! DirectiveToken: a short-lived credential bound to one
//! (directive, territory) pair.
//!
//! Wire form: `mt1.<payload>.<mac>` where `payload` is base64url JSON claims
//! and `mac` is base64url HMAC-SHA256 over `mt1.<payload>`. The key lives in
//! `<store>/token.key` as hex.

use crate::core::error::{AuthFailure, MarshalError};
use crate::core::time;
use crate::plugins::directive::{self, DirectiveRecord};
use crate::plugins::territory;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fs;
use std::path::{Path, PathBuf};
use subtle::ConstantTimeEq;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

const TOKEN_PREFIX: &str = "mt1";
const KEY_FILE_NAME: &str = "token.key";
const KEY_LEN_BYTES: usize = 32;
const MAX_KEY_FILE_BYTES: u64 = 256;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired at {expired_at}")]
    Expired { expired_at: i64 },
    #[error("token invalid: {0}")]
    Invalid(String),
}

impl From<TokenError> for MarshalError {
    fn from(err: TokenError) -> Self {
        let reason = match err {
            TokenError::Expired { .. } => AuthFailure::TokenExpired,
            TokenError::Invalid(_) => AuthFailure::TokenInvalid,
        };
        MarshalError::unauthorized(reason, err.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(deny_unknown_fields)]
pub struct TokenClaims {
    #[serde(rename = "did")]
    pub directive_id: String,
    #[serde(rename = "tid")]
    pub territory_id: String,
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(rename = "exp")]
    pub expires_at: i64,
    #[serde(rename = "jti")]
    pub nonce: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IssuedToken {
    pub token: String,
    pub expires_at: i64,
}

pub struct TokenSigner {
    key: Vec<u8>,
    ttl_seconds: i64,
}

impl std::fmt::Debug for TokenSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSigner")
            .field("ttl_seconds", &self.ttl_seconds)
            .finish_non_exhaustive()
    }
}

pub fn key_path(store_root: &Path) -> PathBuf {
    store_root.join(KEY_FILE_NAME)
}

impl TokenSigner {
    pub fn new(key: Vec<u8>, ttl_seconds: i64) -> Result<Self, MarshalError> {
        if key.len() < KEY_LEN_BYTES {
            return Err(MarshalError::Config(format!(
                "token key must be at least {} bytes",
                KEY_LEN_BYTES
            )));
        }
        Ok(Self { key, ttl_seconds })
    }

    /// Read the store's signing key, creating it on first use.
    pub fn load_or_create(store_root: &Path, ttl_seconds: i64) -> Result<Self, MarshalError> {
        let path = key_path(store_root);
        if path.exists() {
            let meta = fs::metadata(&path)?;
            if meta.len() > MAX_KEY_FILE_BYTES {
                return Err(MarshalError::Config(format!(
                    "token key file {} is too large",
                    path.display()
                )));
            }
            let encoded = fs::read_to_string(&path)?;
            let key = hex::decode(encoded.trim()).map_err(|e| {
                MarshalError::Config(format!("malformed token key {}: {}", path.display(), e))
            })?;
            return Self::new(key, ttl_seconds);
        }

        let mut key = vec![0u8; KEY_LEN_BYTES];
        rand::thread_rng().fill_bytes(&mut key);
        fs::write(&path, hex::encode(&key))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;
        }
        tracing::info!(path = %path.display(), "created token signing key");
        Self::new(key, ttl_seconds)
    }

    pub fn ttl_seconds(&self) -> i64 {
        self.ttl_seconds
    }

    fn mac(&self, signing_input: &[u8]) -> Result<Vec<u8>, MarshalError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| MarshalError::Config(format!("invalid token key: {}", e)))?;
        mac.update(signing_input);
        Ok(mac.finalize().into_bytes().to_vec())
    }

    pub fn mint(
        &self,
        directive_id: &str,
        territory_id: &str,
        now: i64,
    ) -> Result<IssuedToken, MarshalError> {
        let claims = TokenClaims {
            directive_id: directive_id.to_string(),
            territory_id: territory_id.to_string(),
            issued_at: now,
            expires_at: now + self.ttl_seconds,
            nonce: time::new_id(),
        };
        let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(&claims)?);
        let signing_input = format!("{}.{}", TOKEN_PREFIX, payload);
        let sig = URL_SAFE_NO_PAD.encode(self.mac(signing_input.as_bytes())?);
        Ok(IssuedToken {
            token: format!("{}.{}", signing_input, sig),
            expires_at: claims.expires_at,
        })
    }

    /// Verify signature, then expiry. Tampering is `Invalid`, never `Expired`.
    pub fn decode(&self, token: &str, now: i64) -> Result<TokenClaims, TokenError> {
        let mut parts = token.trim().split('.');
        let (Some(prefix), Some(payload), Some(sig), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(TokenError::Invalid("malformed token".to_string()));
        };
        if prefix != TOKEN_PREFIX {
            return Err(TokenError::Invalid("unknown token version".to_string()));
        }

        let provided = URL_SAFE_NO_PAD
            .decode(sig)
            .map_err(|_| TokenError::Invalid("bad signature encoding".to_string()))?;
        let expected = self
            .mac(format!("{}.{}", prefix, payload).as_bytes())
            .map_err(|e| TokenError::Invalid(e.to_string()))?;
        if provided.len() != expected.len() || !bool::from(provided.ct_eq(expected.as_slice())) {
            return Err(TokenError::Invalid("signature mismatch".to_string()));
        }

        let raw = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Invalid("bad payload encoding".to_string()))?;
        let claims: TokenClaims = serde_json::from_slice(&raw)
            .map_err(|e| TokenError::Invalid(format!("bad claims: {}", e)))?;

        if now >= claims.expires_at {
            return Err(TokenError::Expired {
                expired_at: claims.expires_at,
            });
        }
        Ok(claims)
    }
}

/// Check a directive-scoped call: the token decodes, it was issued to the
/// transport-authenticated territory, the directive belongs to that
/// territory's account, and the territory still holds the lease.
pub fn authorize(
    conn: &Connection,
    signer: &TokenSigner,
    token: &str,
    authenticated_territory_id: &str,
    now: i64,
) -> Result<(TokenClaims, DirectiveRecord), MarshalError> {
    let claims = signer.decode(token, now)?;
    if claims.territory_id != authenticated_territory_id {
        return Err(MarshalError::unauthorized(
            AuthFailure::BindingMismatch,
            "token was issued to a different territory",
        ));
    }

    let territory = territory::require_territory(conn, authenticated_territory_id)?;
    let record = directive::require_directive(conn, &claims.directive_id)?;
    if record.account_id != territory.account_id {
        return Err(MarshalError::unauthorized(
            AuthFailure::BindingMismatch,
            "directive belongs to a different account",
        ));
    }
    if record.territory_id.as_deref() != Some(authenticated_territory_id) {
        return Err(MarshalError::unauthorized(
            AuthFailure::LeaseLost,
            format!("territory no longer holds the lease on directive {}", record.id),
        ));
    }
    Ok((claims, record))
}
