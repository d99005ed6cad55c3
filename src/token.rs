//! Signed token issuance and verification.
//!
//! Tokens are three-part JWTs (`header.claims.signature`) signed with
//! HS256 over a process-wide secret. The token kind is itself a claim,
//! so one verification routine serves access, refresh, and session
//! tokens; callers that care about the kind use [`TokenService::verify_kind`].
//!
//! Verification order is fixed: structure, then signature, then claims
//! decode, then expiry. Claims are never read from a token whose
//! signature has not checked out.

use base64ct::{Base64UrlUnpadded, Encoding};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::sync::Arc;
use thiserror::Error;
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "HS256";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct TokenHeader {
    alg: String,
    typ: String,
}

impl TokenHeader {
    fn hs256() -> Self {
        Self {
            alg: ALGORITHM.to_string(),
            typ: "JWT".to_string(),
        }
    }
}

/// What a token authorizes. Session tokens are access-kind; they are
/// distinguished only by their lifetime and by being tracked server-side.
/// Reset and verification tokens are single-purpose kinds so they can
/// never be presented as API credentials.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
    Reset,
    Verification,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Claims {
    /// Identity id.
    pub sub: String,
    #[serde(rename = "type")]
    pub kind: TokenKind,
    pub iat: i64,
    pub exp: i64,
    /// Unique token id, reserved for revocation hooks.
    pub jti: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tenant_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<Vec<String>>,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("invalid token format")]
    TokenFormat,
    #[error("invalid base64url encoding")]
    Base64,
    #[error("invalid json")]
    Json(#[from] serde_json::Error),
    #[error("unsupported algorithm: {0}")]
    UnsupportedAlg(String),
    #[error("invalid signing key")]
    Key,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("token expired")]
    Expired,
    #[error("wrong token kind")]
    WrongKind,
}

impl From<TokenError> for AuthError {
    fn from(err: TokenError) -> Self {
        match err {
            TokenError::Expired => Self::TokenExpired,
            TokenError::WrongKind => Self::WrongTokenKind,
            _ => Self::TokenMalformed,
        }
    }
}

fn b64e_json<T: Serialize>(value: &T) -> Result<String, TokenError> {
    let json = serde_json::to_vec(value)?;
    Ok(Base64UrlUnpadded::encode_string(&json))
}

fn b64d_json<T: for<'de> Deserialize<'de>>(segment: &str) -> Result<T, TokenError> {
    let bytes = Base64UrlUnpadded::decode_vec(segment).map_err(|_| TokenError::Base64)?;
    Ok(serde_json::from_slice(&bytes)?)
}

/// Issues and verifies the platform's signed tokens.
#[derive(Clone)]
pub struct TokenService {
    secret: Vec<u8>,
    clock: Arc<dyn Clock>,
}

impl TokenService {
    #[must_use]
    pub fn new(secret: &[u8], clock: Arc<dyn Clock>) -> Self {
        Self {
            secret: secret.to_vec(),
            clock,
        }
    }

    /// Issue an access token carrying the identity's tenant and a
    /// snapshot of its permission names.
    ///
    /// # Errors
    ///
    /// Returns an error if claim encoding or signing fails.
    pub fn issue_access(
        &self,
        identity_id: Uuid,
        tenant_id: &str,
        permissions: Vec<String>,
        ttl_seconds: i64,
    ) -> Result<String, TokenError> {
        self.issue(
            TokenKind::Access,
            identity_id,
            Some(tenant_id.to_string()),
            Some(permissions),
            ttl_seconds,
        )
    }

    /// Issue a refresh token. Carries no permissions claim; permissions
    /// are re-resolved at exchange time.
    ///
    /// # Errors
    ///
    /// Returns an error if claim encoding or signing fails.
    pub fn issue_refresh(
        &self,
        identity_id: Uuid,
        ttl_seconds: i64,
    ) -> Result<String, TokenError> {
        self.issue(TokenKind::Refresh, identity_id, None, None, ttl_seconds)
    }

    /// Issue a session token: access-kind, used purely as a server-side
    /// tracked session identifier.
    ///
    /// # Errors
    ///
    /// Returns an error if claim encoding or signing fails.
    pub fn issue_session(
        &self,
        identity_id: Uuid,
        tenant_id: &str,
        ttl_seconds: i64,
    ) -> Result<String, TokenError> {
        self.issue(
            TokenKind::Access,
            identity_id,
            Some(tenant_id.to_string()),
            None,
            ttl_seconds,
        )
    }

    /// Issue a password-reset token. Single-purpose; carries nothing
    /// beyond the identity and its expiry.
    ///
    /// # Errors
    ///
    /// Returns an error if claim encoding or signing fails.
    pub fn issue_reset(&self, identity_id: Uuid, ttl_seconds: i64) -> Result<String, TokenError> {
        self.issue(TokenKind::Reset, identity_id, None, None, ttl_seconds)
    }

    /// Issue an email-verification token for enrollment links.
    ///
    /// # Errors
    ///
    /// Returns an error if claim encoding or signing fails.
    pub fn issue_verification(
        &self,
        identity_id: Uuid,
        ttl_seconds: i64,
    ) -> Result<String, TokenError> {
        self.issue(TokenKind::Verification, identity_id, None, None, ttl_seconds)
    }

    fn issue(
        &self,
        kind: TokenKind,
        identity_id: Uuid,
        tenant_id: Option<String>,
        permissions: Option<Vec<String>>,
        ttl_seconds: i64,
    ) -> Result<String, TokenError> {
        let now = self.clock.now_unix();
        let claims = Claims {
            sub: identity_id.to_string(),
            kind,
            iat: now,
            exp: now + ttl_seconds,
            jti: Uuid::new_v4().to_string(),
            tenant_id,
            permissions,
        };

        let header_b64 = b64e_json(&TokenHeader::hs256())?;
        let claims_b64 = b64e_json(&claims)?;
        let signing_input = format!("{header_b64}.{claims_b64}");

        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Key)?;
        mac.update(signing_input.as_bytes());
        let signature_b64 = Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes());

        Ok(format!("{signing_input}.{signature_b64}"))
    }

    /// Verify a token and return its claims.
    ///
    /// # Errors
    ///
    /// Returns an error if the token is malformed, carries an
    /// unsupported algorithm, fails signature verification, or has
    /// expired relative to the service clock.
    pub fn verify(&self, token: &str) -> Result<Claims, TokenError> {
        let mut parts = token.split('.');
        let header_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let claims_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        let signature_b64 = parts.next().ok_or(TokenError::TokenFormat)?;
        if parts.next().is_some() {
            return Err(TokenError::TokenFormat);
        }

        let header: TokenHeader = b64d_json(header_b64)?;
        if header.alg != ALGORITHM {
            return Err(TokenError::UnsupportedAlg(header.alg));
        }

        let signing_input = format!("{header_b64}.{claims_b64}");
        let signature =
            Base64UrlUnpadded::decode_vec(signature_b64).map_err(|_| TokenError::Base64)?;
        let mut mac =
            HmacSha256::new_from_slice(&self.secret).map_err(|_| TokenError::Key)?;
        mac.update(signing_input.as_bytes());
        mac.verify_slice(&signature)
            .map_err(|_| TokenError::InvalidSignature)?;

        let claims: Claims = b64d_json(claims_b64)?;
        if claims.exp <= self.clock.now_unix() {
            return Err(TokenError::Expired);
        }

        Ok(claims)
    }

    /// Verify a token and additionally require its `type` claim to
    /// match the expected kind.
    ///
    /// # Errors
    ///
    /// Returns the same errors as [`verify`](Self::verify), plus
    /// `WrongKind` when the kind claim does not match.
    pub fn verify_kind(&self, token: &str, kind: TokenKind) -> Result<Claims, TokenError> {
        let claims = self.verify(token)?;
        if claims.kind != kind {
            return Err(TokenError::WrongKind);
        }
        Ok(claims)
    }
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenService").finish_non_exhaustive()
    }
}
