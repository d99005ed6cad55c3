//! Error taxonomy for the identity core.
//!
//! Internally the variants stay distinct so callers and audit logs can
//! tell a bad password from an expired token. Externally,
//! [`AuthError::public_message`] collapses credential and token
//! failures into fixed, information-minimal strings so response shape
//! never reveals whether an account exists or why a token was refused.

use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum AuthError {
    /// Unknown identity or wrong password. Deliberately a single
    /// variant: the two cases must be indistinguishable to callers.
    #[error("invalid credentials")]
    InvalidCredentials,

    #[error("email not verified")]
    EmailNotVerified,

    /// The identity has TOTP enabled and no code was supplied.
    #[error("two-factor code required")]
    TwoFactorRequired,

    #[error("invalid two-factor code")]
    InvalidTwoFactorCode,

    #[error("token expired")]
    TokenExpired,

    /// Malformed structure, bad base64/json, or a signature mismatch.
    #[error("token malformed")]
    TokenMalformed,

    /// Token verified but its `kind` claim does not match the expected
    /// use (e.g. an access token presented at the refresh exchange).
    #[error("wrong token kind")]
    WrongTokenKind,

    /// Authenticated identity lacks the named permission.
    #[error("permission '{0}' required")]
    PermissionDenied(String),

    /// Authenticated identity lacks the named role.
    #[error("role '{0}' required")]
    RoleRequired(String),

    #[error("rate limit exceeded")]
    RateLimitExceeded,

    /// Password failed the strength policy; lists the violated rules.
    #[error("password does not meet strength requirements")]
    WeakPassword(Vec<String>),

    #[error("identity already exists")]
    IdentityExists,

    #[error("invalid email address")]
    InvalidEmail,

    /// Persistence collaborator failed. Fatal for the request, never
    /// retried here.
    #[error("persistence unavailable")]
    Persistence(#[source] anyhow::Error),
}

impl AuthError {
    /// HTTP status for the route boundary: 401 for authentication
    /// failures, 403 for authorization failures, 429 for throttling.
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::InvalidCredentials
            | Self::EmailNotVerified
            | Self::TwoFactorRequired
            | Self::InvalidTwoFactorCode
            | Self::TokenExpired
            | Self::TokenMalformed
            | Self::WrongTokenKind => 401,
            Self::PermissionDenied(_) | Self::RoleRequired(_) => 403,
            Self::RateLimitExceeded => 429,
            Self::WeakPassword(_) | Self::IdentityExists | Self::InvalidEmail => 400,
            Self::Persistence(_) => 500,
        }
    }

    /// Fixed response text. Token failures share one string regardless
    /// of whether the signature or the expiry check failed.
    #[must_use]
    pub fn public_message(&self) -> &'static str {
        match self {
            Self::InvalidCredentials => "Invalid credentials",
            Self::EmailNotVerified => "Email not verified",
            Self::TwoFactorRequired => "Two-factor code required",
            Self::InvalidTwoFactorCode => "Invalid two-factor code",
            Self::TokenExpired | Self::TokenMalformed | Self::WrongTokenKind => {
                "Could not validate credentials"
            }
            Self::PermissionDenied(_) => "Permission denied",
            Self::RoleRequired(_) => "Role required",
            Self::RateLimitExceeded => "Rate limit exceeded",
            Self::WeakPassword(_) => "Password does not meet strength requirements",
            Self::IdentityExists => "Identity already exists",
            Self::InvalidEmail => "Invalid email address",
            Self::Persistence(_) => "Internal server error",
        }
    }
}
