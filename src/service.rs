//! Orchestration of the authentication and account flows.
//!
//! `IdentityService` ties the leaf primitives together in a fixed
//! order: rate limiting gates login and registration before any
//! credential work; credential verification strictly precedes 2FA
//! verification, which precedes token issuance, which precedes
//! persistence of the new refresh and session records. Any failure
//! aborts the remaining steps.

use std::sync::Arc;

use regex::Regex;
use uuid::Uuid;

use crate::audit;
use crate::authz::{self, PermissionSet};
use crate::clock::Clock;
use crate::config::IdentityConfig;
use crate::error::AuthError;
use crate::password;
use crate::rate_limit::{RateLimitAction, RateLimitDecision, RateLimiter};
use crate::store::{
    ClientMeta, CreateOutcome, IdentityRecord, IdentityStore, NewIdentity, RefreshRecord,
    RefreshTokenStore, SessionRecord, SessionStore, TotpEnrollment, token_hash,
};
use crate::token::{Claims, TokenError, TokenKind, TokenService};
use crate::totp;

#[derive(Clone, Debug)]
pub struct LoginRequest {
    pub tenant_id: String,
    pub email: String,
    pub password: String,
    /// Six-digit TOTP code or an unused backup code.
    pub totp_code: Option<String>,
    /// Extends the access-token lifetime to the remember-me ttl.
    pub remember_me: bool,
}

#[derive(Clone, Debug)]
pub struct LoginOutcome {
    pub identity_id: Uuid,
    pub tenant_id: String,
    pub access_token: String,
    pub refresh_token: String,
    pub session_token: String,
    /// Permission snapshot embedded in the access token.
    pub permissions: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RefreshOutcome {
    pub access_token: String,
    pub permissions: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct RegisterRequest {
    pub tenant_id: String,
    pub email: String,
    pub password: String,
}

#[derive(Clone, Debug)]
pub struct RegisterOutcome {
    pub identity_id: Uuid,
    /// Emailed to the new identity by the caller; never stored raw.
    pub verification_token: String,
}

/// 2FA enrollment material, returned exactly once at setup.
#[derive(Clone, Debug)]
pub struct TotpSetup {
    pub secret: String,
    pub provisioning_uri: String,
    pub backup_codes: Vec<String>,
}

/// Outcome of a password-reset request. Callers must respond
/// identically for both variants to prevent account enumeration.
#[derive(Debug)]
pub enum ResetRequestOutcome {
    Issued { identity_id: Uuid, token: String },
    Noop,
}

/// Outcome of a verification-email resend. Same enumeration-safety
/// contract as [`ResetRequestOutcome`].
#[derive(Debug)]
pub enum ResendOutcome {
    Queued { identity_id: Uuid, token: String },
    Noop,
}

/// Normalize an email for lookup and uniqueness checks.
fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Basic format check on already-normalized input.
fn valid_email(email_normalized: &str) -> bool {
    Regex::new(r"^[^@\s]+@[^@\s]+\.[^@\s]+$").is_ok_and(|regex| regex.is_match(email_normalized))
}

fn persistence<T>(result: anyhow::Result<T>) -> Result<T, AuthError> {
    result.map_err(AuthError::Persistence)
}

/// Token issuance failures are internal faults, not a property of the
/// presented credentials.
fn issued(result: Result<String, TokenError>) -> Result<String, AuthError> {
    result.map_err(|err| AuthError::Persistence(anyhow::Error::new(err)))
}

pub struct IdentityService<S> {
    config: IdentityConfig,
    clock: Arc<dyn Clock>,
    tokens: TokenService,
    limiter: Arc<dyn RateLimiter>,
    store: Arc<S>,
}

impl<S> IdentityService<S>
where
    S: IdentityStore + RefreshTokenStore + SessionStore,
{
    #[must_use]
    pub fn new(
        config: IdentityConfig,
        clock: Arc<dyn Clock>,
        limiter: Arc<dyn RateLimiter>,
        store: Arc<S>,
    ) -> Self {
        let tokens = TokenService::new(config.signing_secret(), clock.clone());
        Self {
            config,
            clock,
            tokens,
            limiter,
            store,
        }
    }

    #[must_use]
    pub fn tokens(&self) -> &TokenService {
        &self.tokens
    }

    /// Authenticate an API request: verify the access token and return
    /// its claims with the embedded permission snapshot.
    ///
    /// # Errors
    ///
    /// Fails with the generic credential-validation surface for any
    /// malformed, tampered, expired, or wrong-kind token.
    pub fn verify_access(&self, token: &str) -> Result<(Claims, PermissionSet), AuthError> {
        let claims = self.tokens.verify_kind(token, TokenKind::Access)?;
        let permissions = claims
            .permissions
            .clone()
            .unwrap_or_default()
            .into_iter()
            .collect();
        Ok((claims, permissions))
    }

    /// Full login flow. See the module docs for the step ordering.
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded` before anything else; `InvalidCredentials`
    /// for unknown email or wrong password, indistinguishably;
    /// `EmailNotVerified`; `TwoFactorRequired` or
    /// `InvalidTwoFactorCode` when 2FA is enrolled; `Persistence` if a
    /// store operation fails.
    pub async fn login(
        &self,
        request: LoginRequest,
        client: ClientMeta,
    ) -> Result<LoginOutcome, AuthError> {
        if self.limiter.check(&client.address, RateLimitAction::Login) == RateLimitDecision::Limited
        {
            audit::failure("login", "rate_limited", Some(&client));
            return Err(AuthError::RateLimitExceeded);
        }

        let email = normalize_email(&request.email);
        let identity = persistence(self.store.find_by_email(&request.tenant_id, &email).await)?;
        let Some(identity) = identity else {
            // Same hashing cost as a wrong password, so response time
            // does not reveal whether the email exists.
            password::verify_dummy(&request.password);
            audit::failure("login", "unknown_identity", Some(&client));
            return Err(AuthError::InvalidCredentials);
        };

        if !password::verify_password(&request.password, &identity.credential_hash) {
            audit::failure("login", "bad_password", Some(&client));
            return Err(AuthError::InvalidCredentials);
        }

        if !identity.email_verified {
            audit::failure("login", "email_not_verified", Some(&client));
            return Err(AuthError::EmailNotVerified);
        }

        if let Some(enrollment) = &identity.totp {
            self.check_second_factor(&identity, enrollment, request.totp_code.as_deref(), &client)
                .await?;
        }

        let permissions =
            authz::resolve_permissions(self.store.as_ref(), identity.id).await?.into_names();

        let access_ttl = if request.remember_me {
            self.config.remember_me_ttl_seconds()
        } else {
            self.config.access_ttl_seconds()
        };
        let access_token = issued(self.tokens.issue_access(
            identity.id,
            &identity.tenant_id,
            permissions.clone(),
            access_ttl,
        ))?;
        let refresh_token =
            issued(self.tokens.issue_refresh(identity.id, self.config.refresh_ttl_seconds()))?;
        let session_token = issued(self.tokens.issue_session(
            identity.id,
            &identity.tenant_id,
            self.config.session_ttl_seconds(),
        ))?;

        let now = self.clock.now_unix();
        persistence(
            RefreshTokenStore::insert(
                self.store.as_ref(),
                RefreshRecord {
                    token_hash: token_hash(&refresh_token),
                    identity_id: identity.id,
                    expires_at: now + self.config.refresh_ttl_seconds(),
                },
            )
            .await,
        )?;
        persistence(
            SessionStore::insert(
                self.store.as_ref(),
                SessionRecord {
                    token_hash: token_hash(&session_token),
                    identity_id: identity.id,
                    tenant_id: identity.tenant_id.clone(),
                    client: client.clone(),
                    created_at: now,
                    expires_at: now + self.config.session_ttl_seconds(),
                },
            )
            .await,
        )?;

        audit::success("login", identity.id, &identity.tenant_id, &client);

        Ok(LoginOutcome {
            identity_id: identity.id,
            tenant_id: identity.tenant_id,
            access_token,
            refresh_token,
            session_token,
            permissions,
        })
    }

    async fn check_second_factor(
        &self,
        identity: &IdentityRecord,
        enrollment: &TotpEnrollment,
        code: Option<&str>,
        client: &ClientMeta,
    ) -> Result<(), AuthError> {
        let Some(code) = code else {
            audit::failure("login", "totp_required", Some(client));
            return Err(AuthError::TwoFactorRequired);
        };

        let secret = persistence(totp::crypto::open_secret(
            self.config.totp_key(),
            enrollment.key_id.as_str(),
            &identity.tenant_id,
            identity.id,
            &enrollment.ciphertext,
        ))?;

        if totp::verify_code(&secret, code, self.clock.now_unix()) {
            return Ok(());
        }

        // Backup codes are single-use; a match removes the spent hash.
        if let Some(index) = totp::match_backup_code(code, &enrollment.backup_code_hashes) {
            let mut remaining = enrollment.clone();
            remaining.backup_code_hashes.remove(index);
            persistence(self.store.set_totp(identity.id, &remaining).await)?;
            audit::identity_event("login.backup_code_used", identity.id);
            return Ok(());
        }

        audit::failure("login", "bad_totp_code", Some(client));
        Err(AuthError::InvalidTwoFactorCode)
    }

    /// Exchange a refresh token for a new access token. Permissions
    /// are re-resolved from the store, not copied from the old token.
    /// The presented refresh token stays valid until logout or expiry.
    ///
    /// # Errors
    ///
    /// Any failure surfaces through the generic credential-validation
    /// response; internally the variants distinguish a bad token from
    /// a missing or expired server-side record.
    pub async fn refresh(&self, refresh_token: &str) -> Result<RefreshOutcome, AuthError> {
        let claims = self.tokens.verify_kind(refresh_token, TokenKind::Refresh)?;

        let hash = token_hash(refresh_token);
        let record = persistence(RefreshTokenStore::find(self.store.as_ref(), &hash).await)?;
        let Some(record) = record else {
            audit::failure("refresh", "unknown_record", None);
            return Err(AuthError::TokenMalformed);
        };
        if record.expires_at <= self.clock.now_unix() {
            persistence(RefreshTokenStore::delete(self.store.as_ref(), &hash).await)?;
            audit::failure("refresh", "expired_record", None);
            return Err(AuthError::TokenExpired);
        }

        let identity_id =
            Uuid::parse_str(&claims.sub).map_err(|_| AuthError::TokenMalformed)?;
        let identity = persistence(self.store.find_by_id(identity_id).await)?
            .ok_or(AuthError::TokenMalformed)?;

        let permissions =
            authz::resolve_permissions(self.store.as_ref(), identity.id).await?.into_names();
        let access_token = issued(self.tokens.issue_access(
            identity.id,
            &identity.tenant_id,
            permissions.clone(),
            self.config.access_ttl_seconds(),
        ))?;

        Ok(RefreshOutcome {
            access_token,
            permissions,
        })
    }

    /// Invalidate the server-side records for the presented tokens.
    /// Idempotent; unknown or already-deleted tokens are not an error.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if a store operation fails.
    pub async fn logout(
        &self,
        refresh_token: Option<&str>,
        session_token: Option<&str>,
    ) -> Result<(), AuthError> {
        if let Some(token) = refresh_token {
            persistence(
                RefreshTokenStore::delete(self.store.as_ref(), &token_hash(token)).await,
            )?;
        }
        if let Some(token) = session_token {
            persistence(SessionStore::delete(self.store.as_ref(), &token_hash(token)).await)?;
        }
        audit::event("logout");
        Ok(())
    }

    /// Register a new identity. The returned verification token is the
    /// caller's to deliver; login requires the email to be verified.
    ///
    /// # Errors
    ///
    /// `RateLimitExceeded`, `InvalidEmail`, `WeakPassword`, or
    /// `IdentityExists` when the email is already registered within
    /// the tenant.
    pub async fn register(
        &self,
        request: RegisterRequest,
        client: ClientMeta,
    ) -> Result<RegisterOutcome, AuthError> {
        if self.limiter.check(&client.address, RateLimitAction::Register)
            == RateLimitDecision::Limited
        {
            audit::failure("register", "rate_limited", Some(&client));
            return Err(AuthError::RateLimitExceeded);
        }

        let email = normalize_email(&request.email);
        if !valid_email(&email) {
            return Err(AuthError::InvalidEmail);
        }

        let report = password::check_strength(&request.password);
        if !report.valid {
            return Err(AuthError::WeakPassword(report.violations));
        }

        let credential_hash = persistence(password::hash_password(&request.password))?;
        let outcome = persistence(
            self.store
                .create(NewIdentity {
                    tenant_id: request.tenant_id,
                    email,
                    credential_hash,
                })
                .await,
        )?;
        let identity = match outcome {
            CreateOutcome::Created(identity) => identity,
            CreateOutcome::Conflict => {
                audit::failure("register", "email_taken", Some(&client));
                return Err(AuthError::IdentityExists);
            }
        };

        let verification_token = issued(
            self.tokens
                .issue_verification(identity.id, self.config.verification_ttl_seconds()),
        )?;

        audit::success("register", identity.id, &identity.tenant_id, &client);
        Ok(RegisterOutcome {
            identity_id: identity.id,
            verification_token,
        })
    }

    /// Mark the identity behind a verification token as verified.
    /// Idempotent for an already-verified identity.
    ///
    /// # Errors
    ///
    /// Generic credential-validation failure for a bad or expired
    /// token.
    pub async fn verify_email(&self, token: &str) -> Result<Uuid, AuthError> {
        let claims = self.tokens.verify_kind(token, TokenKind::Verification)?;
        let identity_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::TokenMalformed)?;
        persistence(self.store.find_by_id(identity_id).await)?
            .ok_or(AuthError::TokenMalformed)?;
        persistence(self.store.mark_verified(identity_id).await)?;
        audit::identity_event("email_verified", identity_id);
        Ok(identity_id)
    }

    /// Issue a fresh verification token for an unverified identity.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if a store operation fails; an unknown or
    /// already-verified email is a `Noop`, not an error.
    pub async fn resend_verification(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<ResendOutcome, AuthError> {
        let email = normalize_email(email);
        let identity = persistence(self.store.find_by_email(tenant_id, &email).await)?;
        let Some(identity) = identity else {
            return Ok(ResendOutcome::Noop);
        };
        if identity.email_verified {
            return Ok(ResendOutcome::Noop);
        }

        let token = issued(
            self.tokens
                .issue_verification(identity.id, self.config.verification_ttl_seconds()),
        )?;
        Ok(ResendOutcome::Queued {
            identity_id: identity.id,
            token,
        })
    }

    /// Change the password of an authenticated identity and revoke its
    /// refresh tokens so other devices must log in again.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` if the current password does not verify;
    /// `WeakPassword` for a non-compliant replacement.
    pub async fn change_password(
        &self,
        identity_id: Uuid,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), AuthError> {
        let identity = persistence(self.store.find_by_id(identity_id).await)?
            .ok_or(AuthError::InvalidCredentials)?;
        if !password::verify_password(current_password, &identity.credential_hash) {
            audit::identity_event("change_password.bad_password", identity_id);
            return Err(AuthError::InvalidCredentials);
        }

        let report = password::check_strength(new_password);
        if !report.valid {
            return Err(AuthError::WeakPassword(report.violations));
        }

        let hash = persistence(password::hash_password(new_password))?;
        persistence(self.store.set_credential_hash(identity_id, &hash).await)?;
        persistence(self.store.revoke_all(identity_id).await)?;
        audit::identity_event("change_password", identity_id);
        Ok(())
    }

    /// Start a password reset. The token is the caller's to deliver.
    ///
    /// # Errors
    ///
    /// Returns `Persistence` if a store operation fails; an unknown
    /// email is a `Noop`, not an error.
    pub async fn request_password_reset(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<ResetRequestOutcome, AuthError> {
        let email = normalize_email(email);
        let identity = persistence(self.store.find_by_email(tenant_id, &email).await)?;
        let Some(identity) = identity else {
            return Ok(ResetRequestOutcome::Noop);
        };

        let token =
            issued(self.tokens.issue_reset(identity.id, self.config.reset_token_ttl_seconds()))?;
        audit::identity_event("password_reset.requested", identity.id);
        Ok(ResetRequestOutcome::Issued {
            identity_id: identity.id,
            token,
        })
    }

    /// Complete a password reset and revoke all refresh tokens.
    ///
    /// # Errors
    ///
    /// Generic credential-validation failure for a bad or expired
    /// token; `WeakPassword` for a non-compliant replacement.
    pub async fn confirm_password_reset(
        &self,
        token: &str,
        new_password: &str,
    ) -> Result<Uuid, AuthError> {
        let claims = self.tokens.verify_kind(token, TokenKind::Reset)?;
        let identity_id = Uuid::parse_str(&claims.sub).map_err(|_| AuthError::TokenMalformed)?;
        persistence(self.store.find_by_id(identity_id).await)?
            .ok_or(AuthError::TokenMalformed)?;

        let report = password::check_strength(new_password);
        if !report.valid {
            return Err(AuthError::WeakPassword(report.violations));
        }

        let hash = persistence(password::hash_password(new_password))?;
        persistence(self.store.set_credential_hash(identity_id, &hash).await)?;
        persistence(self.store.revoke_all(identity_id).await)?;
        audit::identity_event("password_reset.completed", identity_id);
        Ok(identity_id)
    }

    /// Enroll 2FA. Returns the secret, the provisioning URI, and the
    /// backup codes exactly once; storage keeps only the sealed secret
    /// and the code hashes.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` if the password does not verify.
    pub async fn setup_totp(
        &self,
        identity_id: Uuid,
        current_password: &str,
    ) -> Result<TotpSetup, AuthError> {
        let identity = persistence(self.store.find_by_id(identity_id).await)?
            .ok_or(AuthError::InvalidCredentials)?;
        if !password::verify_password(current_password, &identity.credential_hash) {
            audit::identity_event("totp_setup.bad_password", identity_id);
            return Err(AuthError::InvalidCredentials);
        }

        let secret = totp::generate_secret();
        let provisioning_uri = persistence(totp::provisioning_uri(
            self.config.totp_issuer(),
            &identity.email,
            &secret,
        ))?;
        let backup_codes = totp::generate_backup_codes();
        let backup_code_hashes = persistence(totp::hash_backup_codes(&backup_codes))?;

        let ciphertext = persistence(totp::crypto::seal_secret(
            self.config.totp_key(),
            self.config.totp_key_id(),
            &identity.tenant_id,
            identity.id,
            &secret,
        ))?;
        persistence(
            self.store
                .set_totp(
                    identity.id,
                    &TotpEnrollment {
                        ciphertext,
                        key_id: self.config.totp_key_id().to_string(),
                        backup_code_hashes,
                    },
                )
                .await,
        )?;

        audit::identity_event("totp_enabled", identity_id);
        Ok(TotpSetup {
            secret,
            provisioning_uri,
            backup_codes,
        })
    }

    /// Check a code against the identity's enrolled secret, e.g. to
    /// confirm enrollment after setup.
    ///
    /// # Errors
    ///
    /// `InvalidTwoFactorCode` when no enrollment exists or the code
    /// does not match the current or adjacent time step.
    pub async fn verify_totp_code(&self, identity_id: Uuid, code: &str) -> Result<(), AuthError> {
        let identity = persistence(self.store.find_by_id(identity_id).await)?
            .ok_or(AuthError::InvalidCredentials)?;
        let Some(enrollment) = &identity.totp else {
            return Err(AuthError::InvalidTwoFactorCode);
        };

        let secret = persistence(totp::crypto::open_secret(
            self.config.totp_key(),
            enrollment.key_id.as_str(),
            &identity.tenant_id,
            identity.id,
            &enrollment.ciphertext,
        ))?;
        if totp::verify_code(&secret, code, self.clock.now_unix()) {
            Ok(())
        } else {
            Err(AuthError::InvalidTwoFactorCode)
        }
    }

    /// Disable 2FA. A wrong password leaves the stored enrollment
    /// untouched.
    ///
    /// # Errors
    ///
    /// `InvalidCredentials` if the password does not verify.
    pub async fn disable_totp(
        &self,
        identity_id: Uuid,
        current_password: &str,
    ) -> Result<(), AuthError> {
        let identity = persistence(self.store.find_by_id(identity_id).await)?
            .ok_or(AuthError::InvalidCredentials)?;
        if !password::verify_password(current_password, &identity.credential_hash) {
            audit::identity_event("totp_disable.bad_password", identity_id);
            return Err(AuthError::InvalidCredentials);
        }

        persistence(self.store.clear_totp(identity_id).await)?;
        audit::identity_event("totp_disabled", identity_id);
        Ok(())
    }
}

impl<S> std::fmt::Debug for IdentityService<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityService")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
