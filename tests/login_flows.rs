//! End-to-end flows over the in-memory store with a simulated clock.

use std::sync::Arc;

use anyhow::Result;
use secrecy::SecretString;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use chainguard_identity::clock::ManualClock;
use chainguard_identity::rate_limit::{NoopRateLimiter, RateLimiter, SlidingWindowLimiter};
use chainguard_identity::service::{
    LoginRequest, RegisterRequest, ResendOutcome, ResetRequestOutcome,
};
use chainguard_identity::store::{ClientMeta, IdentityStore, MemoryStore};
use chainguard_identity::token::TokenKind;
use chainguard_identity::{AuthError, IdentityConfig, IdentityService};

const NOW: i64 = 1_700_000_000;
const TENANT: &str = "tenant-1";
const EMAIL: &str = "a@b.com";
const PASSWORD: &str = "Str0ng!Pass";

struct Harness {
    service: IdentityService<MemoryStore>,
    store: Arc<MemoryStore>,
    clock: Arc<ManualClock>,
}

fn harness_with_limiter(limiter: Arc<dyn RateLimiter>) -> Harness {
    let clock = ManualClock::new(NOW);
    let store = Arc::new(MemoryStore::new());
    let config = IdentityConfig::new(
        SecretString::from("integration-signing-secret".to_string()),
        [9u8; 32],
        "k1".to_string(),
    );
    let service = IdentityService::new(config, clock.clone(), limiter, store.clone());
    Harness {
        service,
        store,
        clock,
    }
}

fn harness() -> Harness {
    harness_with_limiter(Arc::new(NoopRateLimiter))
}

fn client() -> ClientMeta {
    ClientMeta {
        address: "198.51.100.7".to_string(),
        agent: Some("integration-tests".to_string()),
    }
}

fn login_request() -> LoginRequest {
    LoginRequest {
        tenant_id: TENANT.to_string(),
        email: EMAIL.to_string(),
        password: PASSWORD.to_string(),
        totp_code: None,
        remember_me: false,
    }
}

async fn register_verified(harness: &Harness) -> Result<Uuid> {
    let outcome = harness
        .service
        .register(
            RegisterRequest {
                tenant_id: TENANT.to_string(),
                email: EMAIL.to_string(),
                password: PASSWORD.to_string(),
            },
            client(),
        )
        .await?;
    harness
        .service
        .verify_email(&outcome.verification_token)
        .await?;
    Ok(outcome.identity_id)
}

fn totp_code(secret_base32: &str, at: i64) -> Result<String> {
    let secret = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| anyhow::anyhow!("{e:?}"))?;
    let totp = TOTP::new(
        Algorithm::SHA1,
        6,
        1,
        30,
        secret,
        Some("test".to_string()),
        "test".to_string(),
    )?;
    Ok(totp.generate(u64::try_from(at)?))
}

#[tokio::test]
async fn login_issues_all_three_tokens_with_permission_claims() -> Result<()> {
    let harness = harness();
    let identity_id = register_verified(&harness).await?;
    harness
        .store
        .grant(identity_id, &["auditor"], &["project:read", "finding:read"]);

    let outcome = harness.service.login(login_request(), client()).await?;

    let access = harness
        .service
        .tokens()
        .verify_kind(&outcome.access_token, TokenKind::Access)?;
    assert_eq!(access.sub, identity_id.to_string());
    assert_eq!(access.tenant_id.as_deref(), Some(TENANT));
    assert_eq!(
        access.permissions,
        Some(vec!["finding:read".to_string(), "project:read".to_string()])
    );
    assert_eq!(access.exp - access.iat, 1800);

    let refresh = harness
        .service
        .tokens()
        .verify_kind(&outcome.refresh_token, TokenKind::Refresh)?;
    assert_eq!(refresh.permissions, None);

    // Session token is access-kind with the session lifetime.
    let session = harness
        .service
        .tokens()
        .verify_kind(&outcome.session_token, TokenKind::Access)?;
    assert_eq!(session.exp - session.iat, 86_400);

    assert_eq!(harness.store.refresh_count(), 1);
    assert_eq!(harness.store.session_count(), 1);
    Ok(())
}

#[tokio::test]
async fn remember_me_extends_access_lifetime() -> Result<()> {
    let harness = harness();
    register_verified(&harness).await?;

    let mut request = login_request();
    request.remember_me = true;
    let outcome = harness.service.login(request, client()).await?;
    let claims = harness
        .service
        .tokens()
        .verify_kind(&outcome.access_token, TokenKind::Access)?;
    assert_eq!(claims.exp - claims.iat, 86_400);
    Ok(())
}

#[tokio::test]
async fn unknown_email_and_wrong_password_are_indistinguishable() -> Result<()> {
    let harness = harness();
    register_verified(&harness).await?;

    let mut wrong_password = login_request();
    wrong_password.password = "Wr0ng!Pass".to_string();
    let err_password = harness
        .service
        .login(wrong_password, client())
        .await
        .expect_err("wrong password must fail");

    let mut unknown = login_request();
    unknown.email = "nobody@b.com".to_string();
    let err_unknown = harness
        .service
        .login(unknown, client())
        .await
        .expect_err("unknown email must fail");

    assert!(matches!(err_password, AuthError::InvalidCredentials));
    assert!(matches!(err_unknown, AuthError::InvalidCredentials));
    assert_eq!(err_password.public_message(), err_unknown.public_message());
    Ok(())
}

#[tokio::test]
async fn unverified_email_cannot_log_in() -> Result<()> {
    let harness = harness();
    harness
        .service
        .register(
            RegisterRequest {
                tenant_id: TENANT.to_string(),
                email: EMAIL.to_string(),
                password: PASSWORD.to_string(),
            },
            client(),
        )
        .await?;

    let err = harness
        .service
        .login(login_request(), client())
        .await
        .expect_err("unverified login must fail");
    assert!(matches!(err, AuthError::EmailNotVerified));
    Ok(())
}

#[tokio::test]
async fn registration_rejects_duplicates_weak_passwords_and_bad_emails() -> Result<()> {
    let harness = harness();
    register_verified(&harness).await?;

    let duplicate = harness
        .service
        .register(
            RegisterRequest {
                tenant_id: TENANT.to_string(),
                email: "  A@B.COM ".to_string(),
                password: PASSWORD.to_string(),
            },
            client(),
        )
        .await;
    assert!(matches!(duplicate, Err(AuthError::IdentityExists)));

    let weak = harness
        .service
        .register(
            RegisterRequest {
                tenant_id: TENANT.to_string(),
                email: "new@b.com".to_string(),
                password: "weak".to_string(),
            },
            client(),
        )
        .await;
    assert!(matches!(weak, Err(AuthError::WeakPassword(_))));

    let bad_email = harness
        .service
        .register(
            RegisterRequest {
                tenant_id: TENANT.to_string(),
                email: "not-an-email".to_string(),
                password: PASSWORD.to_string(),
            },
            client(),
        )
        .await;
    assert!(matches!(bad_email, Err(AuthError::InvalidEmail)));
    Ok(())
}

#[tokio::test]
async fn resend_verification_is_enumeration_safe() -> Result<()> {
    let harness = harness();
    register_verified(&harness).await?;

    // Unknown and already-verified emails answer identically.
    let unknown = harness
        .service
        .resend_verification(TENANT, "nobody@b.com")
        .await?;
    assert!(matches!(unknown, ResendOutcome::Noop));

    let verified = harness.service.resend_verification(TENANT, EMAIL).await?;
    assert!(matches!(verified, ResendOutcome::Noop));
    Ok(())
}

#[tokio::test]
async fn resent_verification_token_verifies_the_email() -> Result<()> {
    let harness = harness();
    let outcome = harness
        .service
        .register(
            RegisterRequest {
                tenant_id: TENANT.to_string(),
                email: EMAIL.to_string(),
                password: PASSWORD.to_string(),
            },
            client(),
        )
        .await?;

    let resent = harness.service.resend_verification(TENANT, EMAIL).await?;
    let ResendOutcome::Queued { identity_id, token } = resent else {
        anyhow::bail!("expected a fresh token for an unverified identity");
    };
    assert_eq!(identity_id, outcome.identity_id);

    assert_eq!(harness.service.verify_email(&token).await?, identity_id);
    assert!(harness.service.login(login_request(), client()).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn totp_code_check_confirms_enrollment() -> Result<()> {
    let harness = harness();
    let identity_id = register_verified(&harness).await?;

    // Before setup there is nothing to check against.
    let err = harness
        .service
        .verify_totp_code(identity_id, "123456")
        .await
        .expect_err("no enrollment must fail");
    assert!(matches!(err, AuthError::InvalidTwoFactorCode));

    let setup = harness.service.setup_totp(identity_id, PASSWORD).await?;
    let code = totp_code(&setup.secret, NOW)?;
    harness.service.verify_totp_code(identity_id, &code).await?;

    let err = harness
        .service
        .verify_totp_code(identity_id, "000000")
        .await
        .expect_err("wrong code must fail");
    assert!(matches!(err, AuthError::InvalidTwoFactorCode));
    Ok(())
}

#[tokio::test]
async fn totp_required_before_any_token_is_issued() -> Result<()> {
    let harness = harness();
    let identity_id = register_verified(&harness).await?;
    harness.service.setup_totp(identity_id, PASSWORD).await?;

    let err = harness
        .service
        .login(login_request(), client())
        .await
        .expect_err("missing code must fail");
    assert!(matches!(err, AuthError::TwoFactorRequired));

    // Nothing was persisted before the 2FA step failed.
    assert_eq!(harness.store.refresh_count(), 0);
    assert_eq!(harness.store.session_count(), 0);
    Ok(())
}

#[tokio::test]
async fn totp_login_accepts_current_code_and_rejects_others() -> Result<()> {
    let harness = harness();
    let identity_id = register_verified(&harness).await?;
    let setup = harness.service.setup_totp(identity_id, PASSWORD).await?;

    let mut request = login_request();
    request.totp_code = Some(totp_code(&setup.secret, NOW)?);
    assert!(harness.service.login(request, client()).await.is_ok());

    let mut stale = login_request();
    stale.totp_code = Some(totp_code(&setup.secret, NOW - 300)?);
    let err = harness
        .service
        .login(stale, client())
        .await
        .expect_err("stale code must fail");
    assert!(matches!(err, AuthError::InvalidTwoFactorCode));
    Ok(())
}

#[tokio::test]
async fn backup_code_works_exactly_once() -> Result<()> {
    let harness = harness();
    let identity_id = register_verified(&harness).await?;
    let setup = harness.service.setup_totp(identity_id, PASSWORD).await?;
    let backup_code = setup.backup_codes[0].clone();

    let mut request = login_request();
    request.totp_code = Some(backup_code.clone());
    assert!(harness.service.login(request, client()).await.is_ok());

    let mut replay = login_request();
    replay.totp_code = Some(backup_code);
    let err = harness
        .service
        .login(replay, client())
        .await
        .expect_err("spent backup code must fail");
    assert!(matches!(err, AuthError::InvalidTwoFactorCode));
    Ok(())
}

#[tokio::test]
async fn disabling_totp_with_wrong_password_leaves_enrollment() -> Result<()> {
    let harness = harness();
    let identity_id = register_verified(&harness).await?;
    harness.service.setup_totp(identity_id, PASSWORD).await?;

    let err = harness
        .service
        .disable_totp(identity_id, "Wr0ng!Pass")
        .await
        .expect_err("wrong password must fail");
    assert!(matches!(err, AuthError::InvalidCredentials));

    let identity = harness
        .store
        .find_by_id(identity_id)
        .await?
        .expect("identity exists");
    assert!(identity.totp.is_some());

    harness.service.disable_totp(identity_id, PASSWORD).await?;
    let identity = harness
        .store
        .find_by_id(identity_id)
        .await?
        .expect("identity exists");
    assert!(identity.totp.is_none());
    Ok(())
}

#[tokio::test]
async fn sixth_rapid_login_is_rate_limited_regardless_of_credentials() -> Result<()> {
    let clock = ManualClock::new(NOW);
    let limiter = Arc::new(SlidingWindowLimiter::new(clock));
    let harness = harness_with_limiter(limiter);
    register_verified(&harness).await?;

    for _ in 0..5 {
        // Correct credentials; each attempt still consumes budget.
        harness.service.login(login_request(), client()).await?;
    }
    let err = harness
        .service
        .login(login_request(), client())
        .await
        .expect_err("sixth attempt must be throttled");
    assert!(matches!(err, AuthError::RateLimitExceeded));
    Ok(())
}

#[tokio::test]
async fn refresh_re_resolves_permissions_from_the_store() -> Result<()> {
    let harness = harness();
    let identity_id = register_verified(&harness).await?;
    harness.store.grant(identity_id, &[], &["project:read"]);

    let outcome = harness.service.login(login_request(), client()).await?;

    // A grant after login shows up in the next refresh, not the old
    // access token.
    harness.store.grant(identity_id, &[], &["project:write"]);
    let refreshed = harness.service.refresh(&outcome.refresh_token).await?;
    assert_eq!(
        refreshed.permissions,
        vec!["project:read".to_string(), "project:write".to_string()]
    );
    Ok(())
}

#[tokio::test]
async fn logout_revokes_refresh_and_is_idempotent() -> Result<()> {
    let harness = harness();
    register_verified(&harness).await?;
    let outcome = harness.service.login(login_request(), client()).await?;

    harness
        .service
        .logout(Some(&outcome.refresh_token), Some(&outcome.session_token))
        .await?;
    assert_eq!(harness.store.refresh_count(), 0);
    assert_eq!(harness.store.session_count(), 0);

    let err = harness
        .service
        .refresh(&outcome.refresh_token)
        .await
        .expect_err("revoked token must fail");
    assert_eq!(err.public_message(), "Could not validate credentials");

    // A second logout with the same tokens is a no-op.
    harness
        .service
        .logout(Some(&outcome.refresh_token), Some(&outcome.session_token))
        .await?;
    Ok(())
}

#[tokio::test]
async fn expired_refresh_token_fails_with_the_generic_surface() -> Result<()> {
    let harness = harness();
    register_verified(&harness).await?;
    let outcome = harness.service.login(login_request(), client()).await?;

    harness.clock.advance(31 * 86_400);
    let err = harness
        .service
        .refresh(&outcome.refresh_token)
        .await
        .expect_err("expired token must fail");
    assert_eq!(err.status_code(), 401);
    assert_eq!(err.public_message(), "Could not validate credentials");
    Ok(())
}

#[tokio::test]
async fn change_password_revokes_refresh_tokens() -> Result<()> {
    let harness = harness();
    let identity_id = register_verified(&harness).await?;
    let outcome = harness.service.login(login_request(), client()).await?;

    harness
        .service
        .change_password(identity_id, PASSWORD, "N3w!Passw0rd")
        .await?;

    let err = harness
        .service
        .refresh(&outcome.refresh_token)
        .await
        .expect_err("refresh must fail after password change");
    assert_eq!(err.status_code(), 401);

    let mut request = login_request();
    request.password = "N3w!Passw0rd".to_string();
    assert!(harness.service.login(request, client()).await.is_ok());
    Ok(())
}

#[tokio::test]
async fn password_reset_flow_replaces_credential_and_revokes_refresh() -> Result<()> {
    let harness = harness();
    register_verified(&harness).await?;
    let outcome = harness.service.login(login_request(), client()).await?;

    let reset = harness
        .service
        .request_password_reset(TENANT, EMAIL)
        .await?;
    let ResetRequestOutcome::Issued { token, .. } = reset else {
        anyhow::bail!("expected a reset token for a known email");
    };

    harness
        .service
        .confirm_password_reset(&token, "N3w!Passw0rd")
        .await?;

    let err = harness
        .service
        .login(login_request(), client())
        .await
        .expect_err("old password must fail");
    assert!(matches!(err, AuthError::InvalidCredentials));

    let mut request = login_request();
    request.password = "N3w!Passw0rd".to_string();
    assert!(harness.service.login(request, client()).await.is_ok());

    assert!(harness.service.refresh(&outcome.refresh_token).await.is_err());
    Ok(())
}

#[tokio::test]
async fn reset_request_for_unknown_email_is_a_noop() -> Result<()> {
    let harness = harness();
    register_verified(&harness).await?;

    let outcome = harness
        .service
        .request_password_reset(TENANT, "nobody@b.com")
        .await?;
    assert!(matches!(outcome, ResetRequestOutcome::Noop));
    Ok(())
}

#[tokio::test]
async fn reset_token_expires() -> Result<()> {
    let harness = harness();
    register_verified(&harness).await?;

    let ResetRequestOutcome::Issued { token, .. } = harness
        .service
        .request_password_reset(TENANT, EMAIL)
        .await?
    else {
        anyhow::bail!("expected a reset token");
    };

    harness.clock.advance(3601);
    let err = harness
        .service
        .confirm_password_reset(&token, "N3w!Passw0rd")
        .await
        .expect_err("expired reset token must fail");
    assert_eq!(err.public_message(), "Could not validate credentials");
    Ok(())
}

#[tokio::test]
async fn verification_token_cannot_be_used_as_an_access_token() -> Result<()> {
    let harness = harness();
    let outcome = harness
        .service
        .register(
            RegisterRequest {
                tenant_id: TENANT.to_string(),
                email: EMAIL.to_string(),
                password: PASSWORD.to_string(),
            },
            client(),
        )
        .await?;

    let err = harness
        .service
        .verify_access(&outcome.verification_token)
        .expect_err("verification token is not an API credential");
    assert_eq!(err.status_code(), 401);
    Ok(())
}
