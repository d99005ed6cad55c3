//! Secret generation, code verification, and backup codes.

use anyhow::{Result, anyhow};
use rand::{Rng, RngCore, rngs::OsRng};
use totp_rs::{Algorithm, Secret, TOTP};

use crate::password;

/// Number of backup codes issued at 2FA setup.
pub const BACKUP_CODE_COUNT: usize = 10;

const SECRET_LEN_BYTES: usize = 20;
const DIGITS: usize = 6;
const STEP_SECONDS: u64 = 30;
/// Steps of clock-skew tolerance on either side of the current one.
const SKEW: u8 = 1;
const BACKUP_CODE_DIGITS: u32 = 8;

/// Generate a new 160-bit shared secret, base32-encoded.
#[must_use]
pub fn generate_secret() -> String {
    let mut bytes = vec![0u8; SECRET_LEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    match Secret::Raw(bytes).to_encoded() {
        Secret::Encoded(encoded) => encoded,
        Secret::Raw(_) => unreachable!("to_encoded always yields Encoded"),
    }
}

fn totp_for_secret(secret_base32: &str, issuer: &str, account: &str) -> Result<TOTP> {
    let secret_bytes = Secret::Encoded(secret_base32.to_string())
        .to_bytes()
        .map_err(|e| anyhow!("invalid totp secret: {e:?}"))?;
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        SKEW,
        STEP_SECONDS,
        secret_bytes,
        Some(issuer.to_string()),
        account.to_string(),
    )
    .map_err(|e| anyhow!("totp init error: {e}"))
}

/// Check a submitted code against the secret at the given time.
///
/// Codes for the current step and one step either side are accepted to
/// tolerate clock skew. Every failure path returns `false`; nothing
/// about the cause is surfaced.
#[must_use]
pub fn verify_code(secret_base32: &str, code: &str, at_unix: i64) -> bool {
    if code.len() != DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
        return false;
    }
    let Ok(at) = u64::try_from(at_unix) else {
        return false;
    };
    // Label and issuer do not participate in code generation.
    let Ok(totp) = totp_for_secret(secret_base32, "verify", "verify") else {
        return false;
    };
    totp.check(code, at)
}

/// Build the `otpauth://totp/...` provisioning URI for enrollment.
///
/// # Errors
///
/// Returns an error if the secret cannot be decoded or the issuer is
/// not representable in an otpauth label.
pub fn provisioning_uri(issuer: &str, account: &str, secret_base32: &str) -> Result<String> {
    let totp = totp_for_secret(secret_base32, issuer, account)?;
    Ok(totp.get_url())
}

/// Generate independently random 8-digit numeric backup codes.
#[must_use]
pub fn generate_backup_codes() -> Vec<String> {
    let mut rng = OsRng;
    (0..BACKUP_CODE_COUNT)
        .map(|_| format!("{:08}", rng.gen_range(0..10u32.pow(BACKUP_CODE_DIGITS))))
        .collect()
}

/// Hash backup codes for storage; plaintext codes are shown once at
/// setup and never re-displayable.
///
/// # Errors
///
/// Returns an error if hashing fails.
pub fn hash_backup_codes(codes: &[String]) -> Result<Vec<String>> {
    codes.iter().map(|code| password::hash_password(code)).collect()
}

/// Find which stored hash a submitted backup code matches, so the
/// used code can be removed from the remaining set.
#[must_use]
pub fn match_backup_code(code: &str, stored_hashes: &[String]) -> Option<usize> {
    stored_hashes
        .iter()
        .position(|hash| password::verify_password(code, hash))
}
