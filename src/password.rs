//! Password hashing and strength policy.
//!
//! Hashes are Argon2id with per-password random salts; verification is
//! constant-time through the `password_hash` comparison. Hashes are the
//! only credential form that ever reaches storage or logs.

use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier, password_hash::SaltString};
use rand::{Rng, rngs::OsRng};

const MIN_PASSWORD_LEN: usize = 8;
const SYMBOLS: &str = "!@#$%^&*";
const GENERATED_ALPHABET: &[u8] =
    b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789!@#$%^&*";

/// Result of a strength check: valid, or the list of violated rules.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StrengthReport {
    pub valid: bool,
    pub violations: Vec<String>,
}

/// Hash a password with Argon2id and a fresh random salt.
///
/// # Errors
///
/// Returns an error if the hasher rejects its input, which does not
/// happen for the default parameter set.
pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|_| anyhow::anyhow!("failed to hash password"))?
        .to_string();
    Ok(hash)
}

/// Verify a password against its stored hash. Any parse or mismatch
/// failure is reported as `false`; callers never see which.
#[must_use]
pub fn verify_password(password: &str, stored_hash: &str) -> bool {
    let Ok(parsed) = PasswordHash::new(stored_hash) else {
        return false;
    };
    Argon2::default()
        .verify_password(password.as_bytes(), &parsed)
        .is_ok()
}

/// Well-formed Argon2id hash that matches no password. Verified
/// against when no identity matched, so an unknown email costs the
/// same hashing work as a wrong password.
const DUMMY_HASH: &str = "$argon2id$v=19$m=19456,t=2,p=1$MDEyMzQ1Njc4OWFiY2RlZg$AAECAwQFBgcICQoLDA0ODxAREhMUFRYXGBkaGxwdHh8";

/// Burn one verification's worth of work without a stored hash.
pub(crate) fn verify_dummy(password: &str) {
    let _ = verify_password(password, DUMMY_HASH);
}

/// Check the password against the strength policy: length >= 8 plus at
/// least one uppercase, lowercase, digit, and symbol from `!@#$%^&*`.
#[must_use]
pub fn check_strength(password: &str) -> StrengthReport {
    let mut violations = Vec::new();

    if password.chars().count() < MIN_PASSWORD_LEN {
        violations.push("Password must be at least 8 characters long".to_string());
    }
    if !password.chars().any(|ch| ch.is_ascii_uppercase()) {
        violations.push("Password must contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(|ch| ch.is_ascii_lowercase()) {
        violations.push("Password must contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|ch| ch.is_ascii_digit()) {
        violations.push("Password must contain at least one digit".to_string());
    }
    if !password.chars().any(|ch| SYMBOLS.contains(ch)) {
        violations.push(format!(
            "Password must contain at least one special character ({SYMBOLS})"
        ));
    }

    StrengthReport {
        valid: violations.is_empty(),
        violations,
    }
}

/// Generate a random password that satisfies the strength policy,
/// sampling until every character class is present.
#[must_use]
pub fn generate_password(length: usize) -> String {
    let length = length.max(MIN_PASSWORD_LEN);
    let mut rng = OsRng;
    loop {
        let candidate: String = (0..length)
            .map(|_| {
                let idx = rng.gen_range(0..GENERATED_ALPHABET.len());
                GENERATED_ALPHABET[idx] as char
            })
            .collect();
        if check_strength(&candidate).valid {
            return candidate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;

    #[test]
    fn hash_and_verify_round_trip() -> Result<()> {
        let hash = hash_password("Str0ng!Pass")?;
        assert!(verify_password("Str0ng!Pass", &hash));
        assert!(!verify_password("Wr0ng!Pass", &hash));
        Ok(())
    }

    #[test]
    fn hashes_are_salted() -> Result<()> {
        let first = hash_password("Str0ng!Pass")?;
        let second = hash_password("Str0ng!Pass")?;
        assert_ne!(first, second);
        Ok(())
    }

    #[test]
    fn verify_rejects_garbage_hash() {
        assert!(!verify_password("Str0ng!Pass", "not-a-phc-string"));
    }

    #[test]
    fn dummy_hash_is_well_formed_and_matches_nothing() {
        // A parse failure would skip the hashing work entirely.
        assert!(PasswordHash::new(DUMMY_HASH).is_ok());
        assert!(!verify_password("Str0ng!Pass", DUMMY_HASH));
        verify_dummy("Str0ng!Pass");
    }

    #[test]
    fn strength_accepts_compliant_password() {
        let report = check_strength("Str0ng!Pass");
        assert!(report.valid);
        assert!(report.violations.is_empty());
    }

    #[test]
    fn strength_reports_each_violation() {
        let report = check_strength("short");
        assert!(!report.valid);
        // length, uppercase, digit, symbol
        assert_eq!(report.violations.len(), 4);

        let report = check_strength("alllowercase1!");
        assert_eq!(report.violations.len(), 1);
    }

    #[test]
    fn generated_passwords_pass_policy() {
        for _ in 0..8 {
            let password = generate_password(16);
            assert_eq!(password.chars().count(), 16);
            assert!(check_strength(&password).valid);
        }
    }
}
