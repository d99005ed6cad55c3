//! Time-based one-time-password support.
//!
//! Secrets are 160-bit random values, base32-encoded for provisioning
//! and encrypted with [`crypto`] before they touch storage. Codes are
//! six digits on a 30-second step with one step of skew tolerance.

pub mod crypto;
mod engine;

pub use engine::{
    BACKUP_CODE_COUNT, generate_backup_codes, generate_secret, hash_backup_codes,
    match_backup_code, provisioning_uri, verify_code,
};
