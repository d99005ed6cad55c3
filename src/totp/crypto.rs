//! Encryption of TOTP secrets at rest.
//!
//! Uses ChaCha20-Poly1305 with a process-held key. The envelope is
//! `nonce (12 bytes) || ciphertext`; the AAD binds the key id, tenant,
//! and identity so a ciphertext cannot be replayed for another account
//! or silently decrypted under a rotated key.

use anyhow::Result;
use chacha20poly1305::{
    ChaCha20Poly1305, Key, Nonce,
    aead::{Aead, KeyInit, Payload},
};
use rand::{RngCore, rngs::OsRng};
use uuid::Uuid;

const NONCE_LEN: usize = 12;

/// Encrypt a base32 TOTP secret for storage.
///
/// # Errors
///
/// Returns an error if encryption fails.
pub fn seal_secret(
    key: &[u8; 32],
    key_id: &str,
    tenant_id: &str,
    identity_id: Uuid,
    secret_base32: &str,
) -> Result<Vec<u8>> {
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let mut nonce_bytes = [0u8; NONCE_LEN];
    OsRng.fill_bytes(&mut nonce_bytes);
    let nonce = Nonce::from_slice(&nonce_bytes);

    let aad = construct_aad(key_id, tenant_id, identity_id);
    let payload = Payload {
        msg: secret_base32.as_bytes(),
        aad: &aad,
    };

    let ciphertext = cipher
        .encrypt(nonce, payload)
        .map_err(|e| anyhow::anyhow!("encryption failure: {e}"))?;

    let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
    sealed.extend_from_slice(&nonce_bytes);
    sealed.extend_from_slice(&ciphertext);
    Ok(sealed)
}

/// Decrypt a stored TOTP secret. Expects `nonce || ciphertext`.
///
/// # Errors
///
/// Returns an error if the envelope is too short, the AAD does not
/// match, or decryption fails.
pub fn open_secret(
    key: &[u8; 32],
    key_id: &str,
    tenant_id: &str,
    identity_id: Uuid,
    sealed: &[u8],
) -> Result<String> {
    if sealed.len() < NONCE_LEN {
        return Err(anyhow::anyhow!("invalid ciphertext length"));
    }

    let (nonce_bytes, ciphertext) = sealed.split_at(NONCE_LEN);
    let nonce = Nonce::from_slice(nonce_bytes);
    let cipher = ChaCha20Poly1305::new(Key::from_slice(key));

    let aad = construct_aad(key_id, tenant_id, identity_id);
    let payload = Payload {
        msg: ciphertext,
        aad: &aad,
    };

    let plaintext = cipher
        .decrypt(nonce, payload)
        .map_err(|e| anyhow::anyhow!("decryption failure: {e}"))?;

    String::from_utf8(plaintext).map_err(|_| anyhow::anyhow!("secret is not valid utf-8"))
}

fn construct_aad(key_id: &str, tenant_id: &str, identity_id: Uuid) -> Vec<u8> {
    // AAD = "totp-secret:v1|key_id|tenant_id|identity_id"
    format!("totp-secret:v1|{key_id}|{tenant_id}|{identity_id}").into_bytes()
}
