//! Persistence-facing contracts for identities, refresh tokens, and
//! session records.
//!
//! The schema and migrations live outside this crate; the traits here
//! are the surface the identity flows consume. Raw token values never
//! reach a store. Callers hash them with [`token_hash`] first and all
//! lookups are by hash.

use anyhow::Result;
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use uuid::Uuid;

mod memory;
mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

/// Hash a token for storage and lookup. SHA-256 of the raw value.
#[must_use]
pub fn token_hash(token: &str) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hasher.finalize().to_vec()
}

/// An identity's 2FA enrollment as held at rest.
///
/// The shared secret is sealed with a process key; `key_id` records
/// which key sealed it so rotation can be handled explicitly. Backup
/// codes are kept only as slow hashes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TotpEnrollment {
    pub ciphertext: Vec<u8>,
    pub key_id: String,
    pub backup_code_hashes: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct IdentityRecord {
    pub id: Uuid,
    pub tenant_id: String,
    pub email: String,
    pub credential_hash: String,
    pub email_verified: bool,
    pub totp: Option<TotpEnrollment>,
}

#[derive(Clone, Debug)]
pub struct NewIdentity {
    pub tenant_id: String,
    pub email: String,
    pub credential_hash: String,
}

/// Outcome when attempting to create a new identity.
#[derive(Debug)]
pub enum CreateOutcome {
    Created(IdentityRecord),
    /// The email is already registered within the tenant.
    Conflict,
}

/// Client details captured alongside sessions for audit purposes.
#[derive(Clone, Debug, Default)]
pub struct ClientMeta {
    pub address: String,
    pub agent: Option<String>,
}

#[derive(Clone, Debug)]
pub struct RefreshRecord {
    pub token_hash: Vec<u8>,
    pub identity_id: Uuid,
    pub expires_at: i64,
}

#[derive(Clone, Debug)]
pub struct SessionRecord {
    pub token_hash: Vec<u8>,
    pub identity_id: Uuid,
    pub tenant_id: String,
    pub client: ClientMeta,
    pub created_at: i64,
    pub expires_at: i64,
}

#[async_trait]
pub trait IdentityStore: Send + Sync {
    /// Look up by normalized email within a tenant.
    async fn find_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Option<IdentityRecord>>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<IdentityRecord>>;

    async fn create(&self, new: NewIdentity) -> Result<CreateOutcome>;

    async fn set_credential_hash(&self, id: Uuid, credential_hash: &str) -> Result<()>;

    async fn set_totp(&self, id: Uuid, enrollment: &TotpEnrollment) -> Result<()>;

    async fn clear_totp(&self, id: Uuid) -> Result<()>;

    async fn mark_verified(&self, id: Uuid) -> Result<()>;

    /// Role names assigned to the identity.
    async fn role_names(&self, id: Uuid) -> Result<Vec<String>>;

    /// Permission names granted through any of the identity's roles.
    /// May contain duplicates; callers collapse them with set semantics.
    async fn permission_names(&self, id: Uuid) -> Result<Vec<String>>;
}

#[async_trait]
pub trait RefreshTokenStore: Send + Sync {
    async fn insert(&self, record: RefreshRecord) -> Result<()>;

    async fn find(&self, token_hash: &[u8]) -> Result<Option<RefreshRecord>>;

    /// Delete by hash. Deleting an absent record is not an error.
    async fn delete(&self, token_hash: &[u8]) -> Result<()>;

    /// Drop every refresh record for the identity.
    async fn revoke_all(&self, identity_id: Uuid) -> Result<()>;
}

#[async_trait]
pub trait SessionStore: Send + Sync {
    async fn insert(&self, record: SessionRecord) -> Result<()>;

    async fn find(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>>;

    async fn delete(&self, token_hash: &[u8]) -> Result<()>;
}
