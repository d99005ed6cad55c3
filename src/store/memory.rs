//! In-memory store used by tests and local development.

use std::collections::HashMap;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;
use uuid::Uuid;

use super::{
    CreateOutcome, IdentityRecord, IdentityStore, NewIdentity, RefreshRecord, RefreshTokenStore,
    SessionRecord, SessionStore, TotpEnrollment,
};

#[derive(Default)]
struct Inner {
    identities: HashMap<Uuid, IdentityRecord>,
    roles: HashMap<Uuid, Vec<String>>,
    permissions: HashMap<Uuid, Vec<String>>,
    refresh_tokens: HashMap<Vec<u8>, RefreshRecord>,
    sessions: HashMap<Vec<u8>, SessionRecord>,
}

/// All three store contracts backed by hash maps behind one mutex.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Assign role and permission names to an identity directly,
    /// standing in for the external role/permission tables.
    pub fn grant(&self, identity_id: Uuid, roles: &[&str], permissions: &[&str]) {
        let mut inner = self.lock();
        inner
            .roles
            .entry(identity_id)
            .or_default()
            .extend(roles.iter().map(ToString::to_string));
        inner
            .permissions
            .entry(identity_id)
            .or_default()
            .extend(permissions.iter().map(ToString::to_string));
    }

    /// Number of live refresh records, across all identities.
    #[must_use]
    pub fn refresh_count(&self) -> usize {
        self.lock().refresh_tokens.len()
    }

    /// Number of live session records.
    #[must_use]
    pub fn session_count(&self) -> usize {
        self.lock().sessions.len()
    }
}

#[async_trait]
impl IdentityStore for MemoryStore {
    async fn find_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Option<IdentityRecord>> {
        let inner = self.lock();
        Ok(inner
            .identities
            .values()
            .find(|identity| identity.tenant_id == tenant_id && identity.email == email)
            .cloned())
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<IdentityRecord>> {
        Ok(self.lock().identities.get(&id).cloned())
    }

    async fn create(&self, new: NewIdentity) -> Result<CreateOutcome> {
        let mut inner = self.lock();
        let taken = inner
            .identities
            .values()
            .any(|identity| identity.tenant_id == new.tenant_id && identity.email == new.email);
        if taken {
            return Ok(CreateOutcome::Conflict);
        }

        let record = IdentityRecord {
            id: Uuid::new_v4(),
            tenant_id: new.tenant_id,
            email: new.email,
            credential_hash: new.credential_hash,
            email_verified: false,
            totp: None,
        };
        inner.identities.insert(record.id, record.clone());
        Ok(CreateOutcome::Created(record))
    }

    async fn set_credential_hash(&self, id: Uuid, credential_hash: &str) -> Result<()> {
        if let Some(identity) = self.lock().identities.get_mut(&id) {
            identity.credential_hash = credential_hash.to_string();
        }
        Ok(())
    }

    async fn set_totp(&self, id: Uuid, enrollment: &TotpEnrollment) -> Result<()> {
        if let Some(identity) = self.lock().identities.get_mut(&id) {
            identity.totp = Some(enrollment.clone());
        }
        Ok(())
    }

    async fn clear_totp(&self, id: Uuid) -> Result<()> {
        if let Some(identity) = self.lock().identities.get_mut(&id) {
            identity.totp = None;
        }
        Ok(())
    }

    async fn mark_verified(&self, id: Uuid) -> Result<()> {
        if let Some(identity) = self.lock().identities.get_mut(&id) {
            identity.email_verified = true;
        }
        Ok(())
    }

    async fn role_names(&self, id: Uuid) -> Result<Vec<String>> {
        Ok(self.lock().roles.get(&id).cloned().unwrap_or_default())
    }

    async fn permission_names(&self, id: Uuid) -> Result<Vec<String>> {
        Ok(self.lock().permissions.get(&id).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl RefreshTokenStore for MemoryStore {
    async fn insert(&self, record: RefreshRecord) -> Result<()> {
        self.lock()
            .refresh_tokens
            .insert(record.token_hash.clone(), record);
        Ok(())
    }

    async fn find(&self, token_hash: &[u8]) -> Result<Option<RefreshRecord>> {
        Ok(self.lock().refresh_tokens.get(token_hash).cloned())
    }

    async fn delete(&self, token_hash: &[u8]) -> Result<()> {
        self.lock().refresh_tokens.remove(token_hash);
        Ok(())
    }

    async fn revoke_all(&self, identity_id: Uuid) -> Result<()> {
        self.lock()
            .refresh_tokens
            .retain(|_, record| record.identity_id != identity_id);
        Ok(())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn insert(&self, record: SessionRecord) -> Result<()> {
        self.lock().sessions.insert(record.token_hash.clone(), record);
        Ok(())
    }

    async fn find(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>> {
        Ok(self.lock().sessions.get(token_hash).cloned())
    }

    async fn delete(&self, token_hash: &[u8]) -> Result<()> {
        self.lock().sessions.remove(token_hash);
        Ok(())
    }
}
