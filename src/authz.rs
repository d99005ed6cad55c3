//! Permission resolution and authorization guards.
//!
//! Permissions reach an identity only through roles; resolution takes
//! the union across every assigned role. The resolved set is
//! snapshotted into access-token claims at login, so a role change
//! takes effect on the next token issuance, not immediately.

use std::collections::BTreeSet;

use anyhow::Context;
use uuid::Uuid;

use crate::error::AuthError;
use crate::store::IdentityStore;

/// A resolved set of permission names. Duplicates collapse.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PermissionSet {
    names: BTreeSet<String>,
}

impl PermissionSet {
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.names.contains(name)
    }

    /// Guard a protected operation. Fails with `PermissionDenied`
    /// before the operation runs.
    ///
    /// # Errors
    ///
    /// Returns `PermissionDenied` naming the missing permission.
    pub fn require(&self, name: &str) -> Result<(), AuthError> {
        if self.contains(name) {
            Ok(())
        } else {
            Err(AuthError::PermissionDenied(name.to_string()))
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.names.iter().map(String::as_str)
    }

    /// Stable, sorted form for embedding in token claims.
    #[must_use]
    pub fn into_names(self) -> Vec<String> {
        self.names.into_iter().collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

impl FromIterator<String> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = String>>(iter: I) -> Self {
        Self {
            names: iter.into_iter().collect(),
        }
    }
}

/// Union of permission names across the identity's roles.
///
/// # Errors
///
/// Returns `Persistence` if the store lookup fails.
pub async fn resolve_permissions(
    store: &dyn IdentityStore,
    identity_id: Uuid,
) -> Result<PermissionSet, AuthError> {
    let names = store
        .permission_names(identity_id)
        .await
        .context("permission resolution failed")
        .map_err(AuthError::Persistence)?;
    Ok(names.into_iter().collect())
}

/// Guard requiring a role assignment, for checks that are about the
/// role itself rather than a permission it grants.
///
/// # Errors
///
/// Returns `RoleRequired` when the identity lacks the role, or
/// `Persistence` if the lookup fails.
pub async fn require_role(
    store: &dyn IdentityStore,
    identity_id: Uuid,
    role: &str,
) -> Result<(), AuthError> {
    let roles = store
        .role_names(identity_id)
        .await
        .context("role lookup failed")
        .map_err(AuthError::Persistence)?;
    if roles.iter().any(|name| name == role) {
        Ok(())
    } else {
        Err(AuthError::RoleRequired(role.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn duplicates_collapse_and_order_is_stable() {
        let set: PermissionSet = [
            "project:write".to_string(),
            "project:read".to_string(),
            "project:write".to_string(),
        ]
        .into_iter()
        .collect();

        assert_eq!(
            set.into_names(),
            vec!["project:read".to_string(), "project:write".to_string()]
        );
    }

    #[test]
    fn require_distinguishes_granted_from_missing() {
        let set: PermissionSet = ["project:read".to_string()].into_iter().collect();
        assert!(set.require("project:read").is_ok());

        let err = set.require("project:write");
        assert!(matches!(err, Err(AuthError::PermissionDenied(name)) if name == "project:write"));
    }

    #[tokio::test]
    async fn resolution_unions_across_roles() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let identity_id = Uuid::new_v4();
        // Overlapping grants from two roles.
        store.grant(identity_id, &["auditor"], &["project:read", "finding:read"]);
        store.grant(identity_id, &["admin"], &["project:read", "project:write"]);

        let set = resolve_permissions(&store, identity_id).await?;
        assert_eq!(
            set.clone().into_names(),
            vec!["finding:read", "project:read", "project:write"]
        );
        assert!(set.contains("project:write"));
        Ok(())
    }

    #[tokio::test]
    async fn role_guard() -> anyhow::Result<()> {
        let store = MemoryStore::new();
        let identity_id = Uuid::new_v4();
        store.grant(identity_id, &["auditor"], &[]);

        assert!(require_role(&store, identity_id, "auditor").await.is_ok());
        let err = require_role(&store, identity_id, "admin").await;
        assert!(matches!(err, Err(AuthError::RoleRequired(role)) if role == "admin"));
        Ok(())
    }
}
