//! Postgres-backed implementation of the store contracts.
//!
//! Hand-written SQL against a schema owned by the surrounding
//! application. Every query runs inside a `db.query` span carrying the
//! statement for trace correlation.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{PgPool, Row};
use tracing::Instrument;
use uuid::Uuid;

use super::{
    ClientMeta, CreateOutcome, IdentityRecord, IdentityStore, NewIdentity, RefreshRecord,
    RefreshTokenStore, SessionRecord, SessionStore, TotpEnrollment,
};

pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn query_span(operation: &str, statement: &str) -> tracing::Span {
    tracing::info_span!(
        "db.query",
        db.system = "postgresql",
        db.operation = operation,
        db.statement = statement
    )
}

fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().is_some_and(|code| code.as_ref() == "23505"),
        _ => false,
    }
}

fn identity_from_row(row: &sqlx::postgres::PgRow) -> IdentityRecord {
    let ciphertext: Option<Vec<u8>> = row.get("totp_ciphertext");
    let key_id: Option<String> = row.get("totp_key_id");
    let backup_code_hashes: Option<Vec<String>> = row.get("totp_backup_code_hashes");

    let totp = match (ciphertext, key_id) {
        (Some(ciphertext), Some(key_id)) => Some(TotpEnrollment {
            ciphertext,
            key_id,
            backup_code_hashes: backup_code_hashes.unwrap_or_default(),
        }),
        _ => None,
    };

    IdentityRecord {
        id: row.get("id"),
        tenant_id: row.get("tenant_id"),
        email: row.get("email"),
        credential_hash: row.get("credential_hash"),
        email_verified: row.get("email_verified"),
        totp,
    }
}

const IDENTITY_COLUMNS: &str = "id, tenant_id, email, credential_hash, email_verified, \
     totp_ciphertext, totp_key_id, totp_backup_code_hashes";

#[async_trait]
impl IdentityStore for PostgresStore {
    async fn find_by_email(
        &self,
        tenant_id: &str,
        email: &str,
    ) -> Result<Option<IdentityRecord>> {
        let query = format!(
            "SELECT {IDENTITY_COLUMNS} FROM identities WHERE tenant_id = $1 AND email = $2"
        );
        let row = sqlx::query(&query)
            .bind(tenant_id)
            .bind(email)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to look up identity by email")?;

        Ok(row.as_ref().map(identity_from_row))
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<IdentityRecord>> {
        let query = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = $1");
        let row = sqlx::query(&query)
            .bind(id)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", &query))
            .await
            .context("failed to look up identity by id")?;

        Ok(row.as_ref().map(identity_from_row))
    }

    async fn create(&self, new: NewIdentity) -> Result<CreateOutcome> {
        let query = "INSERT INTO identities (tenant_id, email, credential_hash) \
             VALUES ($1, $2, $3) RETURNING id";
        let row = sqlx::query(query)
            .bind(&new.tenant_id)
            .bind(&new.email)
            .bind(&new.credential_hash)
            .fetch_one(&self.pool)
            .instrument(query_span("INSERT", query))
            .await;

        let id: Uuid = match row {
            Ok(row) => row.get("id"),
            Err(err) if is_unique_violation(&err) => return Ok(CreateOutcome::Conflict),
            Err(err) => return Err(err).context("failed to insert identity"),
        };

        Ok(CreateOutcome::Created(IdentityRecord {
            id,
            tenant_id: new.tenant_id,
            email: new.email,
            credential_hash: new.credential_hash,
            email_verified: false,
            totp: None,
        }))
    }

    async fn set_credential_hash(&self, id: Uuid, credential_hash: &str) -> Result<()> {
        let query = "UPDATE identities SET credential_hash = $2 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(credential_hash)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to update credential hash")?;
        Ok(())
    }

    async fn set_totp(&self, id: Uuid, enrollment: &TotpEnrollment) -> Result<()> {
        let query = "UPDATE identities SET totp_ciphertext = $2, totp_key_id = $3, \
             totp_backup_code_hashes = $4 WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .bind(&enrollment.ciphertext)
            .bind(&enrollment.key_id)
            .bind(&enrollment.backup_code_hashes)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to store totp enrollment")?;
        Ok(())
    }

    async fn clear_totp(&self, id: Uuid) -> Result<()> {
        let query = "UPDATE identities SET totp_ciphertext = NULL, totp_key_id = NULL, \
             totp_backup_code_hashes = NULL WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to clear totp enrollment")?;
        Ok(())
    }

    async fn mark_verified(&self, id: Uuid) -> Result<()> {
        let query = "UPDATE identities SET email_verified = TRUE WHERE id = $1";
        sqlx::query(query)
            .bind(id)
            .execute(&self.pool)
            .instrument(query_span("UPDATE", query))
            .await
            .context("failed to mark identity verified")?;
        Ok(())
    }

    async fn role_names(&self, id: Uuid) -> Result<Vec<String>> {
        let query = "SELECT r.name FROM roles r \
             JOIN identity_roles ir ON ir.role_id = r.id \
             WHERE ir.identity_id = $1";
        let rows = sqlx::query(query)
            .bind(id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load role names")?;

        Ok(rows.iter().map(|row| row.get("name")).collect())
    }

    async fn permission_names(&self, id: Uuid) -> Result<Vec<String>> {
        let query = "SELECT DISTINCT p.name FROM permissions p \
             JOIN role_permissions rp ON rp.permission_id = p.id \
             JOIN identity_roles ir ON ir.role_id = rp.role_id \
             WHERE ir.identity_id = $1";
        let rows = sqlx::query(query)
            .bind(id)
            .fetch_all(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to load permission names")?;

        Ok(rows.iter().map(|row| row.get("name")).collect())
    }
}

#[async_trait]
impl RefreshTokenStore for PostgresStore {
    async fn insert(&self, record: RefreshRecord) -> Result<()> {
        let query = "INSERT INTO refresh_tokens (token_hash, identity_id, expires_at) \
             VALUES ($1, $2, $3)";
        sqlx::query(query)
            .bind(&record.token_hash)
            .bind(record.identity_id)
            .bind(record.expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert refresh record")?;
        Ok(())
    }

    async fn find(&self, token_hash: &[u8]) -> Result<Option<RefreshRecord>> {
        let query = "SELECT token_hash, identity_id, expires_at FROM refresh_tokens \
             WHERE token_hash = $1";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to look up refresh record")?;

        Ok(row.map(|row| RefreshRecord {
            token_hash: row.get("token_hash"),
            identity_id: row.get("identity_id"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn delete(&self, token_hash: &[u8]) -> Result<()> {
        let query = "DELETE FROM refresh_tokens WHERE token_hash = $1";
        sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete refresh record")?;
        Ok(())
    }

    async fn revoke_all(&self, identity_id: Uuid) -> Result<()> {
        let query = "DELETE FROM refresh_tokens WHERE identity_id = $1";
        sqlx::query(query)
            .bind(identity_id)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to revoke refresh records")?;
        Ok(())
    }
}

#[async_trait]
impl SessionStore for PostgresStore {
    async fn insert(&self, record: SessionRecord) -> Result<()> {
        let query = "INSERT INTO sessions \
             (token_hash, identity_id, tenant_id, client_address, client_agent, created_at, expires_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7)";
        sqlx::query(query)
            .bind(&record.token_hash)
            .bind(record.identity_id)
            .bind(&record.tenant_id)
            .bind(&record.client.address)
            .bind(&record.client.agent)
            .bind(record.created_at)
            .bind(record.expires_at)
            .execute(&self.pool)
            .instrument(query_span("INSERT", query))
            .await
            .context("failed to insert session record")?;
        Ok(())
    }

    async fn find(&self, token_hash: &[u8]) -> Result<Option<SessionRecord>> {
        let query = "SELECT token_hash, identity_id, tenant_id, client_address, client_agent, \
             created_at, expires_at FROM sessions WHERE token_hash = $1";
        let row = sqlx::query(query)
            .bind(token_hash)
            .fetch_optional(&self.pool)
            .instrument(query_span("SELECT", query))
            .await
            .context("failed to look up session record")?;

        Ok(row.map(|row| SessionRecord {
            token_hash: row.get("token_hash"),
            identity_id: row.get("identity_id"),
            tenant_id: row.get("tenant_id"),
            client: ClientMeta {
                address: row.get("client_address"),
                agent: row.get("client_agent"),
            },
            created_at: row.get("created_at"),
            expires_at: row.get("expires_at"),
        }))
    }

    async fn delete(&self, token_hash: &[u8]) -> Result<()> {
        let query = "DELETE FROM sessions WHERE token_hash = $1";
        sqlx::query(query)
            .bind(token_hash)
            .execute(&self.pool)
            .instrument(query_span("DELETE", query))
            .await
            .context("failed to delete session record")?;
        Ok(())
    }
}
