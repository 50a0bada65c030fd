//! User persistence

use std::time::Duration;

use sqlx::SqlitePool;
use uuid::Uuid;

use haven_shared::protocol::now_ms;

use super::{Result, StoreError};

/// A persisted user.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    /// Stable opaque id.
    pub id: String,
    /// Unique, case-sensitive username.
    pub username: String,
    /// Digest of the device fingerprint (empty if never supplied).
    pub fingerprint_hash: String,
    /// Digest of the recovery phrase.
    pub recovery_hash: String,
    /// Creation time, ms.
    pub created_at: i64,
    /// Last successful login, ms.
    pub last_seen_at: i64,
}

/// User persistence, keyed by unique username.
#[derive(Clone)]
pub struct UserStore {
    pool: SqlitePool,
}

impl UserStore {
    /// Wrap a pool.
    pub fn new(pool: SqlitePool) -> Self {
        UserStore { pool }
    }

    /// Create a user. Fails with [`StoreError::UsernameTaken`] when the
    /// username is already registered.
    pub async fn create(
        &self,
        username: &str,
        fingerprint_hash: &str,
        recovery_hash: &str,
    ) -> Result<User> {
        let user = User {
            id: Uuid::new_v4().to_string(),
            username: username.to_owned(),
            fingerprint_hash: fingerprint_hash.to_owned(),
            recovery_hash: recovery_hash.to_owned(),
            created_at: now_ms(),
            last_seen_at: now_ms(),
        };

        sqlx::query(
            r#"
            INSERT INTO users (id, username, fingerprint_hash, recovery_hash, created_at, last_seen_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&user.id)
        .bind(&user.username)
        .bind(&user.fingerprint_hash)
        .bind(&user.recovery_hash)
        .bind(user.created_at)
        .bind(user.last_seen_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => StoreError::UsernameTaken,
            _ => StoreError::Sqlx(e),
        })?;

        Ok(user)
    }

    /// Look up a user by username.
    pub async fn get_by_username(&self, username: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, fingerprint_hash, recovery_hash, created_at, last_seen_at
            FROM users WHERE username = ?1
            "#,
        )
        .bind(username)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Look up a user by id.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<User>> {
        let user = sqlx::query_as::<_, User>(
            r#"
            SELECT id, username, fingerprint_hash, recovery_hash, created_at, last_seen_at
            FROM users WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    /// Set `last_seen_at` to now.
    pub async fn update_last_seen(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE users SET last_seen_at = ?1 WHERE id = ?2")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Rotate the fingerprint digest, bumping `last_seen_at`.
    pub async fn update_fingerprint(&self, id: &str, fingerprint_hash: &str) -> Result<()> {
        sqlx::query("UPDATE users SET fingerprint_hash = ?1, last_seen_at = ?2 WHERE id = ?3")
            .bind(fingerprint_hash)
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Total number of users.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete users not seen for longer than `threshold`; cascades to the
    /// rooms they created. Returns the number of users deleted.
    pub async fn delete_inactive(&self, threshold: Duration) -> Result<u64> {
        let cutoff = now_ms() - threshold.as_millis() as i64;
        let result = sqlx::query("DELETE FROM users WHERE last_seen_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
