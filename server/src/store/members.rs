//! Room membership persistence
//!
//! Membership survives disconnects; only an explicit leave or a cascade
//! removes a row.

use sqlx::SqlitePool;

use haven_shared::protocol::now_ms;

use super::Result;

/// A persisted room membership.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MemberRecord {
    /// Room id.
    pub room_id: String,
    /// Member's user id.
    pub user_id: String,
    /// Member's username at join (refreshed on re-add).
    pub username: String,
    /// First join time, ms.
    pub joined_at: i64,
}

/// Membership persistence, keyed by (room_id, user_id).
#[derive(Clone)]
pub struct MemberStore {
    pool: SqlitePool,
}

impl MemberStore {
    /// Wrap a pool.
    pub fn new(pool: SqlitePool) -> Self {
        MemberStore { pool }
    }

    /// Add a member. Upsert: a duplicate add refreshes the stored username
    /// and leaves `joined_at` unchanged.
    pub async fn add(&self, room_id: &str, user_id: &str, username: &str) -> Result<MemberRecord> {
        let member = sqlx::query_as::<_, MemberRecord>(
            r#"
            INSERT INTO room_members (room_id, user_id, username, joined_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(room_id, user_id) DO UPDATE SET username = excluded.username
            RETURNING room_id, user_id, username, joined_at
            "#,
        )
        .bind(room_id)
        .bind(user_id)
        .bind(username)
        .bind(now_ms())
        .fetch_one(&self.pool)
        .await?;

        Ok(member)
    }

    /// Remove a member.
    pub async fn remove(&self, room_id: &str, user_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM room_members WHERE room_id = ?1 AND user_id = ?2")
            .bind(room_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Whether the user is a member of the room.
    pub async fn is_member(&self, room_id: &str, user_id: &str) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            "SELECT EXISTS(SELECT 1 FROM room_members WHERE room_id = ?1 AND user_id = ?2)",
        )
        .bind(room_id)
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    /// All members of a room, oldest join first.
    pub async fn members_of_room(&self, room_id: &str) -> Result<Vec<MemberRecord>> {
        let members = sqlx::query_as::<_, MemberRecord>(
            r#"
            SELECT room_id, user_id, username, joined_at
            FROM room_members WHERE room_id = ?1 ORDER BY joined_at
            "#,
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(members)
    }

    /// Ids of rooms the user belongs to.
    pub async fn rooms_of_user(&self, user_id: &str) -> Result<Vec<String>> {
        let rows: Vec<(String,)> =
            sqlx::query_as("SELECT room_id FROM room_members WHERE user_id = ?1")
                .bind(user_id)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().map(|r| r.0).collect())
    }

    /// Number of members in a room.
    pub async fn count_members(&self, room_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM room_members WHERE room_id = ?1")
                .bind(room_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }
}
