//! Room persistence

use std::time::Duration;

use sqlx::SqlitePool;
use uuid::Uuid;

use haven_shared::protocol::now_ms;

use super::Result;

/// A persisted room.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct RoomRecord {
    /// Room id.
    pub id: String,
    /// Room name.
    pub name: String,
    /// Creator's user id.
    pub creator_id: String,
    /// Creator's username at creation time.
    pub creator_username: String,
    /// Whether the room is announced to everyone.
    pub is_public: bool,
    /// Creation time, ms.
    pub created_at: i64,
    /// Last message or membership activity, ms.
    pub last_activity_at: i64,
}

const ROOM_COLUMNS: &str =
    "id, name, creator_id, creator_username, is_public, created_at, last_activity_at";

/// Room persistence.
#[derive(Clone)]
pub struct RoomStore {
    pool: SqlitePool,
}

impl RoomStore {
    /// Wrap a pool.
    pub fn new(pool: SqlitePool) -> Self {
        RoomStore { pool }
    }

    /// Create a room, assigning its id and timestamps.
    pub async fn create(
        &self,
        name: &str,
        creator_id: &str,
        creator_username: &str,
        is_public: bool,
    ) -> Result<RoomRecord> {
        let room = RoomRecord {
            id: Uuid::new_v4().to_string(),
            name: name.to_owned(),
            creator_id: creator_id.to_owned(),
            creator_username: creator_username.to_owned(),
            is_public,
            created_at: now_ms(),
            last_activity_at: now_ms(),
        };

        sqlx::query(
            r#"
            INSERT INTO rooms (id, name, creator_id, creator_username, is_public, created_at, last_activity_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&room.id)
        .bind(&room.name)
        .bind(&room.creator_id)
        .bind(&room.creator_username)
        .bind(room.is_public)
        .bind(room.created_at)
        .bind(room.last_activity_at)
        .execute(&self.pool)
        .await?;

        Ok(room)
    }

    /// Look up a room by id.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<RoomRecord>> {
        let room = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE id = ?1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(room)
    }

    /// All rooms, newest first.
    pub async fn get_all(&self) -> Result<Vec<RoomRecord>> {
        let rooms = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rooms)
    }

    /// All public rooms, newest first.
    pub async fn get_public(&self) -> Result<Vec<RoomRecord>> {
        let rooms = sqlx::query_as::<_, RoomRecord>(&format!(
            "SELECT {ROOM_COLUMNS} FROM rooms WHERE is_public = 1 ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rooms)
    }

    /// Set `last_activity_at` to now.
    pub async fn update_activity(&self, id: &str) -> Result<()> {
        sqlx::query("UPDATE rooms SET last_activity_at = ?1 WHERE id = ?2")
            .bind(now_ms())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Delete a room; cascades to its members and messages.
    pub async fn delete(&self, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM rooms WHERE id = ?1")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Total number of rooms.
    pub async fn count(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM rooms")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Delete rooms inactive for longer than `threshold`; cascades to their
    /// members and messages. Returns the number of rooms deleted.
    pub async fn delete_inactive(&self, threshold: Duration) -> Result<u64> {
        let cutoff = now_ms() - threshold.as_millis() as i64;
        let result = sqlx::query("DELETE FROM rooms WHERE last_activity_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
