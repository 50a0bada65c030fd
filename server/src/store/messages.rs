//! Room message persistence
//!
//! Direct messages are never stored; only room messages are.

use std::time::Duration;

use sqlx::SqlitePool;
use uuid::Uuid;

use haven_shared::protocol::now_ms;

use super::Result;

/// A persisted room message.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct MessageRecord {
    /// Message id.
    pub id: String,
    /// Room the message was sent to.
    pub room_id: String,
    /// Sender's user id.
    pub sender_id: String,
    /// Sender's username at send time.
    pub sender_username: String,
    /// Message body.
    pub content: String,
    /// Server-assigned time, ms.
    pub created_at: i64,
}

/// Message persistence.
#[derive(Clone)]
pub struct MessageStore {
    pool: SqlitePool,
}

impl MessageStore {
    /// Wrap a pool.
    pub fn new(pool: SqlitePool) -> Self {
        MessageStore { pool }
    }

    /// Save a room message, assigning its id and timestamp.
    pub async fn save(
        &self,
        room_id: &str,
        sender_id: &str,
        sender_username: &str,
        content: &str,
    ) -> Result<MessageRecord> {
        let message = MessageRecord {
            id: Uuid::new_v4().to_string(),
            room_id: room_id.to_owned(),
            sender_id: sender_id.to_owned(),
            sender_username: sender_username.to_owned(),
            content: content.to_owned(),
            created_at: now_ms(),
        };

        sqlx::query(
            r#"
            INSERT INTO room_messages (id, room_id, sender_id, sender_username, content, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&message.id)
        .bind(&message.room_id)
        .bind(&message.sender_id)
        .bind(&message.sender_username)
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&self.pool)
        .await?;

        Ok(message)
    }

    /// Up to `limit` messages for a room, newest first. With `before`,
    /// only messages strictly older than that ms timestamp are returned.
    pub async fn history(
        &self,
        room_id: &str,
        limit: i64,
        before: Option<i64>,
    ) -> Result<Vec<MessageRecord>> {
        let messages = sqlx::query_as::<_, MessageRecord>(
            r#"
            SELECT id, room_id, sender_id, sender_username, content, created_at
            FROM room_messages
            WHERE room_id = ?1 AND (?2 IS NULL OR created_at < ?2)
            ORDER BY created_at DESC, id DESC
            LIMIT ?3
            "#,
        )
        .bind(room_id)
        .bind(before)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(messages)
    }

    /// Number of messages in a room.
    pub async fn count_in_room(&self, room_id: &str) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM room_messages WHERE room_id = ?1")
                .bind(room_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    /// Delete messages older than `threshold`. Returns the number deleted.
    pub async fn delete_older_than(&self, threshold: Duration) -> Result<u64> {
        let cutoff = now_ms() - threshold.as_millis() as i64;
        let result = sqlx::query("DELETE FROM room_messages WHERE created_at < ?1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
