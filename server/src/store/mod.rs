//! SQLite persistence
//!
//! Four tables back the relay: `users`, `rooms`, `room_members`,
//! `room_messages`. Referential cleanup is declared in the schema
//! (`ON DELETE CASCADE`) and enforced by enabling foreign keys on every
//! pooled connection. All timestamps are milliseconds since the Unix epoch.

pub mod cleanup;
pub mod members;
pub mod messages;
pub mod rooms;
pub mod users;

pub use cleanup::{Cleanup, CleanupConfig, CleanupJob, CleanupStats};
pub use members::MemberStore;
pub use messages::MessageStore;
pub use rooms::RoomStore;
pub use users::UserStore;

use std::str::FromStr;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use tracing::info;

/// Store operation failure.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Underlying database error.
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),
    /// A user with the requested username already exists.
    #[error("username already taken")]
    UsernameTaken,
}

/// Result alias for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Open the connection pool and apply migrations.
pub async fn init(database_url: &str, min_conns: u32, max_conns: u32) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .min_connections(min_conns)
        .max_connections(max_conns)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    Ok(pool)
}

/// Create the schema if it does not exist.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    info!("Running database migrations");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE,
            fingerprint_hash TEXT NOT NULL,
            recovery_hash TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS rooms (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            creator_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            creator_username TEXT NOT NULL,
            is_public INTEGER NOT NULL,
            created_at INTEGER NOT NULL,
            last_activity_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS room_members (
            room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
            username TEXT NOT NULL,
            joined_at INTEGER NOT NULL,
            PRIMARY KEY (room_id, user_id)
        );
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_room_members_user
        ON room_members(user_id);
        "#,
    )
    .execute(pool)
    .await?;

    // sender_id carries no foreign key: messages in other users' rooms
    // outlive their sender until retention removes them.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS room_messages (
            id TEXT PRIMARY KEY,
            room_id TEXT NOT NULL REFERENCES rooms(id) ON DELETE CASCADE,
            sender_id TEXT NOT NULL,
            sender_username TEXT NOT NULL,
            content TEXT NOT NULL,
            created_at INTEGER NOT NULL
        );
        "#,
    )
    .execute(pool)
    .await?;

    // Newest-first history retrieval per room; id breaks same-millisecond ties.
    sqlx::query(
        r#"
        CREATE INDEX IF NOT EXISTS idx_room_messages_history
        ON room_messages(room_id, created_at DESC, id DESC);
        "#,
    )
    .execute(pool)
    .await?;

    info!("Migrations completed successfully");
    Ok(())
}
