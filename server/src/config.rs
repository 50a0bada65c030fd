//! Server configuration

use anyhow::{Context, Result};
use std::env;
use std::time::Duration;

/// Relay configuration, loaded from the environment.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Host to bind to
    pub host: String,
    /// Port to listen on
    pub port: u16,
    /// SQLite database URL
    pub database_url: String,
    /// Minimum pooled database connections
    pub db_min_connections: u32,
    /// Maximum pooled database connections
    pub db_max_connections: u32,
    /// Delete users not seen for this long (default: 90 days)
    pub user_inactivity: Duration,
    /// Delete rooms without activity for this long (default: 7 days)
    pub room_inactivity: Duration,
    /// Delete room messages older than this (default: 365 days)
    pub message_retention: Duration,
    /// How often the cleanup job runs (default: 1 hour)
    pub cleanup_interval: Duration,
}

impl ServerConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(ServerConfig {
            host: env::var("HAVEN_HOST").unwrap_or_else(|_| "0.0.0.0".to_string()),
            port: env::var("HAVEN_PORT")
                .unwrap_or_else(|_| "9088".to_string())
                .parse()
                .context("Invalid HAVEN_PORT")?,
            database_url: env::var("HAVEN_DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://./data/haven.db".to_string()),
            db_min_connections: env::var("HAVEN_DB_MIN_CONNS")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .context("Invalid HAVEN_DB_MIN_CONNS")?,
            db_max_connections: env::var("HAVEN_DB_MAX_CONNS")
                .unwrap_or_else(|_| "10".to_string())
                .parse()
                .context("Invalid HAVEN_DB_MAX_CONNS")?,
            user_inactivity: duration_secs("HAVEN_USER_INACTIVITY", 90 * 24 * 3600)?,
            room_inactivity: duration_secs("HAVEN_ROOM_INACTIVITY", 7 * 24 * 3600)?,
            message_retention: duration_secs("HAVEN_MESSAGE_RETENTION", 365 * 24 * 3600)?,
            cleanup_interval: duration_secs("HAVEN_CLEANUP_INTERVAL", 3600)?,
        })
    }
}

fn duration_secs(key: &str, default_secs: u64) -> Result<Duration> {
    let secs = match env::var(key) {
        Ok(value) => value
            .parse()
            .with_context(|| format!("Invalid {key} (expected seconds)"))?,
        Err(_) => default_secs,
    };
    Ok(Duration::from_secs(secs))
}
