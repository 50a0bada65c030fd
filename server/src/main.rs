use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use tracing::{info, warn};

use haven_server::config::ServerConfig;
use haven_server::hub::Hub;
use haven_server::routing;
use haven_server::store::{self, Cleanup, CleanupConfig, CleanupJob};
use haven_server::store::{MemberStore, MessageStore, RoomStore, UserStore};

// Use jemalloc on Linux for reduced fragmentation on long-running server
// processes. On Windows/macOS the default system allocator is used instead.
#[cfg(target_os = "linux")]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("haven_server=debug".parse()?)
                .add_directive("axum=info".parse()?),
        )
        .init();

    info!("Starting Haven relay");

    let config = ServerConfig::from_env()?;
    info!("Configuration loaded");

    let pool = store::init(
        &config.database_url,
        config.db_min_connections,
        config.db_max_connections,
    )
    .await?;

    let users = UserStore::new(pool.clone());
    let rooms = RoomStore::new(pool.clone());
    let members = MemberStore::new(pool.clone());
    let messages = MessageStore::new(pool.clone());

    let user_count = users.count().await.unwrap_or(0);
    let room_count = rooms.count().await.unwrap_or(0);
    info!("Database initialized: {user_count} users, {room_count} rooms");

    let hub = Arc::new(Hub::new(
        users.clone(),
        rooms.clone(),
        members,
        messages.clone(),
    ));
    if let Err(e) = hub.load_rooms().await {
        warn!("Failed to load rooms from storage: {e}");
    }

    let cleanup = CleanupJob::spawn(
        hub.clone(),
        Cleanup::new(users, rooms, messages),
        CleanupConfig {
            user_inactivity: config.user_inactivity,
            room_inactivity: config.room_inactivity,
            message_retention: config.message_retention,
        },
        config.cleanup_interval,
    );
    info!(
        "Cleanup job started (interval: {:?}, user timeout: {:?}, room timeout: {:?}, retention: {:?})",
        config.cleanup_interval, config.user_inactivity, config.room_inactivity, config.message_retention
    );

    let app = routing::create_router(hub.clone());
    let addr: SocketAddr = format!("{}:{}", config.host, config.port).parse()?;

    info!("Relay listening on http://{addr}");
    info!("WebSocket endpoint: ws://{addr}/ws");

    let shutdown_signal = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received, draining connections...");
    };

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await?;

    // Sessions first so their writers flush close frames, then the cleanup
    // task, then the pool.
    hub.close_all().await;
    cleanup.stop().await;

    info!("Checkpointing SQLite WAL...");
    if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
        .execute(&pool)
        .await
    {
        warn!("WAL checkpoint failed: {e}");
    }
    pool.close().await;

    info!("Relay stopped cleanly");
    Ok(())
}
