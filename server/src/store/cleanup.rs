//! Periodic retention cleanup
//!
//! Sweeps run oldest-data-first: messages past retention, then inactive
//! rooms, then inactive users. Room and user deletion cascade to their
//! dependent rows, so the ordering keeps the counts meaningful.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::hub::Hub;

use super::{MessageStore, Result, RoomStore, UserStore};

/// Thresholds for one cleanup pass.
#[derive(Debug, Clone)]
pub struct CleanupConfig {
    /// Users not seen for this long are deleted.
    pub user_inactivity: Duration,
    /// Rooms without activity for this long are deleted.
    pub room_inactivity: Duration,
    /// Messages older than this are deleted.
    pub message_retention: Duration,
}

/// What one cleanup pass removed.
#[derive(Debug, Default, Clone, Copy)]
pub struct CleanupStats {
    /// Users deleted.
    pub users_deleted: u64,
    /// Rooms deleted.
    pub rooms_deleted: u64,
    /// Messages deleted.
    pub messages_deleted: u64,
}

impl CleanupStats {
    fn is_empty(&self) -> bool {
        self.users_deleted == 0 && self.rooms_deleted == 0 && self.messages_deleted == 0
    }
}

/// Retention sweeps over the stores.
#[derive(Clone)]
pub struct Cleanup {
    users: UserStore,
    rooms: RoomStore,
    messages: MessageStore,
}

impl Cleanup {
    /// Build a cleanup over the given stores.
    pub fn new(users: UserStore, rooms: RoomStore, messages: MessageStore) -> Self {
        Cleanup {
            users,
            rooms,
            messages,
        }
    }

    /// Run one full pass: messages, then rooms, then users.
    pub async fn run(&self, config: &CleanupConfig) -> Result<CleanupStats> {
        let mut stats = CleanupStats::default();

        stats.messages_deleted = self
            .messages
            .delete_older_than(config.message_retention)
            .await?;
        stats.rooms_deleted = self.rooms.delete_inactive(config.room_inactivity).await?;
        stats.users_deleted = self.users.delete_inactive(config.user_inactivity).await?;

        Ok(stats)
    }
}

/// Background task running [`Cleanup`] on a fixed interval. Ticks never
/// overlap; each runs to completion before the next is considered.
pub struct CleanupJob {
    handle: JoinHandle<()>,
    stop: watch::Sender<bool>,
}

impl CleanupJob {
    /// Spawn the job. After a pass that deleted rooms, the hub's in-memory
    /// room map is pruned to the surviving store rows.
    pub fn spawn(
        hub: Arc<Hub>,
        cleanup: Cleanup,
        config: CleanupConfig,
        interval: Duration,
    ) -> Self {
        let (stop, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // consume the immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match cleanup.run(&config).await {
                            Ok(stats) if stats.is_empty() => {}
                            Ok(stats) => {
                                info!(
                                    "Cleanup completed: users={}, rooms={}, messages={}",
                                    stats.users_deleted, stats.rooms_deleted, stats.messages_deleted
                                );
                                if stats.rooms_deleted > 0 {
                                    hub.prune_rooms().await;
                                }
                            }
                            Err(e) => warn!("Cleanup error: {e}"),
                        }
                    }
                    _ = stopped.changed() => break,
                }
            }
        });

        CleanupJob { handle, stop }
    }

    /// Signal the job to stop and wait for it to exit.
    pub async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}
