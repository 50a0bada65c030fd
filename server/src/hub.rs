//! The hub: registry and dispatch engine for live sessions and rooms
//!
//! All four indices move together under one reader-writer lock. The lock
//! is never held across a store call or a blocking send; broadcasts
//! snapshot their recipients under the lock and enqueue after releasing
//! it. The one in-lock side effect is the non-blocking `kicked` enqueue
//! on the imposter-eviction path.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use haven_shared::protocol::{
    now_ms, ErrorCode, IncomingDirectMessage, IncomingRoomMessage, Kicked, MemberAction,
    RoomCreated, RoomHistory, RoomInfo, RoomMembers, ServerMessage, UserInfo,
};
use haven_shared::recovery::hash_value;

use crate::room::Room;
use crate::session::Session;
use crate::store::users::User;
use crate::store::{MemberStore, MessageStore, RoomStore, StoreError, UserStore};

/// An operation the hub refused, carrying the client-facing code.
#[derive(Debug, thiserror::Error)]
#[error("{message}")]
pub struct HubError {
    /// Machine-readable protocol code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
}

impl HubError {
    /// Build an error with an explicit code and message.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        HubError {
            code,
            message: message.into(),
        }
    }

    fn not_registered() -> Self {
        Self::new(ErrorCode::NotRegistered, "Must register first")
    }

    fn room_not_found() -> Self {
        Self::new(ErrorCode::RoomNotFound, "Room not found")
    }

    fn not_in_room() -> Self {
        Self::new(ErrorCode::NotInRoom, "Not in room")
    }
}

/// Outcome of a successful registration.
#[derive(Debug)]
pub struct Registration {
    /// Stable user id bound to the session.
    pub user_id: String,
    /// Bound username.
    pub username: String,
    /// Plaintext recovery phrase; present exactly once, for new users.
    pub recovery_phrase: Option<String>,
    /// True when this registration created the account.
    pub is_new_user: bool,
}

/// Outcome of a successful room join.
#[derive(Debug)]
pub struct JoinOutcome {
    /// The room, after the join.
    pub room: RoomInfo,
    /// Member list, after the join.
    pub members: Vec<UserInfo>,
    /// True when the user was already a member (silent reconnect).
    pub rejoined: bool,
}

#[derive(Default)]
struct HubIndex {
    sessions: HashMap<String, Arc<Session>>,
    by_username: HashMap<String, String>,
    by_user_id: HashMap<String, String>,
    rooms: HashMap<String, Arc<Room>>,
}

fn registered_peers(index: &HubIndex, exclude_conn: &str) -> Vec<Arc<Session>> {
    index
        .sessions
        .values()
        .filter(|s| s.id != exclude_conn && !s.username().is_empty())
        .cloned()
        .collect()
}

fn room_peers(index: &HubIndex, room: &Room, exclude_conn: &str) -> Vec<Arc<Session>> {
    room.member_ids()
        .iter()
        .filter_map(|user_id| index.by_user_id.get(user_id))
        .filter(|conn_id| conn_id.as_str() != exclude_conn)
        .filter_map(|conn_id| index.sessions.get(conn_id))
        .cloned()
        .collect()
}

fn valid_username(name: &str) -> bool {
    (3..=20).contains(&name.len())
        && name
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_' || b == b'-')
}

fn valid_room_name(name: &str) -> bool {
    (1..=50).contains(&name.chars().count())
}

/// The process-wide coordinator for sessions, rooms and broadcasts.
pub struct Hub {
    index: RwLock<HubIndex>,
    users: UserStore,
    rooms: RoomStore,
    members: MemberStore,
    messages: MessageStore,
}

impl Hub {
    /// Build a hub over the four stores.
    pub fn new(
        users: UserStore,
        rooms: RoomStore,
        members: MemberStore,
        messages: MessageStore,
    ) -> Self {
        Hub {
            index: RwLock::new(HubIndex::default()),
            users,
            rooms,
            members,
            messages,
        }
    }

    /// Load persisted rooms and their membership into memory. Called once
    /// at startup, before any session attaches.
    pub async fn load_rooms(&self) -> Result<usize, StoreError> {
        let stored = self.rooms.get_all().await?;
        let count = stored.len();

        let mut hydrated = Vec::with_capacity(count);
        for record in stored {
            let room = Room::new(
                &record.id,
                &record.name,
                &record.creator_id,
                &record.creator_username,
                record.is_public,
            );
            match self.members.members_of_room(&record.id).await {
                Ok(members) => {
                    for member in members {
                        room.add_member(&member.user_id, &member.username);
                    }
                }
                Err(e) => error!("Failed to load members for room {}: {e}", record.id),
            }
            hydrated.push(room);
        }

        let mut index = self.index.write().await;
        for room in hydrated {
            index.rooms.insert(room.id.clone(), Arc::new(room));
        }
        drop(index);

        info!("Loaded {count} rooms from storage");
        Ok(count)
    }

    /// Insert a freshly accepted connection (before registration).
    pub async fn attach(&self, session: Arc<Session>) {
        let mut index = self.index.write().await;
        index.sessions.insert(session.id.clone(), session);
    }

    /// Remove a session after its connection ended.
    ///
    /// Room membership is intentionally untouched: a user stays a member
    /// while offline. A session already evicted by the imposter path is a
    /// no-op here, so `UserLeft` never fires twice.
    pub async fn detach(&self, session: &Arc<Session>) {
        let peers = {
            let mut index = self.index.write().await;
            if index.sessions.remove(&session.id).is_none() {
                return;
            }

            let username = session.username();
            if username.is_empty() {
                Vec::new()
            } else {
                // Only unbind if the indices still point at this connection;
                // an owner login may have already rebound the name.
                if index.by_username.get(&username) == Some(&session.id) {
                    index.by_username.remove(&username);
                }
                let user_id = session.user_id();
                if index.by_user_id.get(&user_id) == Some(&session.id) {
                    index.by_user_id.remove(&user_id);
                }
                registered_peers(&index, &session.id)
            }
        };

        if !peers.is_empty() {
            let left = ServerMessage::UserLeft(UserInfo {
                user_id: session.user_id(),
                username: session.username(),
            });
            for peer in peers {
                peer.send(&left);
            }
        }

        session.close();
    }

    /// Close every session and clear the indices. Used at shutdown.
    pub async fn close_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut index = self.index.write().await;
            index.by_username.clear();
            index.by_user_id.clear();
            index.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close();
        }
    }

    /// Register a session under a username, proving ownership by
    /// fingerprint or recovery phrase when the name already exists.
    pub async fn register(
        &self,
        session: &Arc<Session>,
        username: &str,
        fingerprint: &str,
        recovery_code: &str,
    ) -> Result<Registration, HubError> {
        if !valid_username(username) {
            return Err(HubError::new(
                ErrorCode::InvalidUsername,
                "Username must be 3-20 characters: letters, digits, _ or -",
            ));
        }

        let fingerprint_hash = if fingerprint.is_empty() {
            String::new()
        } else {
            hash_value(fingerprint)
        };

        let existing = self.users.get_by_username(username).await.map_err(|e| {
            error!("Failed to look up user {username}: {e}");
            HubError::new(ErrorCode::InvalidMessage, "Database error")
        })?;

        let Some(user) = existing else {
            return self.register_new_user(session, username, &fingerprint_hash).await;
        };

        // Existing account: the fingerprint proves ownership outright; a
        // recovery phrase reclaims it and rotates the fingerprint.
        if !fingerprint.is_empty() && user.fingerprint_hash == fingerprint_hash {
            return Ok(self.login_existing(session, &user).await);
        }

        if !recovery_code.is_empty() {
            if hash_value(recovery_code) != user.recovery_hash {
                return Err(HubError::new(
                    ErrorCode::InvalidRecovery,
                    "Invalid recovery code",
                ));
            }
            if !fingerprint.is_empty() {
                if let Err(e) = self.users.update_fingerprint(&user.id, &fingerprint_hash).await {
                    warn!("Failed to rotate fingerprint for {username}: {e}");
                }
            }
            return Ok(self.login_existing(session, &user).await);
        }

        Err(HubError::new(
            ErrorCode::RecoveryRequired,
            "This username is registered. Please enter your recovery code.",
        ))
    }

    async fn register_new_user(
        &self,
        session: &Arc<Session>,
        username: &str,
        fingerprint_hash: &str,
    ) -> Result<Registration, HubError> {
        let phrase = haven_shared::recovery::generate_recovery_phrase();

        let user = self
            .users
            .create(username, fingerprint_hash, &hash_value(&phrase))
            .await
            .map_err(|e| match e {
                StoreError::UsernameTaken => {
                    HubError::new(ErrorCode::UsernameInUse, "Username already in use")
                }
                other => {
                    error!("Failed to save user {username}: {other}");
                    HubError::new(ErrorCode::InvalidMessage, "Failed to save user")
                }
            })?;

        let peers = {
            let mut index = self.index.write().await;
            bind_session(&mut index, session, &user.id, username);
            registered_peers(&index, &session.id)
        };

        let joined = ServerMessage::UserJoined(UserInfo {
            user_id: user.id.clone(),
            username: username.to_owned(),
        });
        for peer in peers {
            peer.send(&joined);
        }

        Ok(Registration {
            user_id: user.id,
            username: username.to_owned(),
            recovery_phrase: Some(phrase),
            is_new_user: true,
        })
    }

    /// Bind an authenticated owner, evicting any live session that holds
    /// the username. Eviction and rebinding happen under one write lock so
    /// two sessions never share a name.
    async fn login_existing(&self, session: &Arc<Session>, user: &User) -> Registration {
        let peers = {
            let mut index = self.index.write().await;

            let imposter_conn = index
                .by_username
                .get(&user.username)
                .filter(|conn_id| conn_id.as_str() != session.id)
                .cloned();
            if let Some(conn_id) = imposter_conn {
                if let Some(imposter) = index.sessions.remove(&conn_id) {
                    imposter.send(&ServerMessage::Kicked(Kicked {
                        reason: "The account owner has logged in from another device".to_owned(),
                    }));
                    index.by_username.remove(&user.username);
                    let imposter_user = imposter.user_id();
                    if !imposter_user.is_empty() {
                        index.by_user_id.remove(&imposter_user);
                    }
                    // Room membership is left alone; the owner keeps it.
                    imposter.close();
                    info!("Kicked imposter {conn_id} for username {}", user.username);
                }
            }

            bind_session(&mut index, session, &user.id, &user.username);
            registered_peers(&index, &session.id)
        };

        let users = self.users.clone();
        let user_id = user.id.clone();
        tokio::spawn(async move {
            if let Err(e) = users.update_last_seen(&user_id).await {
                warn!("Failed to update last_seen for {user_id}: {e}");
            }
        });

        let joined = ServerMessage::UserJoined(UserInfo {
            user_id: user.id.clone(),
            username: user.username.clone(),
        });
        for peer in peers {
            peer.send(&joined);
        }

        Registration {
            user_id: user.id.clone(),
            username: user.username.clone(),
            recovery_phrase: None,
            is_new_user: false,
        }
    }

    /// Deliver a direct message to an online user. Direct messages are
    /// never persisted; an offline target is `UserNotFound`.
    pub async fn send_direct(
        &self,
        from: &Arc<Session>,
        to_username: &str,
        content: &str,
    ) -> Result<(), HubError> {
        let sender = from.identity().ok_or_else(HubError::not_registered)?;

        let target = {
            let index = self.index.read().await;
            index
                .by_username
                .get(to_username)
                .and_then(|conn_id| index.sessions.get(conn_id))
                .cloned()
        }
        .ok_or_else(|| HubError::new(ErrorCode::UserNotFound, "User not found"))?;

        target.send(&ServerMessage::DirectMessage(IncomingDirectMessage {
            message_id: Uuid::new_v4().to_string(),
            from: sender.username,
            from_id: sender.user_id,
            content: content.to_owned(),
            timestamp: now_ms(),
        }));
        Ok(())
    }

    /// Create a room, persist it, and announce it when public.
    pub async fn create_room(
        &self,
        session: &Arc<Session>,
        name: &str,
        is_public: bool,
    ) -> Result<RoomInfo, HubError> {
        let creator = session.identity().ok_or_else(HubError::not_registered)?;

        if !valid_room_name(name) {
            return Err(HubError::new(
                ErrorCode::InvalidRoomName,
                "Room name must be 1-50 characters",
            ));
        }

        let record = self
            .rooms
            .create(name, &creator.user_id, &creator.username, is_public)
            .await
            .map_err(|e| {
                error!("Failed to create room in database: {e}");
                HubError::new(ErrorCode::InvalidMessage, "Failed to create room")
            })?;

        if let Err(e) = self
            .members
            .add(&record.id, &creator.user_id, &creator.username)
            .await
        {
            warn!("Failed to persist creator membership for room {}: {e}", record.id);
        }

        let (info, peers) = {
            let mut index = self.index.write().await;
            let room = Arc::new(Room::new(
                &record.id,
                &record.name,
                &record.creator_id,
                &record.creator_username,
                record.is_public,
            ));
            room.add_member(&creator.user_id, &creator.username);
            index.rooms.insert(record.id.clone(), room.clone());
            session.join_room(&record.id);

            let peers = if is_public {
                registered_peers(&index, &session.id)
            } else {
                Vec::new()
            };
            (room.info(), peers)
        };

        if !peers.is_empty() {
            let created = ServerMessage::RoomCreated(RoomCreated {
                success: true,
                room: Some(info.clone()),
                error: None,
            });
            for peer in peers {
                peer.send(&created);
            }
        }

        Ok(info)
    }

    /// Join a room. An existing member reconnecting gets the room back
    /// silently, without a membership broadcast.
    pub async fn join_room(
        &self,
        session: &Arc<Session>,
        room_id: &str,
    ) -> Result<JoinOutcome, HubError> {
        let joiner = session.identity().ok_or_else(HubError::not_registered)?;

        let (outcome, peers) = {
            let index = self.index.write().await;
            let room = index
                .rooms
                .get(room_id)
                .cloned()
                .ok_or_else(HubError::room_not_found)?;

            if room.has_member(&joiner.user_id) {
                session.join_room(room_id);
                let outcome = JoinOutcome {
                    room: room.info(),
                    members: room.member_list(),
                    rejoined: true,
                };
                (outcome, Vec::new())
            } else {
                room.add_member(&joiner.user_id, &joiner.username);
                session.join_room(room_id);
                let outcome = JoinOutcome {
                    room: room.info(),
                    members: room.member_list(),
                    rejoined: false,
                };
                let peers = room_peers(&index, &room, &session.id);
                (outcome, peers)
            }
        };

        if !outcome.rejoined {
            let members = self.members.clone();
            let (rid, uid, uname) = (
                room_id.to_owned(),
                joiner.user_id.clone(),
                joiner.username.clone(),
            );
            tokio::spawn(async move {
                if let Err(e) = members.add(&rid, &uid, &uname).await {
                    warn!("Failed to persist membership {uid} -> {rid}: {e}");
                }
            });

            let notice = ServerMessage::RoomMembers(RoomMembers {
                room_id: room_id.to_owned(),
                action: MemberAction::Joined,
                user: UserInfo {
                    user_id: joiner.user_id,
                    username: joiner.username,
                },
                members: outcome.members.clone(),
            });
            for peer in peers {
                peer.send(&notice);
            }
        }

        Ok(outcome)
    }

    /// Leave a room. Empty rooms are left alive; the cleanup job deletes
    /// them on inactivity.
    pub async fn leave_room(
        &self,
        session: &Arc<Session>,
        room_id: &str,
    ) -> Result<(), HubError> {
        let user_id = session.user_id();
        let username = session.username();

        let (peers, members) = {
            let index = self.index.write().await;
            let room = index
                .rooms
                .get(room_id)
                .cloned()
                .ok_or_else(HubError::room_not_found)?;

            if !room.remove_member(&user_id) {
                return Err(HubError::not_in_room());
            }
            session.leave_room(room_id);

            (room_peers(&index, &room, &session.id), room.member_list())
        };

        let member_store = self.members.clone();
        let (rid, uid) = (room_id.to_owned(), user_id.clone());
        tokio::spawn(async move {
            if let Err(e) = member_store.remove(&rid, &uid).await {
                warn!("Failed to remove membership {uid} -> {rid}: {e}");
            }
        });

        let notice = ServerMessage::RoomMembers(RoomMembers {
            room_id: room_id.to_owned(),
            action: MemberAction::Left,
            user: UserInfo { user_id, username },
            members,
        });
        for peer in peers {
            peer.send(&notice);
        }

        Ok(())
    }

    /// Send a message to every member of a room, the sender included, so
    /// the client sees its own message with the authoritative id and
    /// timestamp. Persistence failure degrades to real-time delivery.
    pub async fn send_room_message(
        &self,
        from: &Arc<Session>,
        room_id: &str,
        content: &str,
    ) -> Result<(), HubError> {
        let sender = from.identity().ok_or_else(HubError::not_registered)?;

        {
            let index = self.index.read().await;
            let room = index.rooms.get(room_id).ok_or_else(HubError::room_not_found)?;
            if !room.has_member(&sender.user_id) {
                return Err(HubError::not_in_room());
            }
        }

        let (message_id, timestamp) = match self
            .messages
            .save(room_id, &sender.user_id, &sender.username, content)
            .await
        {
            Ok(saved) => (saved.id, saved.created_at),
            Err(e) => {
                error!("Failed to save message for room {room_id}: {e}");
                (Uuid::new_v4().to_string(), now_ms())
            }
        };

        let rooms = self.rooms.clone();
        let rid = room_id.to_owned();
        tokio::spawn(async move {
            if let Err(e) = rooms.update_activity(&rid).await {
                warn!("Failed to bump activity for room {rid}: {e}");
            }
        });

        let message = ServerMessage::RoomMessage(IncomingRoomMessage {
            message_id,
            room_id: room_id.to_owned(),
            from: sender.username,
            from_id: sender.user_id,
            content: content.to_owned(),
            timestamp,
        });

        let recipients = {
            let index = self.index.read().await;
            match index.rooms.get(room_id) {
                Some(room) => room
                    .member_ids()
                    .iter()
                    .filter_map(|uid| index.by_user_id.get(uid))
                    .filter_map(|conn_id| index.sessions.get(conn_id))
                    .cloned()
                    .collect(),
                None => Vec::new(),
            }
        };
        for recipient in recipients {
            recipient.send(&message);
        }

        Ok(())
    }

    /// One page of a room's history, oldest first, membership required.
    /// `limit` is normalized into [1, 100] with a default of 50.
    pub async fn room_history(
        &self,
        session: &Arc<Session>,
        room_id: &str,
        limit: Option<i64>,
        before: Option<i64>,
    ) -> Result<RoomHistory, HubError> {
        let reader = session.identity().ok_or_else(HubError::not_registered)?;

        {
            let index = self.index.read().await;
            let room = index.rooms.get(room_id).ok_or_else(HubError::room_not_found)?;
            if !room.has_member(&reader.user_id) {
                return Err(HubError::not_in_room());
            }
        }

        let limit = match limit {
            Some(n) if n > 0 => n.min(100),
            _ => 50,
        };

        // One extra row tells us whether an older page exists.
        let mut records = self
            .messages
            .history(room_id, limit + 1, before)
            .await
            .map_err(|e| {
                error!("Failed to get history for room {room_id}: {e}");
                HubError::new(ErrorCode::InvalidMessage, "Failed to fetch history")
            })?;

        let has_more = records.len() as i64 > limit;
        if has_more {
            records.truncate(limit as usize);
        }

        let messages = records
            .into_iter()
            .rev()
            .map(|m| IncomingRoomMessage {
                message_id: m.id,
                room_id: m.room_id,
                from: m.sender_username,
                from_id: m.sender_id,
                content: m.content,
                timestamp: m.created_at,
            })
            .collect();

        Ok(RoomHistory {
            room_id: room_id.to_owned(),
            messages,
            has_more,
        })
    }

    /// One entry per registered session.
    pub async fn user_list(&self) -> Vec<UserInfo> {
        let index = self.index.read().await;
        index
            .by_username
            .iter()
            .map(|(username, conn_id)| {
                let user_id = index
                    .sessions
                    .get(conn_id)
                    .map(|s| s.user_id())
                    .unwrap_or_else(|| conn_id.clone());
                UserInfo {
                    user_id,
                    username: username.clone(),
                }
            })
            .collect()
    }

    /// Rooms visible to the session: public ones plus its memberships.
    pub async fn room_list(&self, session: &Arc<Session>) -> Vec<RoomInfo> {
        let user_id = session.user_id();
        let index = self.index.read().await;
        index
            .rooms
            .values()
            .filter(|room| room.is_public || room.has_member(&user_id))
            .map(|room| room.info())
            .collect()
    }

    /// A room by id, if loaded.
    pub async fn get_room(&self, room_id: &str) -> Option<Arc<Room>> {
        self.index.read().await.rooms.get(room_id).cloned()
    }

    /// Drop in-memory rooms no longer present in the store. Called by the
    /// cleanup job after it deleted rooms.
    pub async fn prune_rooms(&self) {
        let surviving: std::collections::HashSet<String> = match self.rooms.get_all().await {
            Ok(records) => records.into_iter().map(|r| r.id).collect(),
            Err(e) => {
                warn!("Failed to refresh rooms after cleanup: {e}");
                return;
            }
        };

        let mut index = self.index.write().await;
        index.rooms.retain(|id, _| surviving.contains(id));
    }

    /// Total persisted users, for the health endpoint.
    pub async fn user_count(&self) -> i64 {
        self.users.count().await.unwrap_or(0)
    }

    /// Total persisted rooms, for the health endpoint.
    pub async fn room_count(&self) -> i64 {
        self.rooms.count().await.unwrap_or(0)
    }
}

fn bind_session(index: &mut HubIndex, session: &Arc<Session>, user_id: &str, username: &str) {
    session.bind(user_id, username);
    index
        .by_username
        .insert(username.to_owned(), session.id.clone());
    index
        .by_user_id
        .insert(user_id.to_owned(), session.id.clone());
}
