//! In-memory room state
//!
//! The hub's mirror of a persisted room. The member set has its own lock,
//! always acquired after the hub's index lock and never across an await.

use std::collections::HashMap;
use std::sync::RwLock;

use haven_shared::protocol::{RoomInfo, UserInfo};

/// A chat room and its current member set (user id -> username).
pub struct Room {
    /// Room id, assigned by the room store.
    pub id: String,
    /// Room name.
    pub name: String,
    /// Creator's user id.
    pub creator_id: String,
    /// Creator's username at creation time.
    pub creator_username: String,
    /// Whether the room is announced to everyone.
    pub is_public: bool,
    members: RwLock<HashMap<String, String>>,
}

impl Room {
    /// Create an empty room. Membership is added explicitly by the hub, on
    /// creation (the creator) or on hydration (the persisted member rows).
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        creator_id: impl Into<String>,
        creator_username: impl Into<String>,
        is_public: bool,
    ) -> Self {
        Room {
            id: id.into(),
            name: name.into(),
            creator_id: creator_id.into(),
            creator_username: creator_username.into(),
            is_public,
            members: RwLock::new(HashMap::new()),
        }
    }

    /// Add a member. Returns false if already present (username untouched).
    pub fn add_member(&self, user_id: &str, username: &str) -> bool {
        let mut members = self.members.write().unwrap();
        if members.contains_key(user_id) {
            return false;
        }
        members.insert(user_id.to_owned(), username.to_owned());
        true
    }

    /// Remove a member. Returns false if absent.
    pub fn remove_member(&self, user_id: &str) -> bool {
        self.members.write().unwrap().remove(user_id).is_some()
    }

    /// Whether the user is a member.
    pub fn has_member(&self, user_id: &str) -> bool {
        self.members.read().unwrap().contains_key(user_id)
    }

    /// Number of members.
    pub fn member_count(&self) -> usize {
        self.members.read().unwrap().len()
    }

    /// Member user ids.
    pub fn member_ids(&self) -> Vec<String> {
        self.members.read().unwrap().keys().cloned().collect()
    }

    /// Members as public user records.
    pub fn member_list(&self) -> Vec<UserInfo> {
        self.members
            .read()
            .unwrap()
            .iter()
            .map(|(user_id, username)| UserInfo {
                user_id: user_id.clone(),
                username: username.clone(),
            })
            .collect()
    }

    /// Public room record.
    pub fn info(&self) -> RoomInfo {
        RoomInfo {
            room_id: self.id.clone(),
            name: self.name.clone(),
            creator: self.creator_username.clone(),
            creator_id: self.creator_id.clone(),
            member_count: self.member_count(),
            is_public: self.is_public,
        }
    }
}
