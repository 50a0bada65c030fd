//! Wire protocol for the Haven relay
//!
//! Every frame is one JSON envelope: a `type` discriminator, a
//! type-specific `payload`, and a millisecond timestamp assigned by the
//! server on outbound frames. Inbound frames decode into [`ClientMessage`]
//! so the relay dispatches with one exhaustive match; unrecognized types
//! surface as [`ClientMessage::Unknown`] rather than a decode failure.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Maximum size of a single wire frame.
pub const MAX_FRAME_BYTES: usize = 8 * 1024;

/// Current timestamp in milliseconds since the Unix epoch.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as i64
}

/// Codec failure while reading or writing a frame.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The frame or its payload was not valid JSON for the claimed type.
    #[error("invalid frame: {0}")]
    Json(#[from] serde_json::Error),
}

/// The outer record carried by every frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Message type discriminator.
    #[serde(rename = "type")]
    pub kind: String,
    /// Type-specific payload, opaque until matched against `kind`.
    #[serde(default)]
    pub payload: Value,
    /// Milliseconds since the Unix epoch, server-assigned on outbound.
    #[serde(default)]
    pub timestamp: i64,
}

impl Envelope {
    /// Resolve the envelope into a typed client message.
    ///
    /// Unknown discriminators are returned as [`ClientMessage::Unknown`];
    /// a payload that does not match the discriminator's shape is an error.
    pub fn into_message(self) -> Result<ClientMessage, ProtocolError> {
        let msg = match self.kind.as_str() {
            "register" => ClientMessage::Register(serde_json::from_value(self.payload)?),
            "direct_message" => ClientMessage::DirectMessage(serde_json::from_value(self.payload)?),
            "room_create" => ClientMessage::RoomCreate(serde_json::from_value(self.payload)?),
            "room_join" => ClientMessage::RoomJoin(serde_json::from_value(self.payload)?),
            "room_leave" => ClientMessage::RoomLeave(serde_json::from_value(self.payload)?),
            "room_message" => ClientMessage::RoomMessage(serde_json::from_value(self.payload)?),
            "room_history" => ClientMessage::RoomHistory(serde_json::from_value(self.payload)?),
            "user_list" => ClientMessage::UserList,
            "room_list" => ClientMessage::RoomList,
            other => ClientMessage::Unknown(other.to_owned()),
        };
        Ok(msg)
    }
}

/// Decode one inbound frame.
pub fn decode(frame: &str) -> Result<ClientMessage, ProtocolError> {
    let envelope: Envelope = serde_json::from_str(frame)?;
    envelope.into_message()
}

/// Encode one outbound message, stamping the current server time.
pub fn encode(msg: &ServerMessage) -> Result<String, ProtocolError> {
    let mut value = serde_json::to_value(msg)?;
    if let Value::Object(map) = &mut value {
        map.insert("timestamp".to_owned(), Value::from(now_ms()));
    }
    Ok(value.to_string())
}

// ==================== Client -> Server ====================

/// Every message a client may send, one variant per wire type.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientMessage {
    /// Claim a username, optionally proving ownership.
    Register(RegisterPayload),
    /// Send a direct message to an online user.
    DirectMessage(DirectMessagePayload),
    /// Create a room.
    RoomCreate(RoomCreatePayload),
    /// Join an existing room.
    RoomJoin(RoomJoinPayload),
    /// Leave a room.
    RoomLeave(RoomLeavePayload),
    /// Send a message to a room.
    RoomMessage(RoomMessagePayload),
    /// Page through a room's message history.
    RoomHistory(RoomHistoryPayload),
    /// Request the list of online users.
    UserList,
    /// Request the list of visible rooms.
    RoomList,
    /// A type the relay does not recognize; rejected with an error reply.
    Unknown(String),
}

/// Register a username with optional fingerprint / recovery proof.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    /// Requested username.
    pub username: String,
    /// Device fingerprint, empty when the client has none.
    #[serde(default)]
    pub fingerprint: String,
    /// Recovery phrase, supplied when reclaiming a registered name.
    #[serde(default)]
    pub recovery_code: String,
}

/// Direct message to another user, addressed by username.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectMessagePayload {
    /// Target username.
    pub to: String,
    /// Message body.
    pub content: String,
}

/// Create a new room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomCreatePayload {
    /// Room name, 1-50 characters.
    pub name: String,
    /// Whether the room is announced to everyone.
    pub is_public: bool,
}

/// Join an existing room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomJoinPayload {
    /// Target room.
    pub room_id: String,
}

/// Leave a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomLeavePayload {
    /// Target room.
    pub room_id: String,
}

/// Send a message to a room.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomMessagePayload {
    /// Target room.
    pub room_id: String,
    /// Message body.
    pub content: String,
}

/// Page through room history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomHistoryPayload {
    /// Target room.
    pub room_id: String,
    /// Maximum messages to return; normalized server-side to [1, 100].
    #[serde(default)]
    pub limit: Option<i64>,
    /// Only messages strictly older than this ms timestamp.
    #[serde(default)]
    pub before: Option<i64>,
}

// ==================== Server -> Client ====================

/// Every message the relay may send. Serializes adjacently tagged as
/// `{"type": ..., "payload": ...}`; [`encode`] adds the timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration outcome.
    RegisterAck(RegisterAck),
    /// The session was evicted by the account owner.
    Kicked(Kicked),
    /// A user came online.
    UserJoined(UserInfo),
    /// A user went offline.
    UserLeft(UserInfo),
    /// Room creation outcome, also broadcast for new public rooms.
    RoomCreated(RoomCreated),
    /// Room join outcome.
    RoomJoined(RoomJoined),
    /// Room leave outcome.
    RoomLeft(RoomLeft),
    /// Membership change notification to remaining members.
    RoomMembers(RoomMembers),
    /// Incoming direct message.
    DirectMessage(IncomingDirectMessage),
    /// Incoming room message.
    RoomMessage(IncomingRoomMessage),
    /// Online users.
    UserListResponse(UserList),
    /// Visible rooms.
    RoomListResponse(RoomList),
    /// One page of room history.
    RoomHistoryResponse(RoomHistory),
    /// Error reply for requests without a dedicated failure shape.
    Error(ErrorPayload),
}

/// Registration acknowledgment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegisterAck {
    /// Whether the registration succeeded.
    pub success: bool,
    /// Bound username on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Stable user id on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Plaintext recovery phrase, delivered once to new users only.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub recovery_code: Option<String>,
    /// True when this registration created the account.
    #[serde(default)]
    pub is_new_user: bool,
    /// Error code on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorCode>,
}

/// Eviction notice sent to an imposter before its session closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Kicked {
    /// Human-readable reason.
    pub reason: String,
}

/// Public user record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserInfo {
    /// Stable user id.
    pub user_id: String,
    /// Username.
    pub username: String,
}

/// Public room record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomInfo {
    /// Room id.
    pub room_id: String,
    /// Room name.
    pub name: String,
    /// Creator's username.
    pub creator: String,
    /// Creator's user id.
    pub creator_id: String,
    /// Current member count.
    pub member_count: usize,
    /// Whether the room is announced to everyone.
    pub is_public: bool,
}

/// Room creation outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomCreated {
    /// Whether the room was created.
    pub success: bool,
    /// The new room on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomInfo>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Room join outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomJoined {
    /// Whether the join succeeded.
    pub success: bool,
    /// Target room id, echoed even on failure so the client can clean up.
    pub room_id: String,
    /// The joined room on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub room: Option<RoomInfo>,
    /// Member list on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub members: Option<Vec<UserInfo>>,
    /// Recent messages, oldest first, on success.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history: Option<Vec<IncomingRoomMessage>>,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Room leave outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomLeft {
    /// Whether the leave succeeded.
    pub success: bool,
    /// Target room id.
    pub room_id: String,
    /// Error message on failure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Membership change direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberAction {
    /// A user joined the room.
    Joined,
    /// A user left the room.
    Left,
}

/// Membership change notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomMembers {
    /// Affected room.
    pub room_id: String,
    /// What happened.
    pub action: MemberAction,
    /// The user who joined or left.
    pub user: UserInfo,
    /// Full member list after the change.
    pub members: Vec<UserInfo>,
}

/// A direct message delivered to its recipient.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingDirectMessage {
    /// Relay-assigned message id.
    pub message_id: String,
    /// Sender's username.
    pub from: String,
    /// Sender's user id.
    pub from_id: String,
    /// Message body.
    pub content: String,
    /// Server timestamp in milliseconds.
    pub timestamp: i64,
}

/// A room message delivered to a member, including the echo to its sender.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IncomingRoomMessage {
    /// Relay-assigned message id.
    pub message_id: String,
    /// Originating room.
    pub room_id: String,
    /// Sender's username.
    pub from: String,
    /// Sender's user id.
    pub from_id: String,
    /// Message body.
    pub content: String,
    /// Server timestamp in milliseconds.
    pub timestamp: i64,
}

/// Online users.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserList {
    /// One entry per registered session.
    pub users: Vec<UserInfo>,
}

/// Visible rooms.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomList {
    /// Public rooms plus rooms the requester is a member of.
    pub rooms: Vec<RoomInfo>,
}

/// One page of room history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoomHistory {
    /// Target room.
    pub room_id: String,
    /// Messages, oldest first.
    pub messages: Vec<IncomingRoomMessage>,
    /// Whether older messages remain before this page.
    pub has_more: bool,
}

/// Error reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    /// Machine-readable code.
    pub code: ErrorCode,
    /// Human-readable description.
    pub message: String,
    /// Subject of the failure, e.g. the username of a failed direct message.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
}

/// Client-facing error codes. The serialized strings are part of the
/// protocol contract and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// The username is taken by a live session.
    UsernameInUse,
    /// The username fails validation.
    InvalidUsername,
    /// The operation requires a registered session.
    NotRegistered,
    /// No such room.
    RoomNotFound,
    /// The user is not a member of the room.
    NotInRoom,
    /// The user is already a member of the room.
    AlreadyInRoom,
    /// No such online user.
    UserNotFound,
    /// Malformed or unprocessable request.
    InvalidMessage,
    /// The room name fails validation.
    InvalidRoomName,
    /// The username is registered; a recovery phrase is required.
    RecoveryRequired,
    /// The supplied recovery phrase is wrong.
    InvalidRecovery,
}

impl ErrorCode {
    /// The exact wire string for this code.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::UsernameInUse => "USERNAME_IN_USE",
            ErrorCode::InvalidUsername => "INVALID_USERNAME",
            ErrorCode::NotRegistered => "NOT_REGISTERED",
            ErrorCode::RoomNotFound => "ROOM_NOT_FOUND",
            ErrorCode::NotInRoom => "NOT_IN_ROOM",
            ErrorCode::AlreadyInRoom => "ALREADY_IN_ROOM",
            ErrorCode::UserNotFound => "USER_NOT_FOUND",
            ErrorCode::InvalidMessage => "INVALID_MESSAGE",
            ErrorCode::InvalidRoomName => "INVALID_ROOM_NAME",
            ErrorCode::RecoveryRequired => "RECOVERY_REQUIRED",
            ErrorCode::InvalidRecovery => "INVALID_RECOVERY",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
