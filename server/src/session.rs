//! Per-connection session state
//!
//! A session owns exactly one WebSocket connection. The hub holds a
//! reference and talks to the connection only through the bounded outbound
//! queue; the writer pump in [`crate::ws`] drains the other end.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use tokio::sync::mpsc;
use tracing::{debug, warn};

use haven_shared::protocol::{self, ErrorCode, ErrorPayload, ServerMessage};

/// Outbound queue capacity per session. A full queue drops the frame: one
/// slow consumer must never block the hub.
pub const OUTBOUND_QUEUE: usize = 256;

/// Identity bound to a session by a successful registration.
#[derive(Debug, Clone)]
pub struct Identity {
    /// Stable user id from the identity store.
    pub user_id: String,
    /// Registered username.
    pub username: String,
}

#[derive(Default)]
struct SessionState {
    user_id: String,
    username: String,
    rooms: HashSet<String>,
}

/// One live connection: identity, joined rooms, and the outbound queue.
pub struct Session {
    /// Per-connection random id.
    pub id: String,
    outbound: mpsc::Sender<String>,
    closed: AtomicBool,
    close_signal: tokio::sync::Notify,
    state: RwLock<SessionState>,
}

impl Session {
    /// Create a session and the receiving end of its outbound queue.
    ///
    /// The caller (the WebSocket handler, or a test standing in for one)
    /// owns the receiver and is responsible for draining it.
    pub fn new(id: String) -> (Arc<Self>, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let session = Arc::new(Session {
            id,
            outbound: tx,
            closed: AtomicBool::new(false),
            close_signal: tokio::sync::Notify::new(),
            state: RwLock::new(SessionState::default()),
        });
        (session, rx)
    }

    /// Enqueue an outbound message. Never blocks; the frame is dropped if
    /// the queue is full or the connection is gone.
    pub fn send(&self, msg: &ServerMessage) {
        match protocol::encode(msg) {
            Ok(frame) => {
                if self.outbound.try_send(frame).is_err() {
                    debug!("Dropping outbound frame for slow session {}", self.id);
                }
            }
            Err(e) => warn!("Failed to encode outbound frame: {e}"),
        }
    }

    /// Enqueue an error reply.
    pub fn send_error(&self, code: ErrorCode, message: &str) {
        self.send(&ServerMessage::Error(ErrorPayload {
            code,
            message: message.to_owned(),
            target: None,
        }));
    }

    /// Enqueue an error reply naming its subject (e.g. a DM target).
    pub fn send_error_with_target(&self, code: ErrorCode, message: &str, target: &str) {
        self.send(&ServerMessage::Error(ErrorPayload {
            code,
            message: message.to_owned(),
            target: Some(target.to_owned()),
        }));
    }

    /// Close the session. Idempotent: the first call signals the writer
    /// pump to drain, emit a close frame and terminate.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.close_signal.notify_one();
        }
    }

    /// Whether [`Session::close`] has run.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Resolve once the session has been closed.
    pub async fn wait_closed(&self) {
        if self.is_closed() {
            return;
        }
        self.close_signal.notified().await;
    }

    /// Bind a registered identity to this session.
    pub fn bind(&self, user_id: &str, username: &str) {
        let mut state = self.state.write().unwrap();
        state.user_id = user_id.to_owned();
        state.username = username.to_owned();
    }

    /// The registered identity, or `None` before registration completes.
    pub fn identity(&self) -> Option<Identity> {
        let state = self.state.read().unwrap();
        if state.username.is_empty() {
            None
        } else {
            Some(Identity {
                user_id: state.user_id.clone(),
                username: state.username.clone(),
            })
        }
    }

    /// Registered username, empty until registration.
    pub fn username(&self) -> String {
        self.state.read().unwrap().username.clone()
    }

    /// Stable user id, empty until registration.
    pub fn user_id(&self) -> String {
        self.state.read().unwrap().user_id.clone()
    }

    /// Track a joined room on this session.
    pub fn join_room(&self, room_id: &str) {
        self.state.write().unwrap().rooms.insert(room_id.to_owned());
    }

    /// Untrack a room on this session.
    pub fn leave_room(&self, room_id: &str) {
        self.state.write().unwrap().rooms.remove(room_id);
    }

    /// Whether this session tracks the room.
    pub fn is_in_room(&self, room_id: &str) -> bool {
        self.state.read().unwrap().rooms.contains(room_id)
    }

    /// Snapshot of the joined-room set.
    pub fn rooms(&self) -> Vec<String> {
        self.state.read().unwrap().rooms.iter().cloned().collect()
    }
}
