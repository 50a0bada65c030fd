//! WebSocket endpoint: upgrade, pumps, and inbound dispatch
//!
//! Each connection runs two cooperating tasks. The reader decodes frames
//! under a liveness deadline and hands them to the hub synchronously; the
//! writer drains the session's outbound queue, emits keepalive pings, and
//! flushes a close frame when the session is closed. Any I/O error is
//! terminal for the session; the hub's detach sequence runs exactly once.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{sink::SinkExt, stream::StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info};
use uuid::Uuid;

use haven_shared::protocol::{
    self, ClientMessage, ErrorCode, RegisterAck, RoomCreated, RoomJoined, RoomLeft, RoomList,
    ServerMessage, UserList,
};

use crate::hub::Hub;
use crate::session::Session;

/// Time allowed to write one frame to the peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Reader deadline; a peer silent for this long is dead.
const READ_WAIT: Duration = Duration::from_secs(60);

/// Keepalive ping period; must stay below [`READ_WAIT`].
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Handle the `/ws` upgrade and hand the connection to the hub.
pub async fn handle_websocket(
    ws: WebSocketUpgrade,
    State(hub): State<Arc<Hub>>,
) -> impl IntoResponse {
    ws.max_message_size(protocol::MAX_FRAME_BYTES)
        .on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<Hub>) {
    let (ws_tx, ws_rx) = socket.split();

    let (session, outbound) = Session::new(Uuid::new_v4().to_string());
    hub.attach(session.clone()).await;
    info!("Client connected: {}", session.id);

    let writer = tokio::spawn(write_pump(ws_tx, outbound, session.clone()));

    read_pump(ws_rx, &hub, &session).await;

    hub.detach(&session).await;
    info!("Client disconnected: {} ({})", session.id, session.username());

    // detach closed the session, so the writer drains and exits on its own.
    let _ = writer.await;
}

/// Drain the outbound queue onto the socket, pinging on a timer. Exits on
/// write failure, a closed queue, or the session's close signal.
async fn write_pump(
    mut ws_tx: futures::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
    session: Arc<Session>,
) {
    let mut ping = tokio::time::interval(PING_PERIOD);
    ping.tick().await; // skip the immediate first tick

    loop {
        tokio::select! {
            frame = outbound.recv() => match frame {
                Some(text) => {
                    if write_frame(&mut ws_tx, Message::Text(text.into())).await.is_err() {
                        return;
                    }
                }
                None => break,
            },
            _ = ping.tick() => {
                if write_frame(&mut ws_tx, Message::Ping(Default::default())).await.is_err() {
                    return;
                }
            }
            _ = session.wait_closed() => break,
        }
    }

    // Flush whatever is already queued (e.g. a kicked notice) before the
    // close frame.
    while let Ok(text) = outbound.try_recv() {
        if write_frame(&mut ws_tx, Message::Text(text.into())).await.is_err() {
            return;
        }
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

async fn write_frame(
    ws_tx: &mut futures::stream::SplitSink<WebSocket, Message>,
    message: Message,
) -> Result<(), ()> {
    match tokio::time::timeout(WRITE_WAIT, ws_tx.send(message)).await {
        Ok(Ok(())) => Ok(()),
        _ => Err(()),
    }
}

/// Read frames under the liveness deadline and dispatch them to the hub.
/// Any frame from the peer, pongs included, re-arms the deadline.
async fn read_pump(
    mut ws_rx: futures::stream::SplitStream<WebSocket>,
    hub: &Arc<Hub>,
    session: &Arc<Session>,
) {
    loop {
        let frame = match tokio::time::timeout(READ_WAIT, ws_rx.next()).await {
            Err(_) => {
                debug!("Read deadline expired for {}", session.id);
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(e))) => {
                debug!("WebSocket error for {}: {e}", session.id);
                return;
            }
            Ok(Some(Ok(frame))) => frame,
        };

        match frame {
            Message::Text(text) => match protocol::decode(&text) {
                Ok(msg) => dispatch(hub, session, msg).await,
                Err(e) => {
                    debug!("Invalid frame from {}: {e}", session.id);
                    session.send_error(ErrorCode::InvalidMessage, "Invalid JSON");
                }
            },
            Message::Close(_) => return,
            // Binary frames are not part of the protocol; pings are
            // answered by axum and pongs only feed the deadline.
            Message::Binary(_) | Message::Ping(_) | Message::Pong(_) => {}
        }
    }
}

/// One exhaustive match over everything a client can say.
async fn dispatch(hub: &Arc<Hub>, session: &Arc<Session>, msg: ClientMessage) {
    match msg {
        ClientMessage::Register(p) => {
            match hub
                .register(session, &p.username, &p.fingerprint, &p.recovery_code)
                .await
            {
                Ok(reg) => {
                    if reg.is_new_user {
                        info!("New user registered: {} ({})", reg.username, session.id);
                    } else {
                        info!("User logged in: {} ({})", reg.username, session.id);
                    }
                    session.send(&ServerMessage::RegisterAck(RegisterAck {
                        success: true,
                        username: Some(reg.username),
                        user_id: Some(reg.user_id),
                        recovery_code: reg.recovery_phrase,
                        is_new_user: reg.is_new_user,
                        error: None,
                    }));
                }
                Err(e) => {
                    session.send(&ServerMessage::RegisterAck(RegisterAck {
                        success: false,
                        error: Some(e.code),
                        ..Default::default()
                    }));
                }
            }
        }

        ClientMessage::DirectMessage(p) => {
            if let Err(e) = hub.send_direct(session, &p.to, &p.content).await {
                session.send_error_with_target(e.code, &e.message, &p.to);
            }
        }

        ClientMessage::RoomCreate(p) => {
            match hub.create_room(session, &p.name, p.is_public).await {
                Ok(info) => {
                    info!("Room created: {} ({}) by {}", info.name, info.room_id, session.username());
                    session.send(&ServerMessage::RoomCreated(RoomCreated {
                        success: true,
                        room: Some(info),
                        error: None,
                    }));
                }
                Err(e) => {
                    session.send(&ServerMessage::RoomCreated(RoomCreated {
                        success: false,
                        room: None,
                        error: Some(e.message),
                    }));
                }
            }
        }

        ClientMessage::RoomJoin(p) => match hub.join_room(session, &p.room_id).await {
            Ok(outcome) => {
                // Recent context for the joiner; errors degrade to no history.
                let history = hub
                    .room_history(session, &p.room_id, Some(50), None)
                    .await
                    .map(|h| h.messages)
                    .ok();
                session.send(&ServerMessage::RoomJoined(RoomJoined {
                    success: true,
                    room_id: p.room_id,
                    room: Some(outcome.room),
                    members: Some(outcome.members),
                    history,
                    error: None,
                }));
            }
            Err(e) => {
                session.send(&ServerMessage::RoomJoined(RoomJoined {
                    success: false,
                    room_id: p.room_id,
                    room: None,
                    members: None,
                    history: None,
                    error: Some(e.message),
                }));
            }
        },

        ClientMessage::RoomLeave(p) => {
            let result = hub.leave_room(session, &p.room_id).await;
            session.send(&ServerMessage::RoomLeft(RoomLeft {
                success: result.is_ok(),
                room_id: p.room_id,
                error: result.err().map(|e| e.message),
            }));
        }

        ClientMessage::RoomMessage(p) => {
            if let Err(e) = hub.send_room_message(session, &p.room_id, &p.content).await {
                session.send_error(e.code, &e.message);
            }
        }

        ClientMessage::RoomHistory(p) => {
            match hub
                .room_history(session, &p.room_id, p.limit, p.before)
                .await
            {
                Ok(history) => session.send(&ServerMessage::RoomHistoryResponse(history)),
                Err(e) => session.send_error(e.code, &e.message),
            }
        }

        ClientMessage::UserList => {
            let users = hub.user_list().await;
            session.send(&ServerMessage::UserListResponse(UserList { users }));
        }

        ClientMessage::RoomList => {
            let rooms = hub.room_list(session).await;
            session.send(&ServerMessage::RoomListResponse(RoomList { rooms }));
        }

        ClientMessage::Unknown(kind) => {
            debug!("Unknown message type {kind:?} from {}", session.id);
            session.send_error(ErrorCode::InvalidMessage, "Unknown message type");
        }
    }
}
