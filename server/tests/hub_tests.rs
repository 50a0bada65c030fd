//! Hub integration tests
//!
//! Sessions are created without a real socket; the tests hold the
//! receiving end of each outbound queue and read the frames the hub
//! enqueued, exactly as the writer pump would.

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::mpsc;

use haven_server::hub::{Hub, Registration};
use haven_server::session::Session;
use haven_server::store::{self, MemberStore, MessageStore, RoomStore, UserStore};
use haven_shared::protocol::ErrorCode;

async fn new_hub() -> Arc<Hub> {
    let pool = store::init("sqlite::memory:", 1, 1)
        .await
        .expect("failed to init test database");
    Arc::new(Hub::new(
        UserStore::new(pool.clone()),
        RoomStore::new(pool.clone()),
        MemberStore::new(pool.clone()),
        MessageStore::new(pool),
    ))
}

async fn connect(hub: &Arc<Hub>, id: &str) -> (Arc<Session>, mpsc::Receiver<String>) {
    let (session, rx) = Session::new(id.to_owned());
    hub.attach(session.clone()).await;
    (session, rx)
}

async fn register(hub: &Arc<Hub>, session: &Arc<Session>, username: &str, fp: &str) -> Registration {
    hub.register(session, username, fp, "")
        .await
        .expect("registration should succeed")
}

/// Drain and JSON-decode everything currently queued for a session.
fn drain(rx: &mut mpsc::Receiver<String>) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(frame) = rx.try_recv() {
        frames.push(serde_json::from_str(&frame).expect("frames must be valid JSON"));
    }
    frames
}

fn of_type<'a>(frames: &'a [Value], kind: &str) -> Vec<&'a Value> {
    frames.iter().filter(|f| f["type"] == kind).collect()
}

// ============================================================================
// Registration and identity
// ============================================================================

#[tokio::test]
async fn new_user_gets_recovery_phrase_once() {
    let hub = new_hub().await;
    let (alice, _rx) = connect(&hub, "c1").await;

    let reg = register(&hub, &alice, "alice", "fpA").await;
    assert!(reg.is_new_user);
    assert_eq!(reg.username, "alice");
    assert!(!reg.user_id.is_empty());

    let phrase = reg.recovery_phrase.expect("new users receive a phrase");
    assert_eq!(phrase.split('-').count(), 6);

    assert_eq!(hub.user_count().await, 1);
    assert_eq!(alice.username(), "alice");
}

#[tokio::test]
async fn returning_user_with_matching_fingerprint() {
    let hub = new_hub().await;
    let (first, _rx1) = connect(&hub, "c1").await;
    let original = register(&hub, &first, "alice", "fpA").await;
    hub.detach(&first).await;

    let (second, _rx2) = connect(&hub, "c2").await;
    let reg = register(&hub, &second, "alice", "fpA").await;

    assert!(!reg.is_new_user);
    assert_eq!(reg.user_id, original.user_id, "user_id must be stable");
    assert!(reg.recovery_phrase.is_none(), "no phrase for returning users");
    assert_eq!(hub.user_count().await, 1);
}

#[tokio::test]
async fn wrong_fingerprint_requires_recovery() {
    let hub = new_hub().await;
    let (first, _rx1) = connect(&hub, "c1").await;
    register(&hub, &first, "alice", "fpA").await;
    hub.detach(&first).await;

    let (intruder, _rx2) = connect(&hub, "c2").await;
    let err = hub.register(&intruder, "alice", "fpX", "").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RecoveryRequired);
    assert!(intruder.identity().is_none());
}

#[tokio::test]
async fn invalid_recovery_code_is_rejected() {
    let hub = new_hub().await;
    let (first, _rx1) = connect(&hub, "c1").await;
    register(&hub, &first, "alice", "fpA").await;
    hub.detach(&first).await;

    let (intruder, _rx2) = connect(&hub, "c2").await;
    let err = hub
        .register(&intruder, "alice", "fpX", "wrong-words-here")
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRecovery);
}

#[tokio::test]
async fn username_validation_boundaries() {
    let hub = new_hub().await;

    let (c1, _rx1) = connect(&hub, "c1").await;
    let err = hub.register(&c1, "ab", "", "").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidUsername);

    let err = hub.register(&c1, &"a".repeat(21), "", "").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidUsername);

    let err = hub.register(&c1, "bad name!", "", "").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidUsername);

    // 20 characters of the allowed alphabet is accepted.
    let name = "A1b2_c3-d4E5f6_g7-h8";
    assert_eq!(name.len(), 20);
    let reg = hub.register(&c1, name, "fp", "").await.unwrap();
    assert_eq!(reg.username, name);
}

#[tokio::test]
async fn same_connection_reregisters_idempotently() {
    let hub = new_hub().await;
    let (alice, mut rx) = connect(&hub, "c1").await;

    let first = register(&hub, &alice, "alice", "fpA").await;
    let second = register(&hub, &alice, "alice", "fpA").await;

    assert!(!second.is_new_user);
    assert_eq!(second.user_id, first.user_id);

    // The session must not have been kicked by its own login.
    assert!(!alice.is_closed());
    assert!(of_type(&drain(&mut rx), "kicked").is_empty());
}

#[tokio::test]
async fn owner_login_evicts_imposter() {
    let hub = new_hub().await;
    let (imposter, mut imposter_rx) = connect(&hub, "c1").await;
    let reg = register(&hub, &imposter, "alice", "fpA").await;
    let phrase = reg.recovery_phrase.unwrap();

    let (owner, _owner_rx) = connect(&hub, "c2").await;
    let owner_reg = hub
        .register(&owner, "alice", "fpB", &phrase)
        .await
        .expect("recovery login should succeed");

    assert!(!owner_reg.is_new_user);
    assert_eq!(owner_reg.user_id, reg.user_id);

    // The imposter got a kicked notice and its session closed.
    let frames = drain(&mut imposter_rx);
    let kicked = of_type(&frames, "kicked");
    assert_eq!(kicked.len(), 1);
    assert_eq!(
        kicked[0]["payload"]["reason"],
        "The account owner has logged in from another device"
    );
    assert!(imposter.is_closed());

    // Exactly one alice remains online, bound to the owner's connection.
    let users = hub.user_list().await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].username, "alice");
    assert_eq!(users[0].user_id, owner_reg.user_id);

    // The evicted socket eventually detaches; the owner's binding survives.
    hub.detach(&imposter).await;
    let users = hub.user_list().await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].username, "alice");
}

#[tokio::test]
async fn recovery_login_rotates_fingerprint() {
    let hub = new_hub().await;
    let (first, _rx1) = connect(&hub, "c1").await;
    let phrase = register(&hub, &first, "alice", "fpA").await.recovery_phrase.unwrap();
    hub.detach(&first).await;

    let (second, _rx2) = connect(&hub, "c2").await;
    hub.register(&second, "alice", "fpB", &phrase).await.unwrap();
    hub.detach(&second).await;

    // The new fingerprint now logs in directly.
    let (third, _rx3) = connect(&hub, "c3").await;
    let reg = hub.register(&third, "alice", "fpB", "").await.unwrap();
    assert!(!reg.is_new_user);

    // And the old one no longer does.
    hub.detach(&third).await;
    let (fourth, _rx4) = connect(&hub, "c4").await;
    let err = hub.register(&fourth, "alice", "fpA", "").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RecoveryRequired);
}

// ============================================================================
// Presence
// ============================================================================

#[tokio::test]
async fn registration_and_disconnect_are_broadcast() {
    let hub = new_hub().await;
    let (alice, mut alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;

    let (bob, _bob_rx) = connect(&hub, "c2").await;
    register(&hub, &bob, "bob", "fpB").await;

    let frames = drain(&mut alice_rx);
    let joined = of_type(&frames, "user_joined");
    assert_eq!(joined.len(), 1);
    assert_eq!(joined[0]["payload"]["username"], "bob");

    hub.detach(&bob).await;
    let frames = drain(&mut alice_rx);
    let left = of_type(&frames, "user_left");
    assert_eq!(left.len(), 1);
    assert_eq!(left[0]["payload"]["username"], "bob");

    let users = hub.user_list().await;
    assert_eq!(users.len(), 1);
    assert_eq!(users[0].username, "alice");
}

// ============================================================================
// Rooms
// ============================================================================

#[tokio::test]
async fn public_room_creation_is_broadcast() {
    let hub = new_hub().await;
    let (alice, _alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;
    let (bob, mut bob_rx) = connect(&hub, "c2").await;
    register(&hub, &bob, "bob", "fpB").await;
    drain(&mut bob_rx);

    let info = hub.create_room(&alice, "general", true).await.unwrap();
    assert_eq!(info.name, "general");
    assert_eq!(info.creator, "alice");
    assert_eq!(info.member_count, 1, "creator is the sole member");

    let frames = drain(&mut bob_rx);
    let created = of_type(&frames, "room_created");
    assert_eq!(created.len(), 1);
    assert_eq!(created[0]["payload"]["room"]["name"], "general");
    assert_eq!(created[0]["payload"]["success"], true);

    // Private rooms are not announced.
    hub.create_room(&alice, "hideout", false).await.unwrap();
    assert!(of_type(&drain(&mut bob_rx), "room_created").is_empty());
}

#[tokio::test]
async fn room_creation_requires_registration_and_valid_name() {
    let hub = new_hub().await;
    let (anon, _rx) = connect(&hub, "c1").await;

    let err = hub.create_room(&anon, "general", true).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotRegistered);

    register(&hub, &anon, "alice", "fpA").await;
    let err = hub.create_room(&anon, "", true).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRoomName);

    let err = hub.create_room(&anon, &"x".repeat(51), true).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRoomName);

    // 50 characters is accepted.
    let info = hub.create_room(&anon, &"x".repeat(50), true).await.unwrap();
    assert_eq!(info.name.len(), 50);
}

#[tokio::test]
async fn join_notifies_members_and_rejoin_is_silent() {
    let hub = new_hub().await;
    let (alice, mut alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;
    let (bob, _bob_rx) = connect(&hub, "c2").await;
    register(&hub, &bob, "bob", "fpB").await;

    let room = hub.create_room(&alice, "general", true).await.unwrap();
    drain(&mut alice_rx);

    let outcome = hub.join_room(&bob, &room.room_id).await.unwrap();
    assert!(!outcome.rejoined);
    assert_eq!(outcome.members.len(), 2);

    let frames = drain(&mut alice_rx);
    let notices = of_type(&frames, "room_members");
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0]["payload"]["action"], "joined");
    assert_eq!(notices[0]["payload"]["user"]["username"], "bob");
    assert_eq!(notices[0]["payload"]["members"].as_array().unwrap().len(), 2);

    // Rejoining is a silent reconnect: same data back, no broadcast.
    let outcome = hub.join_room(&bob, &room.room_id).await.unwrap();
    assert!(outcome.rejoined);
    assert_eq!(outcome.members.len(), 2);
    assert!(of_type(&drain(&mut alice_rx), "room_members").is_empty());

    let err = hub.join_room(&bob, "no-such-room").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RoomNotFound);
}

#[tokio::test]
async fn leave_notifies_and_keeps_empty_rooms() {
    let hub = new_hub().await;
    let (alice, mut alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;
    let (bob, _bob_rx) = connect(&hub, "c2").await;
    register(&hub, &bob, "bob", "fpB").await;

    let room = hub.create_room(&alice, "general", true).await.unwrap();
    hub.join_room(&bob, &room.room_id).await.unwrap();
    drain(&mut alice_rx);

    hub.leave_room(&bob, &room.room_id).await.unwrap();
    let frames = drain(&mut alice_rx);
    let notices = of_type(&frames, "room_members");
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0]["payload"]["action"], "left");
    assert_eq!(notices[0]["payload"]["members"].as_array().unwrap().len(), 1);

    let err = hub.leave_room(&bob, &room.room_id).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotInRoom);
    let err = hub.leave_room(&bob, "no-such-room").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RoomNotFound);

    // The creator leaving empties the room but does not delete it.
    hub.leave_room(&alice, &room.room_id).await.unwrap();
    let empty = hub.get_room(&room.room_id).await.expect("room must survive");
    assert_eq!(empty.member_count(), 0);
}

#[tokio::test]
async fn join_leave_join_restores_membership() {
    let hub = new_hub().await;
    let (alice, _alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;
    let (bob, _bob_rx) = connect(&hub, "c2").await;
    let bob_reg = register(&hub, &bob, "bob", "fpB").await;

    let room = hub.create_room(&alice, "general", true).await.unwrap();

    hub.join_room(&bob, &room.room_id).await.unwrap();
    hub.leave_room(&bob, &room.room_id).await.unwrap();
    let outcome = hub.join_room(&bob, &room.room_id).await.unwrap();

    assert!(!outcome.rejoined);
    assert_eq!(outcome.members.len(), 2);
    let in_memory = hub.get_room(&room.room_id).await.unwrap();
    assert!(in_memory.has_member(&bob_reg.user_id));
    assert!(bob.is_in_room(&room.room_id));
}

#[tokio::test]
async fn disconnect_preserves_room_membership() {
    let hub = new_hub().await;
    let (alice, _alice_rx) = connect(&hub, "c1").await;
    let alice_reg = register(&hub, &alice, "alice", "fpA").await;
    let (bob, _bob_rx) = connect(&hub, "c2").await;
    register(&hub, &bob, "bob", "fpB").await;

    let room = hub.create_room(&alice, "general", true).await.unwrap();
    hub.join_room(&bob, &room.room_id).await.unwrap();

    hub.detach(&alice).await;

    let survived = hub.get_room(&room.room_id).await.unwrap();
    assert_eq!(survived.member_count(), 2, "offline members stay members");
    assert!(survived.has_member(&alice_reg.user_id));
    assert_eq!(hub.user_list().await.len(), 1);
}

#[tokio::test]
async fn room_list_is_public_plus_own_memberships() {
    let hub = new_hub().await;
    let (alice, _alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;
    let (bob, _bob_rx) = connect(&hub, "c2").await;
    register(&hub, &bob, "bob", "fpB").await;

    hub.create_room(&alice, "town-square", true).await.unwrap();
    hub.create_room(&alice, "hideout", false).await.unwrap();

    let bob_rooms = hub.room_list(&bob).await;
    assert_eq!(bob_rooms.len(), 1);
    assert_eq!(bob_rooms[0].name, "town-square");

    let alice_rooms = hub.room_list(&alice).await;
    assert_eq!(alice_rooms.len(), 2);
}

// ============================================================================
// Messaging
// ============================================================================

#[tokio::test]
async fn direct_messages_reach_online_users_only() {
    let hub = new_hub().await;
    let (alice, _alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;
    let (bob, mut bob_rx) = connect(&hub, "c2").await;
    register(&hub, &bob, "bob", "fpB").await;
    drain(&mut bob_rx);

    hub.send_direct(&alice, "bob", "psst").await.unwrap();
    let frames = drain(&mut bob_rx);
    let dms = of_type(&frames, "direct_message");
    assert_eq!(dms.len(), 1);
    assert_eq!(dms[0]["payload"]["from"], "alice");
    assert_eq!(dms[0]["payload"]["content"], "psst");
    assert!(!dms[0]["payload"]["message_id"].as_str().unwrap().is_empty());

    let err = hub.send_direct(&alice, "nobody", "hello?").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UserNotFound);

    // Offline means unreachable; there is no store-and-forward.
    hub.detach(&bob).await;
    let err = hub.send_direct(&alice, "bob", "gone").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::UserNotFound);

    let (anon, _rx) = connect(&hub, "c3").await;
    let err = hub.send_direct(&anon, "alice", "hi").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotRegistered);
}

#[tokio::test]
async fn room_message_fans_out_and_persists() {
    let hub = new_hub().await;
    let (alice, mut alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;
    let (bob, mut bob_rx) = connect(&hub, "c2").await;
    register(&hub, &bob, "bob", "fpB").await;
    let (carol, mut carol_rx) = connect(&hub, "c3").await;
    register(&hub, &carol, "carol", "fpC").await;

    let room = hub.create_room(&alice, "general", true).await.unwrap();
    hub.join_room(&bob, &room.room_id).await.unwrap();
    hub.join_room(&carol, &room.room_id).await.unwrap();
    drain(&mut alice_rx);
    drain(&mut bob_rx);
    drain(&mut carol_rx);

    hub.send_room_message(&alice, &room.room_id, "hi").await.unwrap();

    let mut message_ids = Vec::new();
    for rx in [&mut alice_rx, &mut bob_rx, &mut carol_rx] {
        let frames = drain(rx);
        let msgs = of_type(&frames, "room_message");
        assert_eq!(msgs.len(), 1, "every member gets the message exactly once");
        assert_eq!(msgs[0]["payload"]["content"], "hi");
        assert_eq!(msgs[0]["payload"]["from"], "alice");
        message_ids.push(msgs[0]["payload"]["message_id"].as_str().unwrap().to_owned());
    }
    assert_eq!(message_ids[0], message_ids[1]);
    assert_eq!(message_ids[1], message_ids[2]);

    // The message is durable and carries the same authoritative id.
    let history = hub
        .room_history(&bob, &room.room_id, Some(10), None)
        .await
        .unwrap();
    assert_eq!(history.messages.len(), 1);
    assert_eq!(history.messages[0].content, "hi");
    assert_eq!(history.messages[0].message_id, message_ids[0]);
    assert!(!history.has_more);
}

#[tokio::test]
async fn room_message_authorization() {
    let hub = new_hub().await;
    let (alice, _alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;
    let (dave, _dave_rx) = connect(&hub, "c2").await;
    register(&hub, &dave, "dave", "fpD").await;
    let (anon, _anon_rx) = connect(&hub, "c3").await;

    let room = hub.create_room(&alice, "general", true).await.unwrap();

    let err = hub.send_room_message(&anon, &room.room_id, "hi").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotRegistered);

    let err = hub.send_room_message(&dave, &room.room_id, "hi").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotInRoom);

    let err = hub.send_room_message(&alice, "no-such-room", "hi").await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RoomNotFound);
}

// ============================================================================
// History
// ============================================================================

#[tokio::test]
async fn history_limit_is_normalized_and_pages_oldest_first() {
    let hub = new_hub().await;
    let (alice, mut alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;

    let room = hub.create_room(&alice, "general", true).await.unwrap();
    for i in 0..120 {
        hub.send_room_message(&alice, &room.room_id, &format!("msg-{i}"))
            .await
            .unwrap();
        // Keep the echo queue from overflowing during seeding.
        if i % 100 == 0 {
            drain(&mut alice_rx);
        }
    }

    // limit=0 normalizes to the default of 50.
    let page = hub.room_history(&alice, &room.room_id, Some(0), None).await.unwrap();
    assert_eq!(page.messages.len(), 50);
    assert!(page.has_more);

    // limit=1000 clamps to 100.
    let page = hub
        .room_history(&alice, &room.room_id, Some(1000), None)
        .await
        .unwrap();
    assert_eq!(page.messages.len(), 100);
    assert!(page.has_more);

    // Missing limit defaults to 50; messages come back oldest first.
    let page = hub.room_history(&alice, &room.room_id, None, None).await.unwrap();
    assert_eq!(page.messages.len(), 50);
    for pair in page.messages.windows(2) {
        assert!(pair[0].timestamp <= pair[1].timestamp);
    }

    // A small page with no older survivors reports has_more=false.
    let oldest = page.messages[0].timestamp;
    let page = hub
        .room_history(&alice, &room.room_id, Some(100), Some(oldest))
        .await
        .unwrap();
    assert!(page.messages.len() <= 100);
    for msg in &page.messages {
        assert!(msg.timestamp < oldest);
    }
}

#[tokio::test]
async fn history_requires_membership() {
    let hub = new_hub().await;
    let (alice, _alice_rx) = connect(&hub, "c1").await;
    register(&hub, &alice, "alice", "fpA").await;
    let (dave, _dave_rx) = connect(&hub, "c2").await;
    register(&hub, &dave, "dave", "fpD").await;

    let room = hub.create_room(&alice, "general", true).await.unwrap();

    let err = hub
        .room_history(&dave, &room.room_id, None, None)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::NotInRoom);

    let err = hub.room_history(&alice, "no-such-room", None, None).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::RoomNotFound);
}

// ============================================================================
// Startup hydration
// ============================================================================

#[tokio::test]
async fn rooms_and_membership_survive_a_restart() {
    let pool = store::init("sqlite::memory:", 1, 1).await.unwrap();
    let users = UserStore::new(pool.clone());
    let rooms = RoomStore::new(pool.clone());
    let members = MemberStore::new(pool.clone());
    let messages = MessageStore::new(pool.clone());

    let alice = users
        .create("alice", &haven_shared::recovery::hash_value("fpA"), "rec")
        .await
        .unwrap();
    let bob = users.create("bob", "fp2", "rec2").await.unwrap();
    let room = rooms.create("general", &alice.id, "alice", true).await.unwrap();
    members.add(&room.id, &alice.id, "alice").await.unwrap();
    members.add(&room.id, &bob.id, "bob").await.unwrap();

    // A second hub over the same pool stands in for a restarted process.
    let hub = Arc::new(Hub::new(users, rooms, members, messages));
    let loaded = hub.load_rooms().await.unwrap();
    assert_eq!(loaded, 1);

    let hydrated = hub.get_room(&room.id).await.expect("room must be rehydrated");
    assert_eq!(hydrated.member_count(), 2);
    assert!(hydrated.has_member(&alice.id));
    assert!(hydrated.has_member(&bob.id));

    // A reconnecting member is recognized as a silent rejoin.
    let (alice_session, _rx) = connect(&hub, "c1").await;
    let reg = hub.register(&alice_session, "alice", "fpA", "").await.unwrap();
    assert_eq!(reg.user_id, alice.id);
    let outcome = hub.join_room(&alice_session, &room.id).await.unwrap();
    assert!(outcome.rejoined, "a hydrated member rejoins silently");
}
