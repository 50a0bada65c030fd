//! Haven relay server
//!
//! A long-lived broker for real-time text messages over WebSocket:
//! the hub coordinates live sessions, rooms and broadcasts; SQLite-backed
//! stores keep users, rooms, membership and history across restarts.

pub mod config;
pub mod hub;
pub mod room;
pub mod routing;
pub mod session;
pub mod store;
pub mod ws;
