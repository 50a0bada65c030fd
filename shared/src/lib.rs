//! Haven wire protocol and identity primitives
//!
//! This crate holds everything a Haven peer needs to speak to the relay:
//! the envelope codec with every client/server message type, and the
//! recovery-phrase / digest scheme used to prove account ownership.

#![warn(missing_docs)]
#![warn(unsafe_code)]

pub mod protocol;
pub mod recovery;

pub use protocol::{now_ms, ClientMessage, ErrorCode, ProtocolError, ServerMessage};
pub use recovery::{generate_recovery_phrase, hash_value};
