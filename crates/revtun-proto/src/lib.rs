//! Revtun wire protocol
//!
//! Message types exchanged between the client and the gateway, and the
//! length-delimited codec that frames them on control, work and visitor
//! connections.

pub mod codec;
pub mod messages;

pub use codec::{read_message, write_message, CodecError, MessageCodec};
pub use messages::*;

/// Protocol version announced at login
pub const PROTOCOL_VERSION: &str = "0.51.3";

/// Maximum encoded message size (16MB)
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024;
