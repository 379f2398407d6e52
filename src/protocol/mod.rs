//! Peer wire protocol: handshake, messages and framing.

pub mod handshake;
pub mod message;
pub mod wire;

pub use handshake::{Handshake, PROTOCOL_STRING};
pub use message::{Message, MessageId};
