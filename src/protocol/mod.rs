//! BitTorrent protocol module
//!
//! Wire codec for the handshake and peer messages.

pub mod handshake;
pub mod message;
pub mod wire;

// Re-export main types
pub use handshake::{Handshake, PEER_ID_PREFIX, PROTOCOL_LENGTH, PROTOCOL_STRING};
pub use message::{Message, MessageId};
pub use wire::{BitTorrentWire, WireProtocol, MAX_FRAME_LENGTH};
