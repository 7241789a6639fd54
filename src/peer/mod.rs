//! Peer management module
//!
//! Peer state, the handshaked-peer registry, per-connection tasks and the
//! manager that owns a transfer's lifecycle.

pub mod connection;
pub mod manager;
pub mod registry;
pub mod state;

// Re-export main types
pub use connection::{ConnectionContext, PeerConnection};
pub use manager::PeerManager;
pub use registry::PeerRegistry;
pub use state::{ConnectionState, Direction, Peer, PeerStats};
