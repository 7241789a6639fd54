//! torrent-transfer
//!
//! Block selection and peer connection management for a BitTorrent
//! transfer: which blocks to ask for next, and the handshake lifecycle of
//! every inbound and outbound peer connection.

pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod peer;
pub mod protocol;
pub mod strategy;
pub mod torrent;
pub mod tracker;

pub use config::TransferConfig;
pub use error::TorrentError;
pub use events::{EventBus, TransferEvent};

pub use peer::{ConnectionState, Peer, PeerConnection, PeerManager, PeerRegistry, PeerStats};
pub use protocol::{BitTorrentWire, Handshake, Message, MessageId, WireProtocol};
pub use strategy::{Bitfield, Block, BlockAddressSet, BlockLayout, BlockSelector};
pub use torrent::{TorrentFile, TorrentInfo, TorrentParser};
pub use tracker::{AnnounceRequest, AnnounceResponse, StaticTracker, TrackerClient};

#[cfg(feature = "http-tracker")]
pub use tracker::HttpTracker;

pub use cli::CliArgs;
