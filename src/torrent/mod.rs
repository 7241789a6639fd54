//! Torrent metadata module
//!
//! The metadata object consumed by the transfer and a `.torrent` loader.

pub mod info;
pub mod parser;

pub use info::{TorrentFile, TorrentInfo};
pub use parser::TorrentParser;
