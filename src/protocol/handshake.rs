//! BitTorrent handshake
//!
//! The fixed 68-byte message two peers exchange before anything else:
//! protocol string length, protocol string, 8 reserved bytes, info hash and
//! peer id.

use anyhow::Result;
use bytes::{BufMut, BytesMut};
use tracing::{debug, info, trace, warn};

use crate::error::TorrentError;

/// BitTorrent protocol identifier string
pub const PROTOCOL_STRING: &str = "BitTorrent protocol";

/// Length of the protocol string
pub const PROTOCOL_LENGTH: u8 = 19;

/// Client prefix of generated peer ids
pub const PEER_ID_PREFIX: &[u8; 8] = b"-RU0001-";

/// BitTorrent handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// Reserved (extension) bytes
    pub reserved: [u8; 8],
    /// Torrent info hash
    pub info_hash: [u8; 20],
    /// Sender's peer id
    pub peer_id: [u8; 20],
}

impl Handshake {
    /// Encoded size in bytes
    pub const MESSAGE_LENGTH: usize = 1 + PROTOCOL_LENGTH as usize + 8 + 20 + 20;

    /// Create a handshake with no extension bits set
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    /// Generate a random peer ID with the client prefix
    pub fn generate_peer_id() -> [u8; 20] {
        let mut peer_id = [0u8; 20];
        peer_id[..8].copy_from_slice(PEER_ID_PREFIX);
        peer_id[8..].copy_from_slice(&rand::random::<[u8; 12]>());
        info!("Generated new peer ID: {}", hex::encode(peer_id));
        peer_id
    }

    /// Write the handshake into `buf` at `offset`, returning the bytes written
    pub fn to_bytes(&self, buf: &mut [u8], offset: usize) -> Result<usize> {
        let end = offset
            .checked_add(Self::MESSAGE_LENGTH)
            .ok_or_else(|| TorrentError::invalid_length(Self::MESSAGE_LENGTH, buf.len().saturating_sub(offset)))?;
        if buf.len() < end {
            return Err(TorrentError::invalid_length(end, buf.len()).into());
        }
        buf[offset..end].copy_from_slice(&self.serialize());
        Ok(Self::MESSAGE_LENGTH)
    }

    /// Read a handshake from `count` bytes of `buf` starting at `offset`
    pub fn from_bytes(buf: &[u8], offset: usize, count: usize) -> Result<Self> {
        if count != Self::MESSAGE_LENGTH {
            return Err(TorrentError::invalid_length(Self::MESSAGE_LENGTH, count).into());
        }
        let end = offset
            .checked_add(count)
            .ok_or_else(|| TorrentError::invalid_length(buf.len().saturating_sub(offset), count))?;
        let data = buf
            .get(offset..end)
            .ok_or_else(|| TorrentError::invalid_length(end, buf.len()))?;

        if data[0] != PROTOCOL_LENGTH {
            return Err(TorrentError::protocol_error_with_source(
                "Invalid protocol length",
                format!("expected {}, got {}", PROTOCOL_LENGTH, data[0]),
            )
            .into());
        }
        if &data[1..20] != PROTOCOL_STRING.as_bytes() {
            return Err(TorrentError::protocol_error("Invalid protocol string").into());
        }

        let mut handshake = Self::new([0u8; 20], [0u8; 20]);
        handshake.reserved.copy_from_slice(&data[20..28]);
        handshake.info_hash.copy_from_slice(&data[28..48]);
        handshake.peer_id.copy_from_slice(&data[48..68]);
        trace!(
            "Decoded handshake: info_hash={}, peer_id={}",
            hex::encode(handshake.info_hash),
            hex::encode(handshake.peer_id)
        );
        Ok(handshake)
    }

    /// Serialize the handshake to a fresh buffer
    pub fn serialize(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(Self::MESSAGE_LENGTH);
        buf.put_u8(PROTOCOL_LENGTH);
        buf.put_slice(PROTOCOL_STRING.as_bytes());
        buf.put_slice(&self.reserved);
        buf.put_slice(&self.info_hash);
        buf.put_slice(&self.peer_id);
        buf.to_vec()
    }

    /// Deserialize a complete handshake
    pub fn deserialize(data: &[u8]) -> Result<Self> {
        Self::from_bytes(data, 0, data.len())
    }

    /// Whether the handshake is for the expected torrent
    pub fn validate(&self, expected_info_hash: &[u8; 20]) -> bool {
        if self.info_hash != *expected_info_hash {
            warn!(
                "Handshake info hash mismatch: expected {}, got {}",
                hex::encode(expected_info_hash),
                hex::encode(self.info_hash)
            );
            return false;
        }
        debug!("Handshake validated for peer {}", hex::encode(self.peer_id));
        true
    }
}
