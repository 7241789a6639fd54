//! Torrent metadata
//!
//! The metadata object the transfer is built from: piece layout, sizes,
//! info hash and announce URLs.

use anyhow::Result;
use sha1::{Digest, Sha1};

use crate::error::TorrentError;

/// A file in the torrent, path relative to the torrent root
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TorrentFile {
    pub path: Vec<String>,
    pub length: u64,
}

/// Parsed torrent metadata
#[derive(Debug, Clone)]
pub struct TorrentInfo {
    /// Primary tracker announce URL
    pub announce: String,
    /// Additional announce URLs, tier order flattened
    pub announce_list: Vec<String>,
    /// SHA1 hash of the bencoded info dictionary
    pub info_hash: [u8; 20],
    /// Size of each piece in bytes
    pub piece_length: u64,
    /// Per-piece SHA1 hashes
    pub pieces: Vec<[u8; 20]>,
    pub name: String,
    /// Single file size (None for multi-file torrents)
    pub length: Option<u64>,
    /// Files in multi-file torrents (None for single-file torrents)
    pub files: Option<Vec<TorrentFile>>,
}

impl TorrentInfo {
    /// Total size of all files
    pub fn total_size(&self) -> u64 {
        match (&self.length, &self.files) {
            (Some(length), _) => *length,
            (None, Some(files)) => files.iter().map(|f| f.length).sum(),
            (None, None) => 0,
        }
    }

    pub fn piece_count(&self) -> usize {
        self.pieces.len()
    }

    /// Per-file lengths; a single-file torrent yields one entry named after the torrent
    pub fn file_lengths(&self) -> Vec<TorrentFile> {
        match (&self.files, self.length) {
            (Some(files), _) => files.clone(),
            (None, Some(length)) => vec![TorrentFile {
                path: vec![self.name.clone()],
                length,
            }],
            (None, None) => Vec::new(),
        }
    }

    /// Every announce URL, primary first, without duplicates
    pub fn announce_urls(&self) -> Vec<String> {
        let mut urls: Vec<String> = Vec::new();
        for url in std::iter::once(&self.announce).chain(self.announce_list.iter()) {
            if !url.is_empty() && !urls.contains(url) {
                urls.push(url.clone());
            }
        }
        urls
    }

    pub fn info_hash_hex(&self) -> String {
        hex::encode(self.info_hash)
    }

    /// SHA1 of the bencoded info dictionary
    pub fn generate_info_hash(info_dict_bytes: &[u8]) -> [u8; 20] {
        Sha1::digest(info_dict_bytes).into()
    }

    /// Split the concatenated `pieces` field into 20-byte hashes
    pub fn parse_piece_hashes(pieces_bytes: &[u8]) -> Result<Vec<[u8; 20]>> {
        if pieces_bytes.len() % 20 != 0 {
            return Err(TorrentError::parse_error_with_source(
                "Pieces field length must be a multiple of 20",
                format!("got {} bytes", pieces_bytes.len()),
            )
            .into());
        }

        Ok(pieces_bytes
            .chunks_exact(20)
            .map(|chunk| {
                let mut hash = [0u8; 20];
                hash.copy_from_slice(chunk);
                hash
            })
            .collect())
    }

    /// Byte range `[start, end)` covered by a piece
    pub fn piece_range(&self, index: usize) -> Option<(u64, u64)> {
        if index >= self.pieces.len() {
            return None;
        }
        let start = index as u64 * self.piece_length;
        let end = (start + self.piece_length).min(self.total_size());
        Some((start, end))
    }
}
