//! Torrent file loader
//!
//! Decodes a bencoded `.torrent` file into [`TorrentInfo`].

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::Result;
use serde::Deserialize;
use serde_bencode::value::Value;
use serde_bytes::ByteBuf;
use tracing::{debug, error, info};

use crate::error::TorrentError;
use crate::torrent::info::{TorrentFile, TorrentInfo};

#[derive(Debug, Deserialize)]
struct RawTorrent {
    #[serde(default)]
    announce: Option<String>,
    #[serde(default, rename = "announce-list")]
    announce_list: Option<Vec<Vec<String>>>,
    info: RawInfo,
}

#[derive(Debug, Deserialize)]
struct RawInfo {
    name: String,
    #[serde(rename = "piece length")]
    piece_length: i64,
    pieces: ByteBuf,
    #[serde(default)]
    length: Option<i64>,
    #[serde(default)]
    files: Option<Vec<RawFile>>,
}

#[derive(Debug, Deserialize)]
struct RawFile {
    length: i64,
    path: Vec<String>,
}

/// Parser for .torrent files
pub struct TorrentParser;

impl TorrentParser {
    /// Parse a .torrent file from bytes
    pub fn parse_bytes(data: &[u8]) -> Result<TorrentInfo> {
        debug!("Parsing torrent file from {} bytes", data.len());

        let raw: RawTorrent = serde_bencode::from_bytes(data).map_err(TorrentError::from)?;

        // The info hash covers the info dictionary exactly as encoded
        let root: BTreeMap<String, Value> = serde_bencode::from_bytes(data).map_err(TorrentError::from)?;
        let info_value = root
            .get("info")
            .ok_or_else(|| TorrentError::parse_error("Missing info dictionary"))?;
        let info_bytes = serde_bencode::to_bytes(info_value).map_err(TorrentError::from)?;
        let info_hash = TorrentInfo::generate_info_hash(&info_bytes);

        if raw.info.piece_length <= 0 {
            return Err(TorrentError::parse_error_with_source(
                "Invalid piece length",
                raw.info.piece_length.to_string(),
            )
            .into());
        }

        let files = match raw.info.files {
            Some(files) => Some(
                files
                    .into_iter()
                    .map(|f| {
                        u64::try_from(f.length)
                            .map(|length| TorrentFile { path: f.path, length })
                            .map_err(|_| TorrentError::parse_error_with_source("Negative file length", f.length.to_string()))
                    })
                    .collect::<std::result::Result<Vec<_>, _>>()?,
            ),
            None => None,
        };

        let length = raw
            .info
            .length
            .map(|l| u64::try_from(l).map_err(|_| TorrentError::parse_error_with_source("Negative length", l.to_string())))
            .transpose()?;

        if length.is_none() && files.is_none() {
            return Err(TorrentError::parse_error("Torrent has neither length nor files").into());
        }

        let info = TorrentInfo {
            announce: raw.announce.unwrap_or_default(),
            announce_list: raw.announce_list.unwrap_or_default().into_iter().flatten().collect(),
            info_hash,
            piece_length: raw.info.piece_length as u64,
            pieces: TorrentInfo::parse_piece_hashes(&raw.info.pieces)?,
            name: raw.info.name,
            length,
            files,
        };

        info!(
            "Parsed torrent '{}' ({} bytes, {} pieces, info hash {})",
            info.name,
            info.total_size(),
            info.piece_count(),
            info.info_hash_hex()
        );
        Ok(info)
    }

    /// Parse a .torrent file from a file path
    pub fn parse_file(path: &Path) -> Result<TorrentInfo> {
        info!("Loading torrent file from: {}", path.display());

        let data = std::fs::read(path).map_err(|e| {
            error!("Failed to read torrent file '{}': {}", path.display(), e);
            TorrentError::parse_error_with_source(format!("Failed to read {}", path.display()), e.to_string())
        })?;

        Self::parse_bytes(&data)
    }
}
