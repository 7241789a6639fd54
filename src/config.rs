//! Transfer configuration
//!
//! Tunables for block selection and peer connections. Loadable from a JSON
//! file; every field has a default.

use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::TorrentError;
use crate::protocol::Handshake;
use crate::strategy::{DEFAULT_BLOCK_SIZE, DEFAULT_SELECTION_ATTEMPTS};

/// Configuration for one transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Listening port for inbound peers (0 picks an ephemeral port)
    pub listen_port: u16,
    /// Block size requested from peers
    pub block_size: u32,
    /// Random draws before block selection ignores the peer's bitfield
    pub max_selection_attempts: u32,
    /// Outstanding block requests per active peer
    pub max_pending_requests: usize,
    /// Outbound connect timeout in seconds
    pub connect_timeout_secs: u64,
    /// Buffered notifications per subscriber
    pub event_capacity: usize,
    /// Local peer id as 40 hex characters; generated when absent
    pub peer_id: Option<String>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            listen_port: 6881,
            block_size: DEFAULT_BLOCK_SIZE,
            max_selection_attempts: DEFAULT_SELECTION_ATTEMPTS,
            max_pending_requests: 5,
            connect_timeout_secs: 10,
            event_capacity: 256,
            peer_id: None,
        }
    }
}

impl TransferConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> Result<Self> {
        info!("Loading configuration from: {}", path.display());
        let data = std::fs::read_to_string(path).map_err(|e| {
            TorrentError::config_error_with_field(format!("Failed to read {}: {}", path.display(), e), "path")
        })?;
        let config: Self = serde_json::from_str(&data).map_err(TorrentError::from)?;
        debug!("Loaded configuration: {:?}", config);
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.block_size == 0 {
            return Err(TorrentError::config_error_with_field("block_size must be positive", "block_size").into());
        }
        if self.max_selection_attempts == 0 {
            return Err(TorrentError::config_error_with_field(
                "max_selection_attempts must be at least 1",
                "max_selection_attempts",
            )
            .into());
        }
        if self.max_pending_requests == 0 {
            return Err(TorrentError::config_error_with_field(
                "max_pending_requests must be at least 1",
                "max_pending_requests",
            )
            .into());
        }
        if self.event_capacity == 0 {
            return Err(TorrentError::config_error_with_field("event_capacity must be at least 1", "event_capacity").into());
        }
        if let Some(peer_id) = &self.peer_id {
            Self::decode_peer_id(peer_id)?;
        }
        Ok(())
    }

    /// Configured peer id, or a freshly generated one
    pub fn local_peer_id(&self) -> Result<[u8; 20]> {
        match &self.peer_id {
            Some(peer_id) => Self::decode_peer_id(peer_id),
            None => Ok(Handshake::generate_peer_id()),
        }
    }

    /// Address the listener binds to
    pub fn listen_addr(&self) -> String {
        format!("0.0.0.0:{}", self.listen_port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    fn decode_peer_id(peer_id: &str) -> Result<[u8; 20]> {
        let bytes = hex::decode(peer_id)
            .map_err(|e| TorrentError::config_error_with_field(format!("peer_id is not hex: {}", e), "peer_id"))?;
        <[u8; 20]>::try_from(bytes.as_slice()).map_err(|_| {
            TorrentError::config_error_with_field(format!("peer_id must be 20 bytes, got {}", bytes.len()), "peer_id")
                .into()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = TransferConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.block_size, 16384);
        assert_eq!(config.max_selection_attempts, 10);
        assert_eq!(config.listen_addr(), "0.0.0.0:6881");
    }

    #[test]
    fn test_validate_rejects_zero_block_size() {
        let config = TransferConfig { block_size: 0, ..Default::default() };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("block_size"));
    }

    #[test]
    fn test_validate_rejects_bad_peer_id() {
        let config = TransferConfig { peer_id: Some("abcd".to_string()), ..Default::default() };
        assert!(config.validate().is_err());
        let config = TransferConfig { peer_id: Some("zz".repeat(20)), ..Default::default() };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_configured_peer_id() {
        let config = TransferConfig { peer_id: Some("01".repeat(20)), ..Default::default() };
        assert_eq!(config.local_peer_id().unwrap(), [1u8; 20]);
        assert_ne!(TransferConfig::default().local_peer_id().unwrap(), [0u8; 20]);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config: TransferConfig = serde_json::from_str(r#"{"listen_port": 0, "block_size": 4}"#).unwrap();
        assert_eq!(config.listen_port, 0);
        assert_eq!(config.block_size, 4);
        assert_eq!(config.max_pending_requests, 5);
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("torrent-transfer-config-{}.json", std::process::id()));
        std::fs::write(&path, r#"{"max_selection_attempts": 3}"#).unwrap();
        let config = TransferConfig::load(&path).unwrap();
        std::fs::remove_file(&path).unwrap();
        assert_eq!(config.max_selection_attempts, 3);
        assert!(TransferConfig::load(&path).is_err());
    }
}
