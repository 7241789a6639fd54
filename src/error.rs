//! Error types for the transfer engine
//!
//! Covers metadata validation, wire protocol violations, transport failures
//! and misuse of the transfer lifecycle.

use std::fmt;

/// Error type for transfer operations
#[derive(Debug, Clone)]
pub enum TorrentError {
    /// Torrent file parsing errors
    ParseError {
        message: String,
        source: Option<String>,
    },

    /// BitTorrent protocol errors
    ProtocolError {
        message: String,
        source: Option<String>,
    },

    /// A wire message did not have its declared length
    InvalidLength {
        expected: usize,
        actual: usize,
    },

    /// Torrent sizes that cannot describe a transfer
    InvalidMetadata {
        message: String,
        field: Option<String>,
    },

    /// The transfer was started while already running
    AlreadyRunning,

    /// Peer connection errors
    PeerError {
        message: String,
        peer: Option<String>,
        source: Option<String>,
    },

    /// Network errors
    NetworkError {
        message: String,
        address: Option<String>,
        source: Option<String>,
    },

    /// Tracker announce errors
    TrackerError {
        message: String,
        url: Option<String>,
    },

    /// Configuration errors
    ConfigError {
        message: String,
        field: Option<String>,
    },
}

impl TorrentError {
    /// Create a new ParseError
    pub fn parse_error(message: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ParseError with source
    pub fn parse_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ParseError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new ProtocolError
    pub fn protocol_error(message: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: None,
        }
    }

    /// Create a new ProtocolError with source
    pub fn protocol_error_with_source(message: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::ProtocolError {
            message: message.into(),
            source: Some(source.into()),
        }
    }

    /// Create a new InvalidLength error
    pub fn invalid_length(expected: usize, actual: usize) -> Self {
        TorrentError::InvalidLength { expected, actual }
    }

    /// Create a new InvalidMetadata error
    pub fn invalid_metadata(message: impl Into<String>) -> Self {
        TorrentError::InvalidMetadata {
            message: message.into(),
            field: None,
        }
    }

    /// Create a new InvalidMetadata error naming the offending field
    pub fn invalid_metadata_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::InvalidMetadata {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Create a new PeerError with peer address
    pub fn peer_error_with_peer(message: impl Into<String>, peer: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: None,
        }
    }

    /// Create a new PeerError with peer and source
    pub fn peer_error_full(message: impl Into<String>, peer: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::PeerError {
            message: message.into(),
            peer: Some(peer.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new NetworkError
    pub fn network_error(message: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: None,
            source: None,
        }
    }

    /// Create a new NetworkError with address and source
    pub fn network_error_full(message: impl Into<String>, address: impl Into<String>, source: impl Into<String>) -> Self {
        TorrentError::NetworkError {
            message: message.into(),
            address: Some(address.into()),
            source: Some(source.into()),
        }
    }

    /// Create a new TrackerError
    pub fn tracker_error(message: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: None,
        }
    }

    /// Create a new TrackerError for a specific announce URL
    pub fn tracker_error_with_url(message: impl Into<String>, url: impl Into<String>) -> Self {
        TorrentError::TrackerError {
            message: message.into(),
            url: Some(url.into()),
        }
    }

    /// Create a new ConfigError with field
    pub fn config_error_with_field(message: impl Into<String>, field: impl Into<String>) -> Self {
        TorrentError::ConfigError {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    /// Whether the error only concerns a single peer connection
    pub fn is_peer_scoped(&self) -> bool {
        matches!(
            self,
            TorrentError::ProtocolError { .. }
                | TorrentError::InvalidLength { .. }
                | TorrentError::PeerError { .. }
                | TorrentError::NetworkError { .. }
        )
    }
}

impl fmt::Display for TorrentError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TorrentError::ParseError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Parse error: {} (source: {})", message, src)
                } else {
                    write!(f, "Parse error: {}", message)
                }
            }
            TorrentError::ProtocolError { message, source } => {
                if let Some(src) = source {
                    write!(f, "Protocol error: {} (source: {})", message, src)
                } else {
                    write!(f, "Protocol error: {}", message)
                }
            }
            TorrentError::InvalidLength { expected, actual } => {
                write!(f, "Invalid message length: expected {} bytes, got {}", expected, actual)
            }
            TorrentError::InvalidMetadata { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Invalid metadata: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Invalid metadata: {}", message)
                }
            }
            TorrentError::AlreadyRunning => write!(f, "Transfer is already running"),
            TorrentError::PeerError { message, peer, source } => {
                match (peer, source) {
                    (Some(p), Some(s)) => write!(f, "Peer error: {} (peer: {}, source: {})", message, p, s),
                    (Some(p), None) => write!(f, "Peer error: {} (peer: {})", message, p),
                    (None, Some(s)) => write!(f, "Peer error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Peer error: {}", message),
                }
            }
            TorrentError::NetworkError { message, address, source } => {
                match (address, source) {
                    (Some(a), Some(s)) => write!(f, "Network error: {} (address: {}, source: {})", message, a, s),
                    (Some(a), None) => write!(f, "Network error: {} (address: {})", message, a),
                    (None, Some(s)) => write!(f, "Network error: {} (source: {})", message, s),
                    (None, None) => write!(f, "Network error: {}", message),
                }
            }
            TorrentError::TrackerError { message, url } => {
                if let Some(url) = url {
                    write!(f, "Tracker error: {} (url: {})", message, url)
                } else {
                    write!(f, "Tracker error: {}", message)
                }
            }
            TorrentError::ConfigError { message, field } => {
                if let Some(field_val) = field {
                    write!(f, "Config error: {} (field: {})", message, field_val)
                } else {
                    write!(f, "Config error: {}", message)
                }
            }
        }
    }
}

impl std::error::Error for TorrentError {}

impl From<std::io::Error> for TorrentError {
    fn from(err: std::io::Error) -> Self {
        TorrentError::network_error_full(err.to_string(), "unknown".to_string(), err.kind().to_string())
    }
}

impl From<serde_bencode::Error> for TorrentError {
    fn from(err: serde_bencode::Error) -> Self {
        TorrentError::parse_error_with_source("Failed to parse bencode data", err.to_string())
    }
}

impl From<serde_json::Error> for TorrentError {
    fn from(err: serde_json::Error) -> Self {
        TorrentError::ConfigError {
            message: format!("Failed to parse JSON data: {}", err),
            field: None,
        }
    }
}

impl From<std::net::AddrParseError> for TorrentError {
    fn from(err: std::net::AddrParseError) -> Self {
        TorrentError::network_error_full("Failed to parse address", "unknown".to_string(), err.to_string())
    }
}

impl From<tokio::time::error::Elapsed> for TorrentError {
    fn from(_err: tokio::time::error::Elapsed) -> Self {
        TorrentError::network_error("Operation timed out")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_error_with_source() {
        let err = TorrentError::parse_error_with_source("Invalid torrent file", "bencode error");
        assert!(err.to_string().contains("Parse error"));
        assert!(err.to_string().contains("Invalid torrent file"));
        assert!(err.to_string().contains("bencode error"));
    }

    #[test]
    fn test_invalid_length() {
        let err = TorrentError::invalid_length(68, 67);
        assert_eq!(err.to_string(), "Invalid message length: expected 68 bytes, got 67");
    }

    #[test]
    fn test_invalid_metadata_with_field() {
        let err = TorrentError::invalid_metadata_with_field("must be positive", "piece_length");
        assert!(err.to_string().contains("Invalid metadata"));
        assert!(err.to_string().contains("piece_length"));
    }

    #[test]
    fn test_already_running() {
        let err = TorrentError::AlreadyRunning;
        assert_eq!(err.to_string(), "Transfer is already running");
        assert!(!err.is_peer_scoped());
    }

    #[test]
    fn test_peer_error_with_peer() {
        let err = TorrentError::peer_error_with_peer("Connection failed", "127.0.0.1:6881");
        assert!(err.to_string().contains("Peer error"));
        assert!(err.to_string().contains("127.0.0.1:6881"));
        assert!(err.is_peer_scoped());
    }

    #[test]
    fn test_tracker_error_with_url() {
        let err = TorrentError::tracker_error_with_url("no peers", "http://tracker.example.com/announce");
        assert!(err.to_string().contains("Tracker error"));
        assert!(err.to_string().contains("tracker.example.com"));
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "refused");
        let err: TorrentError = io_err.into();
        assert!(matches!(err, TorrentError::NetworkError { .. }));
    }

    #[test]
    fn test_from_addr_parse_error() {
        let addr_err = "invalid:address".parse::<std::net::SocketAddr>().unwrap_err();
        let err: TorrentError = addr_err.into();
        assert!(matches!(err, TorrentError::NetworkError { .. }));
    }

    #[test]
    fn test_downcast_through_anyhow() {
        let err: anyhow::Error = TorrentError::AlreadyRunning.into();
        assert!(matches!(err.downcast_ref::<TorrentError>(), Some(TorrentError::AlreadyRunning)));
    }
}
