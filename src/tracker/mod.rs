//! Tracker client module
//!
//! Supplies the initial peer endpoint list for a transfer.

#[cfg(feature = "http-tracker")]
pub mod http;

use std::net::SocketAddr;

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

#[cfg(feature = "http-tracker")]
pub use http::HttpTracker;

/// Parameters of a `started` announce
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: u64,
    pub downloaded: u64,
    pub left: u64,
}

/// Tracker reply
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnnounceResponse {
    /// Suggested re-announce interval in seconds
    pub interval: Option<u64>,
    pub endpoints: Vec<SocketAddr>,
}

/// Source of peer endpoints for a torrent
#[async_trait]
pub trait TrackerClient: Send + Sync {
    /// Announce that the transfer started and return candidate peers
    async fn announce_start(&self, request: &AnnounceRequest) -> Result<AnnounceResponse>;
}

/// Tracker that always answers with a fixed endpoint list
#[derive(Debug, Clone, Default)]
pub struct StaticTracker {
    endpoints: Vec<SocketAddr>,
}

impl StaticTracker {
    pub fn new(endpoints: Vec<SocketAddr>) -> Self {
        Self { endpoints }
    }
}

#[async_trait]
impl TrackerClient for StaticTracker {
    async fn announce_start(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        debug!(
            "Static announce for {}: {} endpoints",
            hex::encode(request.info_hash),
            self.endpoints.len()
        );
        Ok(AnnounceResponse {
            interval: None,
            endpoints: self.endpoints.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_static_tracker() {
        let endpoints: Vec<SocketAddr> = vec!["127.0.0.1:6881".parse().unwrap(), "10.0.0.2:51413".parse().unwrap()];
        let tracker = StaticTracker::new(endpoints.clone());
        let request = AnnounceRequest {
            info_hash: [0u8; 20],
            peer_id: [1u8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
        };
        let response = tracker.announce_start(&request).await.unwrap();
        assert_eq!(response.endpoints, endpoints);
    }
}
