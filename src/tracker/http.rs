//! HTTP tracker client
//!
//! Announces over HTTP(S) and decodes the bencoded reply, accepting both the
//! compact 6-byte peer format and the dictionary list format.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_bencode::value::Value;
use tracing::{debug, info, warn};
use url::Url;

use super::{AnnounceRequest, AnnounceResponse, TrackerClient};
use crate::error::TorrentError;

#[derive(Debug, Deserialize)]
struct RawAnnounce {
    #[serde(default, rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(default)]
    interval: Option<i64>,
    #[serde(default)]
    peers: Option<Value>,
}

/// Tracker reached over HTTP, trying each announce URL in order
#[derive(Debug, Clone)]
pub struct HttpTracker {
    urls: Vec<String>,
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new(urls: Vec<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .map_err(|e| TorrentError::tracker_error(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { urls, client })
    }

    fn announce_url(base: &str, request: &AnnounceRequest) -> Result<String> {
        let url = Url::parse(base).map_err(|e| TorrentError::tracker_error_with_url(e.to_string(), base))?;
        let separator = if url.query().is_some() { '&' } else { '?' };
        Ok(format!(
            "{}{}info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1&event=started",
            url,
            separator,
            urlencoding::encode_binary(&request.info_hash),
            urlencoding::encode_binary(&request.peer_id),
            request.port,
            request.uploaded,
            request.downloaded,
            request.left
        ))
    }

    /// Decode a bencoded announce reply
    pub fn parse_response(body: &[u8]) -> Result<AnnounceResponse> {
        let raw: RawAnnounce = serde_bencode::from_bytes(body).map_err(TorrentError::from)?;
        if let Some(reason) = raw.failure_reason {
            return Err(TorrentError::tracker_error(reason).into());
        }

        let endpoints = match raw.peers {
            Some(Value::Bytes(data)) => data
                .chunks_exact(6)
                .map(|chunk| {
                    let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                    SocketAddr::new(IpAddr::V4(ip), u16::from_be_bytes([chunk[4], chunk[5]]))
                })
                .collect(),
            Some(Value::List(list)) => list.iter().filter_map(Self::dict_peer).collect(),
            _ => Vec::new(),
        };

        Ok(AnnounceResponse {
            interval: raw.interval.and_then(|i| u64::try_from(i).ok()),
            endpoints,
        })
    }

    fn dict_peer(value: &Value) -> Option<SocketAddr> {
        let Value::Dict(dict) = value else {
            return None;
        };
        let ip = match dict.get(b"ip".as_slice())? {
            Value::Bytes(bytes) => std::str::from_utf8(bytes).ok()?.parse::<IpAddr>().ok()?,
            _ => return None,
        };
        let port = match dict.get(b"port".as_slice())? {
            Value::Int(port) => u16::try_from(*port).ok()?,
            _ => return None,
        };
        Some(SocketAddr::new(ip, port))
    }
}

#[async_trait]
impl TrackerClient for HttpTracker {
    async fn announce_start(&self, request: &AnnounceRequest) -> Result<AnnounceResponse> {
        let mut last_error = None;

        for base in &self.urls {
            if !base.starts_with("http") {
                debug!("Skipping non-HTTP announce URL: {}", base);
                continue;
            }

            info!("Announcing to tracker: {}", base);
            let url = Self::announce_url(base, request)?;
            let result = async {
                let response = self.client.get(&url).send().await?.error_for_status()?;
                response.bytes().await
            }
            .await;

            match result {
                Ok(body) => match Self::parse_response(&body) {
                    Ok(response) => {
                        info!("Tracker {} returned {} peers", base, response.endpoints.len());
                        return Ok(response);
                    }
                    Err(e) => {
                        warn!("Tracker {} sent an unusable reply: {}", base, e);
                        last_error = Some(TorrentError::tracker_error_with_url(e.to_string(), base.as_str()));
                    }
                },
                Err(e) => {
                    warn!("Announce to {} failed: {}", base, e);
                    last_error = Some(TorrentError::tracker_error_with_url(e.to_string(), base.as_str()));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| TorrentError::tracker_error("No usable announce URL"))
            .into())
    }
}
