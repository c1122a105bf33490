//! Tracker client logic for the BitTorrent protocol.
//!
//! This module implements communication with BitTorrent trackers over HTTP:
//! - Announce requests and responses
//! - Peer parsing (compact and non-compact)
//! - Peer ID generation and URL encoding helpers
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use rand::Rng;
use serde::Deserialize;
use thiserror::Error;

use crate::metainfo::Metainfo;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("tracker reported failure: {0}")]
    TrackerFailure(String),

    #[error("compact peers length ({0}) is not a multiple of 6")]
    CompactLengthInvalid(usize),

    #[error("failed to parse announce URL: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("bencode decoding error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),
}

pub type TrackerResult<T> = std::result::Result<T, TrackerError>;

/// The `event` parameter of an announce request, per BEP 3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    Empty,
    Started,
    Stopped,
    Completed,
}

impl Event {
    fn as_str(self) -> &'static str {
        match self {
            Event::Empty => "",
            Event::Started => "started",
            Event::Stopped => "stopped",
            Event::Completed => "completed",
        }
    }
}

/// Parameters for a tracker announce request.
#[derive(Debug)]
pub struct AnnounceRequest {
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
    pub port: u16,
    pub uploaded: i64,
    pub downloaded: i64,
    pub left: i64,
    pub event: Event,
}

/// A peer returned by the tracker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    pub ip: IpAddr,
    pub port: u16,
}

/// Parsed response from a tracker announce.
#[derive(Debug, Clone)]
pub struct AnnounceResponse {
    pub interval: i64,
    pub min_interval: Option<i64>,
    pub peers: Vec<Peer>,
}

#[derive(Debug, Deserialize)]
struct RawResponse {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    #[serde(rename = "warning message")]
    warning_message: Option<String>,
    #[serde(default)]
    interval: i64,
    #[serde(rename = "min interval")]
    min_interval: Option<i64>,
    #[serde(default)]
    peers: RawPeers,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RawPeers {
    Compact(#[serde(with = "serde_bytes")] Vec<u8>),
    NonCompact(Vec<RawPeerDict>),
}

impl Default for RawPeers {
    fn default() -> Self {
        RawPeers::Compact(Vec::new())
    }
}

#[derive(Debug, Deserialize)]
struct RawPeerDict {
    ip: String,
    port: u16,
}

/// A client communicating with a BitTorrent tracker over HTTP.
///
/// Cheap to clone: `reqwest::Client` is itself a handle around a shared
/// connection pool, so a clone reuses it rather than opening a new one.
#[derive(Debug, Clone)]
pub struct Client {
    http: reqwest::Client,
    peer_id: [u8; 20],
    port: u16,
}

impl Client {
    pub fn new(port: u16) -> TrackerResult<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(REQUEST_TIMEOUT)
                .build()?,
            peer_id: generate_peer_id(),
            port,
        })
    }

    pub fn peer_id(&self) -> [u8; 20] {
        self.peer_id
    }

    /// Sends an announce request to the tracker named by `announce_url` and
    /// parses its response.
    #[tracing::instrument(skip(self, metainfo), fields(announce_url), level = "debug")]
    pub async fn announce(
        &self,
        announce_url: &str,
        metainfo: &Metainfo,
        event: Event,
        uploaded: i64,
        downloaded: i64,
    ) -> TrackerResult<AnnounceResponse> {
        let request = AnnounceRequest {
            info_hash: metainfo.info_hash,
            peer_id: self.peer_id,
            port: self.port,
            uploaded,
            downloaded,
            left: metainfo.total_length() - downloaded,
            event,
        };

        let url = build_announce_url(announce_url, &request)?;

        tracing::debug!(%url, "sending announce request");
        let response = self.http.get(url).send().await?;
        let body = response.bytes().await?;
        Self::parse_announce_response(&body)
    }

    fn parse_announce_response(bytes: &[u8]) -> TrackerResult<AnnounceResponse> {
        let raw: RawResponse = serde_bencode::from_bytes(bytes)?;

        if let Some(reason) = raw.failure_reason {
            return Err(TrackerError::TrackerFailure(reason));
        }
        if let Some(warning) = &raw.warning_message {
            tracing::warn!(%warning, "tracker warning");
        }

        let peers = match raw.peers {
            RawPeers::Compact(bytes) => {
                if bytes.len() % 6 != 0 {
                    return Err(TrackerError::CompactLengthInvalid(bytes.len()));
                }
                bytes
                    .chunks_exact(6)
                    .map(|chunk| {
                        let ip = Ipv4Addr::new(chunk[0], chunk[1], chunk[2], chunk[3]);
                        let port = u16::from_be_bytes([chunk[4], chunk[5]]);
                        Peer {
                            ip: IpAddr::V4(ip),
                            port,
                        }
                    })
                    .collect()
            }
            RawPeers::NonCompact(dicts) => dicts
                .into_iter()
                .filter_map(|dict| {
                    dict.ip.parse::<IpAddr>().ok().map(|ip| Peer {
                        ip,
                        port: dict.port,
                    })
                })
                .collect(),
        };

        Ok(AnnounceResponse {
            interval: raw.interval,
            min_interval: raw.min_interval,
            peers,
        })
    }
}

/// Generates a 20-byte peer id: an Azureus-style client prefix followed by
/// random bytes.
fn generate_peer_id() -> [u8; 20] {
    let mut peer_id = [0u8; 20];
    let prefix = b"-RT0001-";
    peer_id[..prefix.len()].copy_from_slice(prefix);
    rand::rng().fill(&mut peer_id[prefix.len()..]);
    peer_id
}

/// Builds the announce GET URL by hand rather than through
/// `Url::query_pairs_mut()`: `info_hash`/`peer_id` are raw bytes already
/// percent-encoded via [`url_encode`], and `append_pair` would
/// form-urlencode that string a second time (every `%` becomes `%25`),
/// corrupting the info-hash a tracker sees. Any query the announce URL
/// already carries (e.g. a tracker passkey) is preserved ahead of ours.
fn build_announce_url(announce_url: &str, request: &AnnounceRequest) -> TrackerResult<url::Url> {
    let mut url = url::Url::parse(announce_url)?;
    let mut query = match url.query() {
        Some(existing) if !existing.is_empty() => format!("{existing}&"),
        _ => String::new(),
    };
    query.push_str(&format!(
        "info_hash={}&peer_id={}&port={}&uploaded={}&downloaded={}&left={}&compact=1",
        url_encode(&request.info_hash),
        url_encode(&request.peer_id),
        request.port,
        request.uploaded,
        request.downloaded,
        request.left,
    ));
    if request.event != Event::Empty {
        query.push_str("&event=");
        query.push_str(request.event.as_str());
    }
    url.set_query(Some(&query));
    Ok(url)
}

/// URL-encodes a byte slice per RFC 3986, leaving unreserved characters
/// (`a-z A-Z 0-9 - . _ ~`) untouched and percent-encoding everything else.
/// Used for `info_hash` and `peer_id`, which are raw bytes rather than text.
fn url_encode(bytes: &[u8]) -> String {
    let mut encoded = String::with_capacity(bytes.len() * 3);
    for &byte in bytes {
        match byte {
            b'a'..=b'z' | b'A'..=b'Z' | b'0'..=b'9' | b'-' | b'.' | b'_' | b'~' => {
                encoded.push(byte as char);
            }
            _ => {
                encoded.push_str(&format!("%{:02X}", byte));
            }
        }
    }
    encoded
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn url_encodes_unreserved_and_escapes_rest() {
        assert_eq!(url_encode(b"abc-._~"), "abc-._~");
        assert_eq!(url_encode(&[0u8, 255u8]), "%00%FF");
    }

    #[test]
    fn announce_url_single_encodes_info_hash_and_peer_id() {
        let request = AnnounceRequest {
            info_hash: [0xD8; 20],
            peer_id: [0xE8; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 100,
            event: Event::Empty,
        };
        let url = build_announce_url("http://tracker.example/announce", &request).unwrap();
        let query = url.query().unwrap();
        assert!(query.contains("info_hash=%D8%D8"), "query was: {query}");
        assert!(query.contains("peer_id=%E8%E8"), "query was: {query}");
        // a form-urlencoding bug would double-encode the leading '%' into '%25'
        assert!(!query.contains("%25"), "query was: {query}");
    }

    #[test]
    fn announce_url_preserves_existing_query_and_appends_event() {
        let request = AnnounceRequest {
            info_hash: [1; 20],
            peer_id: [2; 20],
            port: 6881,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            event: Event::Stopped,
        };
        let url = build_announce_url("http://tracker.example/announce?passkey=abc", &request).unwrap();
        let query = url.query().unwrap();
        assert!(query.starts_with("passkey=abc&"), "query was: {query}");
        assert!(query.ends_with("&event=stopped"), "query was: {query}");
    }

    #[test]
    fn generated_peer_id_has_client_prefix() {
        let id = generate_peer_id();
        assert_eq!(&id[..8], b"-RT0001-");
        assert_eq!(id.len(), 20);
    }

    #[test]
    fn parses_compact_peers() {
        let body = b"d8:intervali1800e5:peers12:\x7f\x00\x00\x01\x1a\xe1\x08\x08\x08\x08\x1a\xe1e";
        let response = Client::parse_announce_response(body).unwrap();
        assert_eq!(response.interval, 1800);
        assert_eq!(response.peers.len(), 2);
        assert_eq!(response.peers[0].ip, IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)));
        assert_eq!(response.peers[0].port, 6881);
    }

    #[test]
    fn rejects_invalid_compact_length() {
        let body = b"d8:intervali1800e5:peers1:\x00e";
        let err = Client::parse_announce_response(body).unwrap_err();
        assert!(matches!(err, TrackerError::CompactLengthInvalid(1)));
    }

    #[test]
    fn surfaces_failure_reason() {
        let body = b"d14:failure reason17:torrent not founde";
        let err = Client::parse_announce_response(body).unwrap_err();
        assert!(matches!(err, TrackerError::TrackerFailure(_)));
    }

    #[test]
    fn reads_min_interval() {
        let body = b"d8:intervali1800e12:min intervali900e5:peers0:e";
        let response = Client::parse_announce_response(body).unwrap();
        assert_eq!(response.min_interval, Some(900));
    }
}
