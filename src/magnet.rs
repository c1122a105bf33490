//! Magnet URI parsing (BEP 9's `xt`/`dn`/`tr` parameters only; metadata
//! exchange over the wire is out of scope — see [`crate::engine`] for how
//! an added magnet sits in `AwaitingMetadata` until that's implemented).
use thiserror::Error;
use url::Url;

use crate::metainfo::hash::from_hex;

#[derive(Debug, Error)]
pub enum MagnetError {
    #[error("not a magnet: URI")]
    WrongScheme,

    #[error("failed to parse URI: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("magnet URI has no `xt` parameter")]
    MissingExactTopic,

    #[error("`xt` parameter is not a recognised urn:btih info-hash")]
    UnrecognisedExactTopic,
}

/// A magnet URI resolved to its recognised BitTorrent parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MagnetLink {
    pub info_hash: [u8; 20],
    pub display_name: Option<String>,
    pub trackers: Vec<String>,
}

impl MagnetLink {
    /// Parses a `magnet:` URI. Only the first `xt=urn:btih:<hex>` parameter
    /// is honoured; a magnet with no `xt` at all is rejected. `tr` entries
    /// whose scheme isn't `http`, `https`, or `udp` are silently dropped.
    pub fn parse(uri: &str) -> Result<MagnetLink, MagnetError> {
        let url = Url::parse(uri)?;
        if url.scheme() != "magnet" {
            return Err(MagnetError::WrongScheme);
        }

        let mut info_hash = None;
        let mut display_name = None;
        let mut trackers = Vec::new();

        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "xt" if info_hash.is_none() => {
                    if let Some(hex) = value.strip_prefix("urn:btih:") {
                        info_hash = from_hex(&hex.to_ascii_lowercase());
                    }
                }
                "dn" if display_name.is_none() => {
                    display_name = Some(value.into_owned());
                }
                "tr" => {
                    if is_recognised_tracker_scheme(&value) {
                        trackers.push(value.into_owned());
                    }
                }
                _ => {}
            }
        }

        let info_hash = info_hash.ok_or_else(|| {
            if url.query_pairs().any(|(k, _)| k == "xt") {
                MagnetError::UnrecognisedExactTopic
            } else {
                MagnetError::MissingExactTopic
            }
        })?;

        Ok(MagnetLink {
            info_hash,
            display_name,
            trackers,
        })
    }
}

fn is_recognised_tracker_scheme(url: &str) -> bool {
    matches!(
        url.split_once(':').map(|(scheme, _)| scheme),
        Some("http") | Some("https") | Some("udp")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_xt_dn_tr() {
        let uri = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&dn=example&tr=http%3A%2F%2Ftracker.example%2Fannounce&tr=ftp%3A%2F%2Fbad";
        let magnet = MagnetLink::parse(uri).unwrap();
        assert_eq!(magnet.display_name.as_deref(), Some("example"));
        assert_eq!(magnet.trackers, vec!["http://tracker.example/announce"]);
        assert_eq!(magnet.info_hash.len(), 20);
    }

    #[test]
    fn rejects_missing_xt() {
        assert!(matches!(
            MagnetLink::parse("magnet:?dn=example"),
            Err(MagnetError::MissingExactTopic)
        ));
    }

    #[test]
    fn rejects_non_magnet_scheme() {
        assert!(matches!(
            MagnetLink::parse("http://example.com"),
            Err(MagnetError::WrongScheme)
        ));
    }

    #[test]
    fn accepts_udp_tracker_rejects_others() {
        let uri = "magnet:?xt=urn:btih:c12fe1c06bba254a9dc9f519b335aa7c1367a88a&tr=udp%3A%2F%2Ftracker.example%3A80&tr=ws%3A%2F%2Fbad";
        let magnet = MagnetLink::parse(uri).unwrap();
        assert_eq!(magnet.trackers, vec!["udp://tracker.example:80"]);
    }
}
