//! Info-hash computation.
//!
//! The info-hash must be derived from the exact bytes of the `info`
//! sub-value as they appeared in the original `.torrent` file, never from a
//! re-encoding of the decoded value — a lenient peer or an unusual encoder
//! could produce a byte-for-byte different (but semantically equal)
//! encoding, which would silently change the torrent's identity.
use sha1::{Digest, Sha1};

/// SHA-1 of the raw bytes of the `info` dictionary.
pub fn info_hash_from_bytes(info_bytes: &[u8]) -> [u8; 20] {
    let mut hasher = Sha1::new();
    hasher.update(info_bytes);
    hasher.finalize().into()
}

/// Renders an info-hash as lowercase hex, the form used in magnet URIs and
/// logs.
pub fn to_hex(hash: &[u8; 20]) -> String {
    hex::encode(hash)
}

/// Parses a 40 hex-character info-hash, as found in a magnet URI's
/// `urn:btih:` parameter.
pub fn from_hex(hex: &str) -> Option<[u8; 20]> {
    if hex.len() != 40 {
        return None;
    }
    let bytes = hex::decode(hex).ok()?;
    bytes.try_into().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashes_hello_world() {
        // info dict for a single piece whose content is "hello world"
        let hash = info_hash_from_bytes(b"hello world");
        assert_eq!(to_hex(&hash), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn hex_round_trips() {
        let hash = info_hash_from_bytes(b"some info bytes");
        let hex = to_hex(&hash);
        assert_eq!(from_hex(&hex).unwrap(), hash);
    }

    #[test]
    fn rejects_wrong_length_hex() {
        assert!(from_hex("abcd").is_none());
    }
}
