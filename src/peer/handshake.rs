//! The BitTorrent peer handshake: the first 68 bytes exchanged on every peer
//! connection, verifying both sides are talking about the same torrent.
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;
use tracing::instrument;

use super::message::PeerWireError;

const PROTOCOL: &[u8; 19] = b"BitTorrent protocol";
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// The 68-byte handshake message, identical in both directions except for
/// `peer_id`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub reserved: [u8; 8],
    pub info_hash: [u8; 20],
    pub peer_id: [u8; 20],
}

impl Handshake {
    pub fn new(info_hash: [u8; 20], peer_id: [u8; 20]) -> Self {
        Self {
            reserved: [0u8; 8],
            info_hash,
            peer_id,
        }
    }

    pub fn encode(&self) -> [u8; 68] {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(PROTOCOL);
        buf[20..28].copy_from_slice(&self.reserved);
        buf[28..48].copy_from_slice(&self.info_hash);
        buf[48..68].copy_from_slice(&self.peer_id);
        buf
    }

    /// Writes this handshake, enforcing the 10 s write deadline.
    #[instrument(level = "trace", skip(writer))]
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<(), PeerWireError> {
        timeout(HANDSHAKE_TIMEOUT, writer.write_all(&self.encode()))
            .await
            .map_err(|_| PeerWireError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake write timed out")))??;
        Ok(())
    }

    /// Reads a 68-byte handshake, enforcing the 10 s read deadline and
    /// validating the protocol identifier and length byte. The caller is
    /// responsible for comparing `info_hash` against the expected value
    /// (`HandshakeMismatch` in the peer-wire error vocabulary).
    #[instrument(level = "trace", skip(reader))]
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Handshake, PeerWireError> {
        let mut buf = [0u8; 68];
        timeout(HANDSHAKE_TIMEOUT, reader.read_exact(&mut buf))
            .await
            .map_err(|_| PeerWireError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "handshake read timed out")))??;

        if buf[0] != 19 || &buf[1..20] != PROTOCOL {
            return Err(PeerWireError::HandshakeMismatch);
        }

        let mut reserved = [0u8; 8];
        reserved.copy_from_slice(&buf[20..28]);
        let mut info_hash = [0u8; 20];
        info_hash.copy_from_slice(&buf[28..48]);
        let mut peer_id = [0u8; 20];
        peer_id.copy_from_slice(&buf[48..68]);

        Ok(Handshake {
            reserved,
            info_hash,
            peer_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_over_a_buffer() {
        let hs = Handshake::new([1u8; 20], [2u8; 20]);
        let mut buf = Vec::new();
        hs.write_to(&mut buf).await.unwrap();
        assert_eq!(buf.len(), 68);

        let mut cursor = std::io::Cursor::new(buf);
        let read_back = Handshake::read_from(&mut cursor).await.unwrap();
        assert_eq!(read_back, hs);
    }

    #[tokio::test]
    async fn rejects_wrong_protocol_string() {
        let mut buf = [0u8; 68];
        buf[0] = 19;
        buf[1..20].copy_from_slice(b"NotBitTorrent proto");
        let mut cursor = std::io::Cursor::new(buf.to_vec());
        let err = Handshake::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, PeerWireError::HandshakeMismatch));
    }
}
