//! Piece downloader: given a peer connection and a piece assignment,
//! pipelines block requests and assembles the piece.
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::peer::{Message, PeerConnection, PeerWireError};

/// Fixed at the protocol-design level: five outstanding block requests per
/// connection, 16 KiB per block.
pub const PIPELINE_DEPTH: u32 = 5;
pub const BLOCK_SIZE: u32 = 16384;

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("peer's bitfield does not have piece {0}")]
    NotAvailable(u32),

    #[error("peer choked us mid-download")]
    PeerChoked,

    #[error("downloaded piece failed SHA-1 verification")]
    HashMismatch,

    #[error("peer wire error: {0}")]
    PeerWire(#[from] PeerWireError),
}

pub type DownloadResult<T> = std::result::Result<T, DownloadError>;

/// One piece assignment: its index, length (`piece_length` except possibly
/// the last piece), and expected SHA-1.
#[derive(Debug, Clone)]
pub struct WorkItem {
    pub piece_index: u32,
    pub piece_length: u32,
    pub expected_hash: [u8; 20],
}

/// Downloads and verifies one piece from an already handshaken, interested,
/// unchoked connection.
pub async fn download_piece(
    conn: &mut PeerConnection,
    item: &WorkItem,
) -> DownloadResult<Vec<u8>> {
    if !conn.bitfield.has(item.piece_index as usize) {
        return Err(DownloadError::NotAvailable(item.piece_index));
    }

    let mut buffer = vec![0u8; item.piece_length as usize];
    let mut requested_bytes: u32 = 0;
    let mut received_bytes: u32 = 0;
    let mut in_flight: u32 = 0;

    while received_bytes < item.piece_length {
        while in_flight < PIPELINE_DEPTH && requested_bytes < item.piece_length {
            let length = BLOCK_SIZE.min(item.piece_length - requested_bytes);
            conn.send(&Message::Request {
                index: item.piece_index,
                begin: requested_bytes,
                length,
            })
            .await?;
            requested_bytes += length;
            in_flight += 1;
        }

        match conn.recv().await? {
            Message::KeepAlive => {}
            Message::Choke => return Err(DownloadError::PeerChoked),
            Message::Piece { index, begin, block } => {
                if index != item.piece_index {
                    continue;
                }
                let begin = begin as usize;
                let end = begin.saturating_add(block.len());
                if end > buffer.len() {
                    return Err(DownloadError::PeerWire(PeerWireError::MalformedPayload(7)));
                }
                buffer[begin..end].copy_from_slice(&block);
                received_bytes += block.len() as u32;
                in_flight = in_flight.saturating_sub(1);
            }
            // Have/Bitfield/etc are already applied to conn's state by
            // recv(); anything else is a side effect we don't need here.
            _ => {}
        }
    }

    let mut hasher = Sha1::new();
    hasher.update(&buffer);
    let actual: [u8; 20] = hasher.finalize().into();
    if actual != item.expected_hash {
        return Err(DownloadError::HashMismatch);
    }

    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_plan_splits_on_16kib_boundaries() {
        let piece_length: u32 = 40000;
        let mut requested = 0u32;
        let mut blocks = Vec::new();
        while requested < piece_length {
            let length = BLOCK_SIZE.min(piece_length - requested);
            blocks.push(length);
            requested += length;
        }
        assert_eq!(blocks, vec![16384, 16384, 7232]);
    }
}
