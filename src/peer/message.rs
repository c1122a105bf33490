//! Peer wire message framing: a 4-byte big-endian length prefix followed by
//! that many bytes, with byte 0 of the payload as the message id.
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Any single frame longer than this is rejected outright, well before a
/// full piece-sized block plus its 13-byte Piece header would need.
pub const MAX_FRAME_LEN: u32 = (1 << 17) + 13;

#[derive(Debug, Error)]
pub enum PeerWireError {
    #[error("handshake protocol identifier or info-hash mismatch")]
    HandshakeMismatch,

    #[error("frame length {0} exceeds the maximum of {MAX_FRAME_LEN}")]
    FrameTooLarge(u32),

    #[error("malformed payload for message id {0}")]
    MalformedPayload(u8),

    #[error("unexpected message order: {0}")]
    UnexpectedMessageOrder(&'static str),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type PeerWireResult<T> = std::result::Result<T, PeerWireError>;

/// A parsed peer wire message, including the implicit keep-alive (a frame
/// of length 0, carrying no id).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    KeepAlive,
    Choke,
    Unchoke,
    Interested,
    NotInterested,
    Have { piece_index: u32 },
    Bitfield(Vec<u8>),
    Request { index: u32, begin: u32, length: u32 },
    Piece { index: u32, begin: u32, block: Vec<u8> },
    Cancel { index: u32, begin: u32, length: u32 },
}

impl Message {
    /// Encodes the message as a length-prefixed frame.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Message::KeepAlive => 0u32.to_be_bytes().to_vec(),
            Message::Choke => frame(0, &[]),
            Message::Unchoke => frame(1, &[]),
            Message::Interested => frame(2, &[]),
            Message::NotInterested => frame(3, &[]),
            Message::Have { piece_index } => frame(4, &piece_index.to_be_bytes()),
            Message::Bitfield(bits) => frame(5, bits),
            Message::Request { index, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                frame(6, &payload)
            }
            Message::Piece { index, begin, block } => {
                let mut payload = Vec::with_capacity(8 + block.len());
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(block);
                frame(7, &payload)
            }
            Message::Cancel { index, begin, length } => {
                let mut payload = Vec::with_capacity(12);
                payload.extend_from_slice(&index.to_be_bytes());
                payload.extend_from_slice(&begin.to_be_bytes());
                payload.extend_from_slice(&length.to_be_bytes());
                frame(8, &payload)
            }
        }
    }

    /// Writes this message's frame to `writer`.
    pub async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> PeerWireResult<()> {
        writer.write_all(&self.encode()).await?;
        Ok(())
    }

    /// Reads one frame from `reader` and parses it. Returns
    /// [`PeerWireError::ConnectionClosed`] on a clean EOF before the length
    /// prefix.
    pub async fn read_from<R: AsyncRead + Unpin>(reader: &mut R) -> PeerWireResult<Message> {
        let mut len_buf = [0u8; 4];
        match reader.read_exact(&mut len_buf).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(PeerWireError::ConnectionClosed)
            }
            Err(e) => return Err(e.into()),
        }
        let length = u32::from_be_bytes(len_buf);
        if length == 0 {
            return Ok(Message::KeepAlive);
        }
        if length > MAX_FRAME_LEN {
            return Err(PeerWireError::FrameTooLarge(length));
        }

        let mut payload = vec![0u8; length as usize];
        reader.read_exact(&mut payload).await?;
        Message::decode(&payload)
    }

    fn decode(payload: &[u8]) -> PeerWireResult<Message> {
        let id = payload[0];
        let body = &payload[1..];
        match id {
            0 => Ok(Message::Choke),
            1 => Ok(Message::Unchoke),
            2 => Ok(Message::Interested),
            3 => Ok(Message::NotInterested),
            4 => {
                let piece_index = read_u32(body, id)?;
                Ok(Message::Have { piece_index })
            }
            5 => Ok(Message::Bitfield(body.to_vec())),
            6 => {
                let (index, begin, length) = read_three_u32(body, id)?;
                Ok(Message::Request { index, begin, length })
            }
            7 => {
                if body.len() < 8 {
                    return Err(PeerWireError::MalformedPayload(id));
                }
                let index = u32::from_be_bytes(body[0..4].try_into().unwrap());
                let begin = u32::from_be_bytes(body[4..8].try_into().unwrap());
                Ok(Message::Piece {
                    index,
                    begin,
                    block: body[8..].to_vec(),
                })
            }
            8 => {
                let (index, begin, length) = read_three_u32(body, id)?;
                Ok(Message::Cancel { index, begin, length })
            }
            other => Err(PeerWireError::MalformedPayload(other)),
        }
    }
}

fn frame(id: u8, payload: &[u8]) -> Vec<u8> {
    let length = 1 + payload.len() as u32;
    let mut buf = Vec::with_capacity(4 + length as usize);
    buf.extend_from_slice(&length.to_be_bytes());
    buf.push(id);
    buf.extend_from_slice(payload);
    buf
}

fn read_u32(body: &[u8], id: u8) -> PeerWireResult<u32> {
    body.get(0..4)
        .map(|b| u32::from_be_bytes(b.try_into().unwrap()))
        .ok_or(PeerWireError::MalformedPayload(id))
}

fn read_three_u32(body: &[u8], id: u8) -> PeerWireResult<(u32, u32, u32)> {
    if body.len() < 12 {
        return Err(PeerWireError::MalformedPayload(id));
    }
    let index = u32::from_be_bytes(body[0..4].try_into().unwrap());
    let begin = u32::from_be_bytes(body[4..8].try_into().unwrap());
    let length = u32::from_be_bytes(body[8..12].try_into().unwrap());
    Ok((index, begin, length))
}

/// A bitfield of `num_pieces` bits, stored MSB-first per byte.
#[derive(Debug, Clone)]
pub struct Bitfield {
    bits: Vec<u8>,
    num_pieces: usize,
}

impl Bitfield {
    pub fn empty(num_pieces: usize) -> Self {
        Self {
            bits: vec![0u8; num_pieces.div_ceil(8)],
            num_pieces,
        }
    }

    /// Builds a bitfield from wire bytes, ignoring any trailing padding bits
    /// beyond `num_pieces`.
    pub fn from_wire(bytes: &[u8], num_pieces: usize) -> Self {
        let mut bits = bytes.to_vec();
        bits.resize(num_pieces.div_ceil(8), 0);
        Self { bits, num_pieces }
    }

    pub fn num_pieces(&self) -> usize {
        self.num_pieces
    }

    pub fn has(&self, index: usize) -> bool {
        if index >= self.num_pieces {
            return false;
        }
        let byte = self.bits[index / 8];
        byte & (0x80 >> (index % 8)) != 0
    }

    pub fn set(&mut self, index: usize) {
        if index >= self.num_pieces {
            return;
        }
        self.bits[index / 8] |= 0x80 >> (index % 8);
    }

    /// Encodes to wire form, zeroing any trailing padding bits.
    pub fn to_wire(&self) -> Vec<u8> {
        self.bits.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn round_trips_request() {
        let msg = Message::Request { index: 3, begin: 16384, length: 16384 };
        let encoded = msg.encode();
        let mut cursor = std::io::Cursor::new(encoded);
        let decoded = Message::read_from(&mut cursor).await.unwrap();
        assert_eq!(decoded, msg);
    }

    #[tokio::test]
    async fn keep_alive_round_trips() {
        let encoded = Message::KeepAlive.encode();
        assert_eq!(encoded, 0u32.to_be_bytes());
        let mut cursor = std::io::Cursor::new(encoded);
        assert_eq!(Message::read_from(&mut cursor).await.unwrap(), Message::KeepAlive);
    }

    #[tokio::test]
    async fn rejects_oversize_frame() {
        let mut buf = (MAX_FRAME_LEN + 1).to_be_bytes().to_vec();
        buf.extend_from_slice(&[0u8; 4]);
        let mut cursor = std::io::Cursor::new(buf);
        let err = Message::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, PeerWireError::FrameTooLarge(_)));
    }

    #[tokio::test]
    async fn connection_closed_on_clean_eof() {
        let mut cursor = std::io::Cursor::new(Vec::<u8>::new());
        let err = Message::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(err, PeerWireError::ConnectionClosed));
    }

    #[test]
    fn bitfield_bit_order_is_msb_first() {
        let mut bf = Bitfield::empty(10);
        bf.set(0);
        bf.set(9);
        let wire = bf.to_wire();
        assert_eq!(wire[0] & 0x80, 0x80);
        assert_eq!(wire[1] & (0x80 >> 1), 0x80 >> 1);
    }

    #[test]
    fn bitfield_ignores_trailing_padding() {
        // byte 1's low 6 bits are padding beyond the 10 declared pieces.
        let bf = Bitfield::from_wire(&[0xFF, 0xFF], 10);
        assert!(bf.has(9));
        assert!(!bf.has(10));
    }
}
