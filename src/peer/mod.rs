//! The peer wire protocol: handshake, message framing, and the per-peer
//! connection that tracks choke/interest state and bitfield.
pub mod connection;
pub mod handshake;
pub mod message;

pub use connection::{ChokeState, PeerConnection, PeerSender};
pub use handshake::Handshake;
pub use message::{Bitfield, Message, PeerWireError, PeerWireResult, MAX_FRAME_LEN};
