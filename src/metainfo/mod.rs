//! Torrent metainfo (`.torrent`) parsing and the info-hash it identifies a
//! torrent by.
//!
//! This module turns the raw bytes of a `.torrent` file into a [`Metainfo`]
//! plus its 20-byte info-hash, validating the invariants a BitTorrent v1
//! metainfo dictionary must satisfy.
use thiserror::Error;

pub mod hash;
pub mod info;

pub use info::{FileEntry, Info, InfoMode, Metainfo};

#[derive(Debug, Error)]
pub enum MetainfoError {
    #[error("bencode decoding error: {0}")]
    Bencode(#[from] crate::bencode::BencodeError),

    #[error("top-level value is not a dictionary")]
    NotADictionary,

    #[error("missing required field: {0}")]
    MissingField(&'static str),

    #[error("pieces length ({0}) is not a multiple of 20")]
    InvalidPieces(usize),

    #[error("info dictionary has both `length` and `files`")]
    AmbiguousMode,

    #[error("info dictionary has neither `length` nor `files`")]
    MissingMode,

    #[error("field `{0}` is not valid UTF-8")]
    InvalidUtf8(&'static str),

    #[error("sum of file lengths ({files_total}) does not equal the declared total")]
    LengthMismatch { files_total: i64 },

    #[error("piece_length must be positive, got {0}")]
    InvalidPieceLength(i64),
}

pub type MetainfoResult<T> = std::result::Result<T, MetainfoError>;
