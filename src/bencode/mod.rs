//! Bencode value model and error types.
//!
//! Bencode is the binary serialization format used throughout the BitTorrent
//! protocol: tracker requests and responses, `.torrent` files, and the peer
//! wire protocol's handshake payload all lean on it. This module owns the
//! value type; [`decoder`] and [`encoder`] implement the grammar.
use std::collections::BTreeMap;
use thiserror::Error;

pub mod decoder;
pub mod encoder;

pub use decoder::{decode, decode_dict_with_spans, decode_prefix};
pub use encoder::{encode, encode_to_vec};

/// A decoded Bencode value.
///
/// Dictionaries are backed by a `BTreeMap` rather than a `HashMap` so they
/// always iterate in ascending key order by raw bytes — the encoder relies
/// on this for the byte-exact, deterministic output the info-hash depends
/// on, instead of sorting keys at encode time.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum BencodeValue {
    String(Vec<u8>),
    Integer(i64),
    List(Vec<BencodeValue>),
    Dict(BTreeMap<Vec<u8>, BencodeValue>),
}

impl BencodeValue {
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            BencodeValue::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<i64> {
        match self {
            BencodeValue::Integer(i) => Some(*i),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[BencodeValue]> {
        match self {
            BencodeValue::List(l) => Some(l),
            _ => None,
        }
    }

    pub fn as_dict(&self) -> Option<&BTreeMap<Vec<u8>, BencodeValue>> {
        match self {
            BencodeValue::Dict(d) => Some(d),
            _ => None,
        }
    }
}

/// Failure kinds for decoding and encoding Bencode values.
#[derive(Debug, Error)]
pub enum BencodeError {
    #[error("unexpected end of input at byte {0}")]
    UnexpectedEnd(usize),

    #[error("invalid digits in length/integer at byte {0}")]
    InvalidDigits(usize),

    #[error("invalid string length at byte {0}")]
    InvalidStringLength(usize),

    #[error("dictionary key at byte {0} is not a string")]
    NonStringKey(usize),

    #[error("dictionary keys out of order at byte {0}")]
    UnorderedKeys(usize),

    #[error("unexpected byte {byte:#04x} at position {pos}")]
    UnexpectedByte { pos: usize, byte: u8 },

    #[error("{0} bytes of trailing data after the top-level value")]
    TrailingData(usize),

    #[error("cannot encode value: {0}")]
    CannotEncode(&'static str),

    #[error("I/O error while encoding: {0}")]
    Io(#[from] std::io::Error),
}

pub type BencodeResult<T> = std::result::Result<T, BencodeError>;
