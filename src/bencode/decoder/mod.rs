//! Bencode decoding over an in-memory byte slice.
//!
//! A slice-and-cursor decoder (rather than a `Read`-based one) is the right
//! shape here: the metainfo parser needs the exact byte span of the `info`
//! sub-value to compute the info-hash, and that is only cheap to recover
//! when decoding keeps track of absolute offsets into the original buffer.
use super::{BencodeError, BencodeResult, BencodeValue};
use std::collections::BTreeMap;

/// Decodes exactly one top-level value from `bytes`, rejecting any trailing
/// data after it.
pub fn decode(bytes: &[u8]) -> BencodeResult<BencodeValue> {
    let (value, consumed) = decode_prefix(bytes)?;
    if consumed != bytes.len() {
        return Err(BencodeError::TrailingData(bytes.len() - consumed));
    }
    Ok(value)
}

/// Decodes the first value in `bytes` and returns it along with the number
/// of bytes consumed. Trailing data is not an error.
pub fn decode_prefix(bytes: &[u8]) -> BencodeResult<(BencodeValue, usize)> {
    decode_value(bytes, 0)
}

/// Decodes the top-level value as a dictionary and also returns, for each
/// direct key, the exact `[start, end)` byte span of its value within
/// `bytes`. Used by the metainfo parser to hash the `info` sub-value from
/// its original bytes instead of a re-encoding of the decoded value.
pub fn decode_dict_with_spans(
    bytes: &[u8],
) -> BencodeResult<(BTreeMap<Vec<u8>, BencodeValue>, BTreeMap<Vec<u8>, (usize, usize)>)> {
    if bytes.first() != Some(&b'd') {
        return Err(BencodeError::UnexpectedByte {
            pos: 0,
            byte: bytes.first().copied().unwrap_or(0),
        });
    }
    let mut pos = 1; // past the leading 'd'
    let mut dict = BTreeMap::new();
    let mut spans = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;
    loop {
        match bytes.get(pos) {
            None => return Err(BencodeError::UnexpectedEnd(pos)),
            Some(b'e') => break,
            _ => {}
        }
        let (key, key_end) = decode_string(bytes, pos)?;
        if let Some(prev) = &last_key {
            if &key <= prev {
                return Err(BencodeError::UnorderedKeys(pos));
            }
        }
        let (value, value_end) = decode_value(bytes, key_end)?;
        spans.insert(key.clone(), (key_end, value_end));
        dict.insert(key.clone(), value);
        last_key = Some(key);
        pos = value_end;
    }
    Ok((dict, spans))
}

fn decode_value(bytes: &[u8], pos: usize) -> BencodeResult<(BencodeValue, usize)> {
    match bytes.get(pos) {
        None => Err(BencodeError::UnexpectedEnd(pos)),
        Some(b'0'..=b'9') => {
            let (s, end) = decode_string(bytes, pos)?;
            Ok((BencodeValue::String(s), end))
        }
        Some(b'i') => {
            let (i, end) = decode_integer(bytes, pos)?;
            Ok((BencodeValue::Integer(i), end))
        }
        Some(b'l') => decode_list(bytes, pos),
        Some(b'd') => decode_dict(bytes, pos),
        Some(&byte) => Err(BencodeError::UnexpectedByte { pos, byte }),
    }
}

fn decode_string(bytes: &[u8], pos: usize) -> BencodeResult<(Vec<u8>, usize)> {
    let colon = bytes[pos..]
        .iter()
        .position(|&b| b == b':')
        .map(|i| pos + i)
        .ok_or(BencodeError::UnexpectedEnd(pos))?;
    let digits = &bytes[pos..colon];
    if digits.is_empty()
        || (digits.len() > 1 && digits[0] == b'0')
        || !digits.iter().all(u8::is_ascii_digit)
    {
        return Err(BencodeError::InvalidStringLength(pos));
    }
    let len: usize = std::str::from_utf8(digits)
        .ok()
        .and_then(|s| s.parse().ok())
        .ok_or(BencodeError::InvalidStringLength(pos))?;
    let start = colon + 1;
    let end = start
        .checked_add(len)
        .ok_or(BencodeError::InvalidStringLength(pos))?;
    if end > bytes.len() {
        return Err(BencodeError::UnexpectedEnd(pos));
    }
    Ok((bytes[start..end].to_vec(), end))
}

fn decode_integer(bytes: &[u8], pos: usize) -> BencodeResult<(i64, usize)> {
    debug_assert_eq!(bytes[pos], b'i');
    let start = pos + 1;
    let e = bytes[start..]
        .iter()
        .position(|&b| b == b'e')
        .map(|i| start + i)
        .ok_or(BencodeError::UnexpectedEnd(pos))?;
    let digits = &bytes[start..e];
    if digits.is_empty() {
        return Err(BencodeError::InvalidDigits(pos));
    }
    let rest = digits.strip_prefix(b"-").unwrap_or(digits);
    let negative = rest.len() != digits.len();
    if rest.is_empty() || !rest.iter().all(u8::is_ascii_digit) {
        return Err(BencodeError::InvalidDigits(pos));
    }
    if rest.len() > 1 && rest[0] == b'0' {
        return Err(BencodeError::InvalidDigits(pos));
    }
    if negative && rest == b"0" {
        return Err(BencodeError::InvalidDigits(pos));
    }
    let text = std::str::from_utf8(digits).map_err(|_| BencodeError::InvalidDigits(pos))?;
    let value: i64 = text.parse().map_err(|_| BencodeError::InvalidDigits(pos))?;
    Ok((value, e + 1))
}

fn decode_list(bytes: &[u8], pos: usize) -> BencodeResult<(BencodeValue, usize)> {
    debug_assert_eq!(bytes[pos], b'l');
    let mut cursor = pos + 1;
    let mut items = Vec::new();
    loop {
        match bytes.get(cursor) {
            None => return Err(BencodeError::UnexpectedEnd(cursor)),
            Some(b'e') => {
                cursor += 1;
                break;
            }
            _ => {
                let (item, end) = decode_value(bytes, cursor)?;
                items.push(item);
                cursor = end;
            }
        }
    }
    Ok((BencodeValue::List(items), cursor))
}

fn decode_dict(bytes: &[u8], pos: usize) -> BencodeResult<(BencodeValue, usize)> {
    debug_assert_eq!(bytes[pos], b'd');
    let mut cursor = pos + 1;
    let mut dict = BTreeMap::new();
    let mut last_key: Option<Vec<u8>> = None;
    loop {
        match bytes.get(cursor) {
            None => return Err(BencodeError::UnexpectedEnd(cursor)),
            Some(b'e') => {
                cursor += 1;
                break;
            }
            Some(b'0'..=b'9') => {
                let (key, key_end) = decode_string(bytes, cursor)?;
                if let Some(prev) = &last_key {
                    if &key <= prev {
                        return Err(BencodeError::UnorderedKeys(cursor));
                    }
                }
                let (value, value_end) = decode_value(bytes, key_end)?;
                dict.insert(key.clone(), value);
                last_key = Some(key);
                cursor = value_end;
            }
            Some(_) => return Err(BencodeError::NonStringKey(cursor)),
        }
    }
    Ok((BencodeValue::Dict(dict), cursor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::BencodeValue as V;

    fn dict(pairs: &[(&[u8], V)]) -> V {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.to_vec(), v.clone());
        }
        V::Dict(map)
    }

    #[test]
    fn decodes_strings() {
        assert_eq!(decode(b"4:spam").unwrap(), V::String(b"spam".to_vec()));
        assert_eq!(decode(b"0:").unwrap(), V::String(Vec::new()));
    }

    #[test]
    fn decodes_integers() {
        assert_eq!(decode(b"i42e").unwrap(), V::Integer(42));
        assert_eq!(decode(b"i-42e").unwrap(), V::Integer(-42));
        assert_eq!(decode(b"i0e").unwrap(), V::Integer(0));
    }

    #[test]
    fn rejects_leading_zero_and_negative_zero() {
        assert!(decode(b"i03e").is_err());
        assert!(decode(b"i-0e").is_err());
    }

    #[test]
    fn decodes_list_and_dict() {
        assert_eq!(
            decode(b"l4:spami42ee").unwrap(),
            V::List(vec![V::String(b"spam".to_vec()), V::Integer(42)])
        );
        assert_eq!(
            decode(b"d3:cow3:moo4:spam4:eggse").unwrap(),
            dict(&[
                (b"cow", V::String(b"moo".to_vec())),
                (b"spam", V::String(b"eggs".to_vec())),
            ])
        );
    }

    #[test]
    fn rejects_unordered_keys() {
        assert!(decode(b"d4:spam4:eggs3:cow3:mooe").is_err());
    }

    #[test]
    fn rejects_trailing_data() {
        assert!(decode(b"i1ei2e").is_err());
        let (value, consumed) = decode_prefix(b"i1ei2e").unwrap();
        assert_eq!(value, V::Integer(1));
        assert_eq!(consumed, 3);
    }

    #[test]
    fn rejects_short_declared_length() {
        assert!(decode(b"10:short").is_err());
    }

    #[test]
    fn dict_with_spans_captures_info_byte_range() {
        let bytes: &[u8] =
            b"d8:announce3:foo4:infod6:lengthi11e4:name5:hello12:piece lengthi11e6:pieces0:ee";
        let (_dict, spans) = decode_dict_with_spans(bytes).unwrap();
        let (start, end) = spans[b"info".as_slice()];
        assert!(matches!(decode(&bytes[start..end]).unwrap(), V::Dict(_)));
        assert_eq!(bytes[start], b'd');
        assert_eq!(bytes[end - 1], b'e');
    }
}
