//! Bencode encoding.
//!
//! Encoding is deterministic by construction: [`BencodeValue::Dict`] is a
//! `BTreeMap`, so iterating it already yields keys in ascending byte order.
//! There is no separate sort-and-collect step the way a `HashMap`-backed
//! encoder would need one.
use super::{BencodeResult, BencodeValue};
use std::io::Write;
use tracing::instrument;

#[instrument(skip(writer, s), level = "trace")]
fn encode_string<W: Write>(writer: &mut W, s: &[u8]) -> BencodeResult<()> {
    write!(writer, "{}:", s.len())?;
    writer.write_all(s)?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_integer<W: Write>(writer: &mut W, i: i64) -> BencodeResult<()> {
    write!(writer, "i{}e", i)?;
    Ok(())
}

#[instrument(skip(writer, list), level = "trace")]
fn encode_list<W: Write>(writer: &mut W, list: &[BencodeValue]) -> BencodeResult<()> {
    writer.write_all(b"l")?;
    for item in list {
        encode_value(writer, item)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer, dict), level = "trace")]
fn encode_dict<W: Write>(
    writer: &mut W,
    dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>,
) -> BencodeResult<()> {
    writer.write_all(b"d")?;
    for (key, value) in dict {
        encode_string(writer, key)?;
        encode_value(writer, value)?;
    }
    writer.write_all(b"e")?;
    Ok(())
}

#[instrument(skip(writer), level = "trace")]
fn encode_value<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    match value {
        BencodeValue::String(s) => encode_string(writer, s),
        BencodeValue::Integer(i) => encode_integer(writer, *i),
        BencodeValue::List(list) => encode_list(writer, list),
        BencodeValue::Dict(dict) => encode_dict(writer, dict),
    }
}

/// Encodes `value` into `writer` using the canonical Bencode grammar.
#[instrument(skip(writer), level = "debug")]
pub fn encode<W: Write>(writer: &mut W, value: &BencodeValue) -> BencodeResult<()> {
    encode_value(writer, value)
}

/// Convenience wrapper that encodes into a fresh `Vec<u8>`.
pub fn encode_to_vec(value: &BencodeValue) -> BencodeResult<Vec<u8>> {
    let mut buf = Vec::new();
    encode(&mut buf, value)?;
    Ok(buf)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn dict(pairs: &[(&[u8], BencodeValue)]) -> BencodeValue {
        let mut map = BTreeMap::new();
        for (k, v) in pairs {
            map.insert(k.to_vec(), v.clone());
        }
        BencodeValue::Dict(map)
    }

    #[test]
    fn encodes_cow_spam_dict() {
        let value = dict(&[
            (b"cow", BencodeValue::String(b"moo".to_vec())),
            (b"spam", BencodeValue::String(b"eggs".to_vec())),
        ]);
        assert_eq!(encode_to_vec(&value).unwrap(), b"d3:cow3:moo4:spam4:eggse");
    }

    #[test]
    fn encodes_list_and_inserted_key_alphabetically() {
        let value = dict(&[(
            b"spam",
            BencodeValue::List(vec![
                BencodeValue::String(b"a".to_vec()),
                BencodeValue::String(b"b".to_vec()),
            ]),
        )]);
        assert_eq!(encode_to_vec(&value).unwrap(), b"d4:spaml1:a1:bee");

        let value = dict(&[
            (b"cow", BencodeValue::Integer(42)),
            (
                b"spam",
                BencodeValue::List(vec![
                    BencodeValue::String(b"a".to_vec()),
                    BencodeValue::String(b"b".to_vec()),
                ]),
            ),
        ]);
        assert_eq!(
            encode_to_vec(&value).unwrap(),
            b"d3:cowi42e4:spaml1:a1:bee"
        );
    }

    #[test]
    fn round_trips_through_decode() {
        use super::super::decoder::decode;
        let value = dict(&[
            (b"a", BencodeValue::Integer(-7)),
            (b"b", BencodeValue::List(vec![BencodeValue::String(b"x".to_vec())])),
        ]);
        let bytes = encode_to_vec(&value).unwrap();
        assert_eq!(decode(&bytes).unwrap(), value);
        let bytes2 = encode_to_vec(&decode(&bytes).unwrap()).unwrap();
        assert_eq!(bytes, bytes2);
    }
}
