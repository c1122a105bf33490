//! The parsed contents of a `.torrent` file.
use super::hash::info_hash_from_bytes;
use super::{MetainfoError, MetainfoResult};
use crate::bencode::{self, BencodeValue};
use std::path::PathBuf;

/// Parsed `.torrent` metainfo.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metainfo {
    pub announce: Option<String>,
    pub announce_list: Vec<Vec<String>>,
    pub info: Info,
    pub info_hash: [u8; 20],
    pub comment: Option<String>,
    pub created_by: Option<String>,
    pub creation_date: Option<i64>,
    pub encoding: Option<String>,
}

/// The `info` sub-dictionary: the part whose bytes determine the
/// info-hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Info {
    pub name: String,
    pub piece_length: i64,
    pub pieces: Vec<[u8; 20]>,
    pub private: bool,
    pub mode: InfoMode,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InfoMode {
    SingleFile { length: i64 },
    MultiFile { files: Vec<FileEntry> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    pub path: Vec<String>,
    pub length: i64,
}

impl Metainfo {
    /// Parses a `.torrent` file's raw bytes.
    #[tracing::instrument(level = "debug", skip(bytes))]
    pub fn parse(bytes: &[u8]) -> MetainfoResult<Metainfo> {
        let (dict, spans) = bencode::decode_dict_with_spans(bytes)?;

        let announce = match dict.get(b"announce".as_slice()) {
            Some(v) => Some(utf8_field(v, "announce")?),
            None => None,
        };

        let announce_list = match dict.get(b"announce-list".as_slice()) {
            Some(v) => parse_announce_list(v)?,
            None => Vec::new(),
        };

        if announce.is_none() && announce_list.is_empty() {
            return Err(MetainfoError::MissingField("announce"));
        }

        let info_value = dict
            .get(b"info".as_slice())
            .ok_or(MetainfoError::MissingField("info"))?;
        let info_dict = info_value
            .as_dict()
            .ok_or(MetainfoError::MissingField("info"))?;
        let info = parse_info(info_dict)?;

        let (info_start, info_end) = spans[b"info".as_slice()];
        let info_hash = info_hash_from_bytes(&bytes[info_start..info_end]);

        let comment = optional_utf8_field(&dict, b"comment")?;
        let created_by = optional_utf8_field(&dict, b"created by")?;
        let encoding = optional_utf8_field(&dict, b"encoding")?;
        let creation_date = dict.get(b"creation date".as_slice()).and_then(|v| v.as_integer());

        Ok(Metainfo {
            announce,
            announce_list,
            info,
            info_hash,
            comment,
            created_by,
            encoding,
            creation_date,
        })
    }

    /// Total content length across all files.
    pub fn total_length(&self) -> i64 {
        match &self.info.mode {
            InfoMode::SingleFile { length } => *length,
            InfoMode::MultiFile { files } => files.iter().map(|f| f.length).sum(),
        }
    }

    pub fn num_pieces(&self) -> usize {
        self.info.pieces.len()
    }

    /// Length of the piece at `index`; the last piece may be shorter than
    /// `piece_length`.
    pub fn piece_length(&self, index: usize) -> i64 {
        if index >= self.num_pieces() {
            return 0;
        }
        if index < self.num_pieces() - 1 {
            self.info.piece_length
        } else {
            self.total_length() - (self.num_pieces() - 1) as i64 * self.info.piece_length
        }
    }

    /// All tracker URLs, primary announce first, then announce-list tiers
    /// flattened in tier order.
    pub fn all_trackers(&self) -> Vec<String> {
        let mut trackers: Vec<String> = self.announce.iter().cloned().collect();
        for tier in &self.announce_list {
            for url in tier {
                if !trackers.contains(url) {
                    trackers.push(url.clone());
                }
            }
        }
        trackers
    }

    /// Relative on-disk paths of every file, joined under the torrent's
    /// name for multi-file torrents (single-file torrents have one path
    /// equal to the name itself).
    pub fn file_paths(&self) -> Vec<(PathBuf, i64)> {
        match &self.info.mode {
            InfoMode::SingleFile { length } => vec![(PathBuf::from(&self.info.name), *length)],
            InfoMode::MultiFile { files } => files
                .iter()
                .map(|f| {
                    let mut path = PathBuf::new();
                    for component in &f.path {
                        path.push(component);
                    }
                    (path, f.length)
                })
                .collect(),
        }
    }
}

fn utf8_field(value: &BencodeValue, field: &'static str) -> MetainfoResult<String> {
    let bytes = value.as_bytes().ok_or(MetainfoError::MissingField(field))?;
    String::from_utf8(bytes.to_vec()).map_err(|_| MetainfoError::InvalidUtf8(field))
}

fn optional_utf8_field(
    dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>,
    key: &[u8],
) -> MetainfoResult<Option<String>> {
    match dict.get(key) {
        Some(v) => Ok(Some(String::from_utf8(
            v.as_bytes().unwrap_or_default().to_vec(),
        ).unwrap_or_default())),
        None => Ok(None),
    }
}

fn parse_announce_list(value: &BencodeValue) -> MetainfoResult<Vec<Vec<String>>> {
    let tiers = value.as_list().ok_or(MetainfoError::MissingField("announce-list"))?;
    tiers
        .iter()
        .map(|tier| {
            let urls = tier.as_list().ok_or(MetainfoError::MissingField("announce-list"))?;
            urls.iter()
                .map(|u| utf8_field(u, "announce-list"))
                .collect()
        })
        .collect()
}

fn parse_pieces(bytes: &[u8]) -> MetainfoResult<Vec<[u8; 20]>> {
    if bytes.len() % 20 != 0 {
        return Err(MetainfoError::InvalidPieces(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(20)
        .map(|chunk| {
            let mut hash = [0u8; 20];
            hash.copy_from_slice(chunk);
            hash
        })
        .collect())
}

fn parse_info(dict: &std::collections::BTreeMap<Vec<u8>, BencodeValue>) -> MetainfoResult<Info> {
    let name = utf8_field(
        dict.get(b"name".as_slice()).ok_or(MetainfoError::MissingField("name"))?,
        "name",
    )?;
    let piece_length = dict
        .get(b"piece length".as_slice())
        .and_then(|v| v.as_integer())
        .ok_or(MetainfoError::MissingField("piece length"))?;
    if piece_length <= 0 {
        return Err(MetainfoError::InvalidPieceLength(piece_length));
    }
    let pieces_bytes = dict
        .get(b"pieces".as_slice())
        .and_then(|v| v.as_bytes())
        .ok_or(MetainfoError::MissingField("pieces"))?;
    let pieces = parse_pieces(pieces_bytes)?;
    let private = dict
        .get(b"private".as_slice())
        .and_then(|v| v.as_integer())
        .map(|i| i == 1)
        .unwrap_or(false);

    let length = dict.get(b"length".as_slice()).and_then(|v| v.as_integer());
    let files = match dict.get(b"files".as_slice()) {
        Some(v) => Some(parse_files(v)?),
        None => None,
    };

    let mode = match (length, files) {
        (Some(_), Some(_)) => return Err(MetainfoError::AmbiguousMode),
        (None, None) => return Err(MetainfoError::MissingMode),
        (Some(length), None) => InfoMode::SingleFile { length },
        (None, Some(files)) => InfoMode::MultiFile { files },
    };

    let total_length = match &mode {
        InfoMode::SingleFile { length } => *length,
        InfoMode::MultiFile { files } => files.iter().map(|f| f.length).sum(),
    };
    let expected_pieces = ((total_length + piece_length - 1) / piece_length) as usize;
    if !pieces.is_empty() && expected_pieces != pieces.len() && total_length > 0 {
        return Err(MetainfoError::LengthMismatch { files_total: total_length });
    }

    Ok(Info {
        name,
        piece_length,
        pieces,
        private,
        mode,
    })
}

fn parse_files(value: &BencodeValue) -> MetainfoResult<Vec<FileEntry>> {
    let list = value.as_list().ok_or(MetainfoError::MissingField("files"))?;
    list.iter()
        .map(|entry| {
            let dict = entry.as_dict().ok_or(MetainfoError::MissingField("files"))?;
            let length = dict
                .get(b"length".as_slice())
                .and_then(|v| v.as_integer())
                .ok_or(MetainfoError::MissingField("length"))?;
            let path_list = dict
                .get(b"path".as_slice())
                .and_then(|v| v.as_list())
                .ok_or(MetainfoError::MissingField("path"))?;
            let path = path_list
                .iter()
                .map(|p| utf8_field(p, "path"))
                .collect::<MetainfoResult<Vec<_>>>()?;
            Ok(FileEntry { path, length })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode_to_vec, BencodeValue};
    use sha1::{Digest, Sha1};
    use std::collections::BTreeMap;

    fn single_file_torrent(content: &[u8], piece_length: i64) -> Vec<u8> {
        let hash: [u8; 20] = Sha1::digest(content).into();
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"hello.txt".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        info.insert(b"pieces".to_vec(), BencodeValue::String(hash.to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(content.len() as i64));

        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), BencodeValue::String(b"http://tracker.example/announce".to_vec()));
        top.insert(b"info".to_vec(), BencodeValue::Dict(info));
        encode_to_vec(&BencodeValue::Dict(top)).unwrap()
    }

    #[test]
    fn parses_single_file_torrent_and_computes_info_hash() {
        let bytes = single_file_torrent(b"hello world", 32768);
        let metainfo = Metainfo::parse(&bytes).unwrap();
        assert_eq!(metainfo.info.name, "hello.txt");
        assert_eq!(metainfo.num_pieces(), 1);
        assert_eq!(metainfo.total_length(), 11);
        assert_eq!(metainfo.piece_length(0), 11);

        let expected_hash: [u8; 20] = Sha1::digest(b"hello world").into();
        assert_eq!(metainfo.info.pieces[0], expected_hash);
    }

    #[test]
    fn rejects_pieces_length_not_multiple_of_20() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"x".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 19]));
        info.insert(b"length".to_vec(), BencodeValue::Integer(1));
        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), BencodeValue::String(b"http://t".to_vec()));
        top.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encode_to_vec(&BencodeValue::Dict(top)).unwrap();
        assert!(matches!(
            Metainfo::parse(&bytes),
            Err(MetainfoError::InvalidPieces(19))
        ));
    }

    #[test]
    fn rejects_ambiguous_and_missing_mode() {
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"x".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(16384));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        info.insert(b"length".to_vec(), BencodeValue::Integer(1));
        info.insert(b"files".to_vec(), BencodeValue::List(vec![]));
        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), BencodeValue::String(b"http://t".to_vec()));
        top.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encode_to_vec(&BencodeValue::Dict(top)).unwrap();
        assert!(matches!(Metainfo::parse(&bytes), Err(MetainfoError::AmbiguousMode)));
    }

    #[test]
    fn multi_file_total_length_and_paths() {
        let mut f1 = BTreeMap::new();
        f1.insert(b"length".to_vec(), BencodeValue::Integer(5));
        f1.insert(b"path".to_vec(), BencodeValue::List(vec![BencodeValue::String(b"a.txt".to_vec())]));
        let mut f2 = BTreeMap::new();
        f2.insert(b"length".to_vec(), BencodeValue::Integer(7));
        f2.insert(
            b"path".to_vec(),
            BencodeValue::List(vec![
                BencodeValue::String(b"sub".to_vec()),
                BencodeValue::String(b"b.txt".to_vec()),
            ]),
        );

        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"pack".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(12));
        info.insert(b"pieces".to_vec(), BencodeValue::String(vec![0u8; 20]));
        info.insert(
            b"files".to_vec(),
            BencodeValue::List(vec![BencodeValue::Dict(f1), BencodeValue::Dict(f2)]),
        );

        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), BencodeValue::String(b"http://t".to_vec()));
        top.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encode_to_vec(&BencodeValue::Dict(top)).unwrap();

        let metainfo = Metainfo::parse(&bytes).unwrap();
        assert_eq!(metainfo.total_length(), 12);
        assert_eq!(metainfo.piece_length(0), 12);
        let paths = metainfo.file_paths();
        assert_eq!(paths.len(), 2);
        assert_eq!(paths[1].0, PathBuf::from("sub").join("b.txt"));
    }
}
