//! Storage engine: file allocation, piece write, piece read, and the
//! served-piece cache.
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use lru::LruCache;
use sha1::{Digest, Sha1};
use thiserror::Error;

use crate::metainfo::Metainfo;

/// Number of buffered pieces before an implicit flush to disk.
const WRITE_BUFFER_CAPACITY: usize = 10;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("piece {0} is out of range")]
    PieceOutOfRange(usize),

    #[error("cached/on-disk piece {0} failed re-verification")]
    CacheCorrupt(usize),
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

struct FileHandle {
    handle: Mutex<File>,
    offset: i64,
    length: i64,
}

/// Owns the on-disk layout for one torrent's content: one open file handle
/// per underlying file, a bounded write buffer, and a served-piece cache.
pub struct Storage {
    files: Vec<FileHandle>,
    piece_length: i64,
    total_length: i64,
    write_buffer: Mutex<HashMap<usize, Vec<u8>>>,
    cache: Mutex<LruCache<usize, Arc<Vec<u8>>>>,
}

impl Storage {
    /// Allocates (or reopens) the on-disk layout for `metainfo` under
    /// `download_dir`, truncating every file to its declared length.
    /// `cache_capacity` bounds the served-piece cache.
    pub fn allocate(
        metainfo: &Metainfo,
        download_dir: &Path,
        cache_capacity: usize,
    ) -> StorageResult<Storage> {
        let paths = metainfo.file_paths();
        let root = download_dir.join(&metainfo.info.name);

        let multi_file = paths.len() > 1
            || matches!(metainfo.info.mode, crate::metainfo::InfoMode::MultiFile { .. });

        let mut files = Vec::with_capacity(paths.len());
        let mut offset = 0i64;
        for (path, length) in &paths {
            let full_path = if multi_file { root.join(path) } else { root.clone() };
            if let Some(parent) = full_path.parent() {
                fs::create_dir_all(parent)?;
                set_permissions(parent, 0o755)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&full_path)?;
            file.set_len(*length as u64)?;
            set_permissions(&full_path, 0o644)?;

            files.push(FileHandle {
                handle: Mutex::new(file),
                offset,
                length: *length,
            });
            offset += length;
        }

        Ok(Storage {
            files,
            piece_length: metainfo.info.piece_length,
            total_length: metainfo.total_length(),
            write_buffer: Mutex::new(HashMap::new()),
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_capacity.max(1)).unwrap(),
            )),
        })
    }

    /// Buffers `data` for piece `index`, flushing the whole buffer to disk
    /// once it reaches [`WRITE_BUFFER_CAPACITY`] pieces. Also seeds the
    /// served-piece cache so a `read_piece` immediately after observes the
    /// same bytes.
    pub fn write_piece(&self, index: usize, data: Vec<u8>) -> StorageResult<()> {
        let data = Arc::new(data);
        self.cache.lock().unwrap().put(index, data.clone());

        let mut buffer = self.write_buffer.lock().unwrap();
        buffer.insert(index, (*data).clone());
        if buffer.len() >= WRITE_BUFFER_CAPACITY {
            self.flush_locked(&mut buffer)?;
        }
        Ok(())
    }

    /// Forces every buffered piece to disk.
    pub fn flush(&self) -> StorageResult<()> {
        let mut buffer = self.write_buffer.lock().unwrap();
        self.flush_locked(&mut buffer)
    }

    fn flush_locked(&self, buffer: &mut HashMap<usize, Vec<u8>>) -> StorageResult<()> {
        for (index, data) in buffer.drain() {
            self.write_piece_to_files(index, &data)?;
        }
        Ok(())
    }

    /// Reads piece `index`, consulting the served-piece cache first and
    /// falling back to disk with SHA-1 re-verification on a miss.
    pub fn read_piece(
        &self,
        index: usize,
        expected_hash: [u8; 20],
    ) -> StorageResult<Arc<Vec<u8>>> {
        if let Some(hit) = self.cache.lock().unwrap().get(&index) {
            return Ok(hit.clone());
        }

        let length = self.piece_length_for(index)?;
        let mut buf = vec![0u8; length];
        self.read_piece_from_files(index, &mut buf)?;

        let mut hasher = Sha1::new();
        hasher.update(&buf);
        let actual: [u8; 20] = hasher.finalize().into();
        if actual != expected_hash {
            return Err(StorageError::CacheCorrupt(index));
        }

        let data = Arc::new(buf);
        self.cache.lock().unwrap().put(index, data.clone());
        Ok(data)
    }

    fn piece_length_for(&self, index: usize) -> StorageResult<usize> {
        let piece_offset = index as i64 * self.piece_length;
        if piece_offset >= self.total_length {
            return Err(StorageError::PieceOutOfRange(index));
        }
        Ok((self.piece_length).min(self.total_length - piece_offset) as usize)
    }

    /// Walks the ordered file list, writing `data`'s slices to each file
    /// that the piece spans.
    fn write_piece_to_files(&self, index: usize, data: &[u8]) -> StorageResult<()> {
        let mut piece_offset = index as i64 * self.piece_length;
        let mut remaining = data;

        for file in &self.files {
            if remaining.is_empty() {
                break;
            }
            let file_end = file.offset + file.length;
            if piece_offset >= file_end {
                continue;
            }
            let write_len = remaining.len().min((file_end - piece_offset) as usize);
            let local_offset = piece_offset - file.offset;

            let mut handle = file.handle.lock().unwrap();
            handle.seek(SeekFrom::Start(local_offset as u64))?;
            handle.write_all(&remaining[..write_len])?;

            remaining = &remaining[write_len..];
            piece_offset += write_len as i64;
        }
        Ok(())
    }

    fn read_piece_from_files(&self, index: usize, buf: &mut [u8]) -> StorageResult<()> {
        let mut piece_offset = index as i64 * self.piece_length;
        let mut written = 0usize;

        for file in &self.files {
            if written >= buf.len() {
                break;
            }
            let file_end = file.offset + file.length;
            if piece_offset >= file_end {
                continue;
            }
            let read_len = (buf.len() - written).min((file_end - piece_offset) as usize);
            let local_offset = piece_offset - file.offset;

            let mut handle = file.handle.lock().unwrap();
            handle.seek(SeekFrom::Start(local_offset as u64))?;
            handle.read_exact(&mut buf[written..written + read_len])?;

            written += read_len;
            piece_offset += read_len as i64;
        }
        Ok(())
    }
}

#[cfg(unix)]
fn set_permissions(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    fs::set_permissions(path, fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_permissions(_path: &Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bencode::{encode_to_vec, BencodeValue};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn single_file_metainfo(content: &[u8], piece_length: i64) -> Metainfo {
        let hash: [u8; 20] = Sha1::digest(content).into();
        let mut info = BTreeMap::new();
        info.insert(b"name".to_vec(), BencodeValue::String(b"hello.txt".to_vec()));
        info.insert(b"piece length".to_vec(), BencodeValue::Integer(piece_length));
        info.insert(b"pieces".to_vec(), BencodeValue::String(hash.to_vec()));
        info.insert(b"length".to_vec(), BencodeValue::Integer(content.len() as i64));
        let mut top = BTreeMap::new();
        top.insert(b"announce".to_vec(), BencodeValue::String(b"http://t".to_vec()));
        top.insert(b"info".to_vec(), BencodeValue::Dict(info));
        let bytes = encode_to_vec(&BencodeValue::Dict(top)).unwrap();
        Metainfo::parse(&bytes).unwrap()
    }

    #[test]
    fn write_then_read_round_trips_through_cache() {
        let dir = tempdir().unwrap();
        let metainfo = single_file_metainfo(b"hello world", 32768);
        let storage = Storage::allocate(&metainfo, dir.path(), 8).unwrap();

        storage.write_piece(0, b"hello world".to_vec()).unwrap();
        let hash: [u8; 20] = Sha1::digest(b"hello world").into();
        let read_back = storage.read_piece(0, hash).unwrap();
        assert_eq!(&**read_back, b"hello world");
    }

    #[test]
    fn read_after_flush_hits_disk_and_verifies() {
        let dir = tempdir().unwrap();
        let metainfo = single_file_metainfo(b"hello world", 32768);
        let storage = Storage::allocate(&metainfo, dir.path(), 8).unwrap();

        storage.write_piece(0, b"hello world".to_vec()).unwrap();
        storage.flush().unwrap();
        storage.cache.lock().unwrap().clear();

        let hash: [u8; 20] = Sha1::digest(b"hello world").into();
        let read_back = storage.read_piece(0, hash).unwrap();
        assert_eq!(&**read_back, b"hello world");
    }

    #[test]
    fn multi_file_piece_spanning_two_files() {
        let mut f1 = BTreeMap::new();
        f1.insert(b"length".to_vec(), BencodeValue::Integer(5));
        f1.insert(b"path".to_vec(), BencodeValue::List(vec![BencodeValue::String(b"a.txt".to_vec())]));
        let mut f2 = BTreeMap::new();
        f2.insert(b"length".to_vec(), BencodeValue::Integer(7));
        f2.insert(b"path".to_vec(), BencodeValue::List(vec![BencodeValue::String(b"b.txt".to_vec())]));

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

        let dir = tempdir().unwrap();
        let storage = Storage::allocate(&metainfo, dir.path(), 8).unwrap();
        let data = b"ABCDEFGHIJKL".to_vec();
        storage.write_piece_to_files(0, &data).unwrap();

        let a = fs::read(dir.path().join("pack").join("a.txt")).unwrap();
        let b = fs::read(dir.path().join("pack").join("b.txt")).unwrap();
        assert_eq!(a, b"ABCDE");
        assert_eq!(b, b"FGHIJKL");
    }
}
