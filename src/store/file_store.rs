//! Single-file persistent backend
//!
//! File format:
//! ```text
//! [HEADER: 64 bytes]
//!   - magic: 8 bytes ("CANOPYKV")
//!   - version: 4 bytes (u32 LE)
//!   - flags: 4 bytes
//!   - entry_count: 8 bytes (u64 LE)
//!   - index_offset: 8 bytes (u64 LE)
//!   - reserved: 32 bytes
//!
//! [VALUES: variable]
//!   - zstd-compressed values, concatenated
//!
//! [INDEX: variable]
//!   - per entry: key_len (u16 LE) + key + offset (u64 LE) + size (u32 LE)
//! ```
//!
//! Values are appended; the index is rewritten at the current append
//! position whenever a batch commits, so the index region of a previous
//! sync is reclaimed by the next append. Deleted values stay in the file
//! until the file is rewritten; only the index entry goes away.

use super::{Backend, BatchOp};
use crate::{Error, Result, MAGIC, VERSION};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

const HEADER_SIZE: u64 = 64;

/// Compression level for stored values
const ZSTD_LEVEL: i32 = 3;

#[derive(Clone, Debug)]
struct IndexEntry {
    offset: u64,
    size: u32,
}

/// An ordered key-value store backed by a single file
pub struct FileStore {
    path: PathBuf,
    file: RwLock<File>,
    index: RwLock<BTreeMap<Vec<u8>, IndexEntry>>,
    /// Current append position
    write_offset: RwLock<u64>,
}

impl FileStore {
    /// Create a new store file, truncating anything already at `path`
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..8].copy_from_slice(MAGIC);
        header[8..12].copy_from_slice(&VERSION.to_le_bytes());
        file.write_all(&header)?;
        file.sync_all()?;

        Ok(FileStore {
            path,
            file: RwLock::new(file),
            index: RwLock::new(BTreeMap::new()),
            write_offset: RwLock::new(HEADER_SIZE),
        })
    }

    /// Open an existing store file
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new().read(true).write(true).open(&path)?;

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact(&mut header)?;

        if &header[0..8] != MAGIC {
            return Err(Error::InvalidFile("Invalid magic bytes".into()));
        }

        let version = u32::from_le_bytes(header[8..12].try_into().unwrap());
        if version != VERSION {
            return Err(Error::VersionMismatch {
                expected: VERSION,
                found: version,
            });
        }

        let entry_count = u64::from_le_bytes(header[16..24].try_into().unwrap());
        let index_offset = u64::from_le_bytes(header[24..32].try_into().unwrap());

        let mut index = BTreeMap::new();
        if index_offset > 0 && entry_count > 0 {
            file.seek(SeekFrom::Start(index_offset))?;
            for _ in 0..entry_count {
                let mut len_buf = [0u8; 2];
                file.read_exact(&mut len_buf)?;
                let key_len = u16::from_le_bytes(len_buf) as usize;

                let mut key = vec![0u8; key_len];
                file.read_exact(&mut key)?;

                let mut entry_buf = [0u8; 12];
                file.read_exact(&mut entry_buf)?;
                let offset = u64::from_le_bytes(entry_buf[0..8].try_into().unwrap());
                let size = u32::from_le_bytes(entry_buf[8..12].try_into().unwrap());

                index.insert(key, IndexEntry { offset, size });
            }
        }

        // Values end where the index begins
        let write_offset = if index_offset > 0 {
            index_offset
        } else {
            file.seek(SeekFrom::End(0))?
        };

        Ok(FileStore {
            path,
            file: RwLock::new(file),
            index: RwLock::new(index),
            write_offset: RwLock::new(write_offset),
        })
    }

    /// Open or create a store file
    pub fn open_or_create(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if path.exists() {
            Self::open(path)
        } else {
            Self::create(path)
        }
    }

    /// Number of live keys
    pub fn len(&self) -> usize {
        self.index.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.read().is_empty()
    }

    /// Get the file path
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write index and header at the current append position
    fn sync_locked(
        file: &mut File,
        index: &BTreeMap<Vec<u8>, IndexEntry>,
        write_offset: u64,
    ) -> Result<()> {
        file.seek(SeekFrom::Start(write_offset))?;
        for (key, entry) in index {
            file.write_all(&(key.len() as u16).to_le_bytes())?;
            file.write_all(key)?;
            file.write_all(&entry.offset.to_le_bytes())?;
            file.write_all(&entry.size.to_le_bytes())?;
        }

        file.seek(SeekFrom::Start(16))?;
        file.write_all(&(index.len() as u64).to_le_bytes())?;
        file.write_all(&write_offset.to_le_bytes())?;

        file.sync_all()?;
        Ok(())
    }

    /// Flush the index to disk
    pub fn sync(&self) -> Result<()> {
        let index = self.index.read();
        let write_offset = *self.write_offset.read();
        let mut file = self.file.write();
        Self::sync_locked(&mut file, &index, write_offset)
    }
}

impl Backend for FileStore {
    fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let entry = {
            let index = self.index.read();
            index.get(key).cloned()
        };

        let entry = entry.ok_or_else(|| Error::key_not_found(key))?;

        let mut file = self.file.write();
        file.seek(SeekFrom::Start(entry.offset))?;

        let mut data = vec![0u8; entry.size as usize];
        file.read_exact(&mut data)?;

        Ok(zstd::decode_all(data.as_slice())?)
    }

    fn apply(&self, batch: Vec<BatchOp>) -> Result<()> {
        let mut index = self.index.write();
        let mut write_offset = self.write_offset.write();
        let mut file = self.file.write();

        for op in batch {
            match op {
                BatchOp::Put { key, value } => {
                    let compressed = zstd::encode_all(value.as_slice(), ZSTD_LEVEL)?;
                    let size = compressed.len() as u32;

                    file.seek(SeekFrom::Start(*write_offset))?;
                    file.write_all(&compressed)?;

                    index.insert(
                        key,
                        IndexEntry {
                            offset: *write_offset,
                            size,
                        },
                    );
                    *write_offset += size as u64;
                }
                BatchOp::Delete { key } => {
                    index.remove(&key);
                }
            }
        }

        Self::sync_locked(&mut file, &index, *write_offset)
    }
}

impl Drop for FileStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.sync();
    }
}
