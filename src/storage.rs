//! Single-file record store backing the metadata collections.
//!
//! # File Format
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  Offset       │  Size  │  Description                        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  0            │  4     │  Magic bytes: "DOWE"                │
//! │  4            │  1     │  Major version: 0x01                │
//! │  5            │  1     │  Minor version: 0x00                │
//! │  6            │  2     │  Flags (u16 BE, zero)               │
//! │  8            │  8     │  Index offset (u64 BE, 0 = none)    │
//! │  16           │  8     │  Data offset (u64 BE)               │
//! │  24           │  8     │  Record count (u64 BE)              │
//! │  32           │  ...   │  Records: id(16) ‖ size(u32 BE) ‖   │
//! │               │        │  payload                            │
//! │  data offset  │  32*N  │  Index entries: id(16) ‖ offset(8)  │
//! │               │        │  ‖ size(4) ‖ crc32(4), until EOF    │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Appends land at the data offset, overwriting any previous index block;
//! `flush` writes a fresh index block past the records, truncates there,
//! and rewrites the header. Mutations are durable only after a `flush`.
//! Records on disk but absent from the index are dead and are reclaimed by
//! `compact`.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::btree::{BTreeIndex, Key, RecordLocation};
use crate::codec::{self, CodecError, Value};
use crate::crc32::crc32;

const MAGIC: [u8; 4] = *b"DOWE";
const VERSION_MAJOR: u8 = 1;
const VERSION_MINOR: u8 = 0;

/// Fixed header length.
pub const HEADER_SIZE: u64 = 32;

/// Per-record framing: 16-byte id plus u32 payload size.
const RECORD_HEADER_SIZE: u64 = 20;

/// id(16) + offset(8) + size(4) + crc(4).
const INDEX_ENTRY_SIZE: usize = 32;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("{}: not a record store (bad magic)", .0.display())]
    InvalidMagic(PathBuf),

    #[error("unsupported store version {major}.{minor}")]
    UnsupportedVersion { major: u8, minor: u8 },

    #[error("record {id} not found")]
    NotFound { id: String },

    #[error("record {id} failed checksum verification")]
    Corruption { id: String },

    #[error("malformed record id {0:?}")]
    MalformedId(String),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// An open record store file plus its in-memory index.
#[derive(Debug)]
pub struct Storage {
    path: PathBuf,
    file: File,
    index: BTreeIndex,
    data_offset: u64,
    record_count: u64,
}

impl Storage {
    /// Opens a store file, creating it with a fresh header if missing.
    ///
    /// When the header carries an index offset, the trailing index block is
    /// loaded into the in-memory tree; otherwise the index starts empty and
    /// any record bytes present are considered dead.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let file_len = file.metadata()?.len();
        if file_len == 0 {
            let mut storage = Self {
                path,
                file,
                index: BTreeIndex::new(),
                data_offset: HEADER_SIZE,
                record_count: 0,
            };
            storage.write_header(0)?;
            storage.file.sync_data()?;
            return Ok(storage);
        }

        let mut header = [0u8; HEADER_SIZE as usize];
        file.read_exact_at(&mut header, 0)?;

        if header[0..4] != MAGIC {
            return Err(StorageError::InvalidMagic(path));
        }
        let major = header[4];
        let minor = header[5];
        if major != VERSION_MAJOR {
            return Err(StorageError::UnsupportedVersion { major, minor });
        }

        let index_offset = u64::from_be_bytes(header[8..16].try_into().expect("8 bytes"));
        let data_offset = u64::from_be_bytes(header[16..24].try_into().expect("8 bytes"));
        let record_count = u64::from_be_bytes(header[24..32].try_into().expect("8 bytes"));

        let mut index = BTreeIndex::new();
        if index_offset > 0 && index_offset < file_len {
            let block_len = (file_len - index_offset) as usize;
            let mut block = vec![0u8; block_len];
            file.read_exact_at(&mut block, index_offset)?;
            // Partial trailing entries (torn final write) are ignored.
            for entry in block.chunks_exact(INDEX_ENTRY_SIZE) {
                let mut key: Key = [0u8; 16];
                key.copy_from_slice(&entry[0..16]);
                let offset = u64::from_be_bytes(entry[16..24].try_into().expect("8 bytes"));
                let size = u32::from_be_bytes(entry[24..28].try_into().expect("4 bytes"));
                let checksum = u32::from_be_bytes(entry[28..32].try_into().expect("4 bytes"));
                index.set(key, RecordLocation { offset, size, checksum });
            }
        }

        Ok(Self {
            path,
            file,
            index,
            data_offset,
            record_count,
        })
    }

    /// Number of live records.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }

    /// Ids of all live records, in index order.
    pub fn ids(&self) -> Vec<String> {
        self.index
            .entries()
            .into_iter()
            .map(|(key, _)| Uuid::from_bytes(key).to_string())
            .collect()
    }

    /// Encodes and appends a payload, returning `(id, offset, size)`.
    ///
    /// The record becomes durable at the next [`flush`](Self::flush).
    pub fn write(&mut self, value: &Value) -> Result<(String, u64, u32)> {
        let payload = codec::encode(value)?;
        let size = payload.len() as u32;
        let checksum = crc32(&payload);
        let id = Uuid::new_v4();

        let mut buf = Vec::with_capacity(RECORD_HEADER_SIZE as usize + payload.len());
        buf.extend_from_slice(id.as_bytes());
        buf.extend_from_slice(&size.to_be_bytes());
        buf.extend_from_slice(&payload);

        let offset = self.data_offset;
        self.file.write_all_at(&buf, offset)?;

        self.index.set(*id.as_bytes(), RecordLocation { offset, size, checksum });
        self.data_offset += RECORD_HEADER_SIZE + u64::from(size);
        self.record_count += 1;

        Ok((id.to_string(), offset, size))
    }

    /// Reads and decodes a record, verifying its checksum.
    pub fn read(&self, id: &str) -> Result<Value> {
        let key = parse_id(id)?;
        let location = self
            .index
            .get(&key)
            .ok_or_else(|| StorageError::NotFound { id: id.to_string() })?;

        let payload = self.read_payload(id, location)?;
        Ok(codec::decode(&payload)?)
    }

    fn read_payload(&self, id: &str, location: RecordLocation) -> Result<Vec<u8>> {
        let mut payload = vec![0u8; location.size as usize];
        self.file
            .read_exact_at(&mut payload, location.offset + RECORD_HEADER_SIZE)?;
        if crc32(&payload) != location.checksum {
            return Err(StorageError::Corruption { id: id.to_string() });
        }
        Ok(payload)
    }

    /// Drops a record from the index. The payload bytes stay on disk until
    /// the next compaction.
    pub fn delete(&mut self, id: &str) -> Result<()> {
        let key = parse_id(id)?;
        if self.index.delete(&key).is_none() {
            return Err(StorageError::NotFound { id: id.to_string() });
        }
        self.record_count -= 1;
        Ok(())
    }

    /// Persists the index block and header; truncates past the index.
    pub fn flush(&mut self) -> Result<()> {
        let entries = self.index.entries();
        let mut block = Vec::with_capacity(entries.len() * INDEX_ENTRY_SIZE);
        for (key, location) in &entries {
            block.extend_from_slice(key);
            block.extend_from_slice(&location.offset.to_be_bytes());
            block.extend_from_slice(&location.size.to_be_bytes());
            block.extend_from_slice(&location.checksum.to_be_bytes());
        }

        self.file.write_all_at(&block, self.data_offset)?;
        self.file.set_len(self.data_offset + block.len() as u64)?;
        self.write_header(self.data_offset)?;
        self.file.sync_data()?;
        Ok(())
    }

    fn write_header(&mut self, index_offset: u64) -> Result<()> {
        let mut header = [0u8; HEADER_SIZE as usize];
        header[0..4].copy_from_slice(&MAGIC);
        header[4] = VERSION_MAJOR;
        header[5] = VERSION_MINOR;
        // flags stay zero
        header[8..16].copy_from_slice(&index_offset.to_be_bytes());
        header[16..24].copy_from_slice(&self.data_offset.to_be_bytes());
        header[24..32].copy_from_slice(&self.record_count.to_be_bytes());
        self.file.write_all_at(&header, 0)?;
        Ok(())
    }

    /// Rewrites the file with only live records, reclaiming dead space.
    ///
    /// Live payloads are decoded and re-written into `<path>.tmp`, which is
    /// flushed and renamed over the original. Storage ids are minted fresh;
    /// external identity lives inside the payloads, not in the storage id.
    pub fn compact(&mut self) -> Result<()> {
        let tmp_path = {
            let mut os = self.path.clone().into_os_string();
            os.push(".tmp");
            PathBuf::from(os)
        };
        if tmp_path.exists() {
            std::fs::remove_file(&tmp_path)?;
        }

        let mut replacement = Storage::open(&tmp_path)?;
        for (key, location) in self.index.entries() {
            let id = Uuid::from_bytes(key).to_string();
            let payload = self.read_payload(&id, location)?;
            let value = codec::decode(&payload)?;
            replacement.write(&value)?;
        }
        replacement.flush()?;
        drop(replacement);

        std::fs::rename(&tmp_path, &self.path)?;
        *self = Storage::open(&self.path)?;
        Ok(())
    }
}

fn parse_id(id: &str) -> Result<Key> {
    Uuid::parse_str(id)
        .map(|uuid| *uuid.as_bytes())
        .map_err(|_| StorageError::MalformedId(id.to_string()))
}
