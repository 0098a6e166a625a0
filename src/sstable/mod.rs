//! Sorted tables — immutable, seq-ordered, on-disk row files.
//!
//! A sorted table holds a contiguous stream of encoded records in
//! ascending seq order, followed by the structures needed to find them
//! again: a sparse `seq → offset` index sampled every N records, the
//! dense key list, and a checksummed metadata block.
//!
//! # On-disk layout
//!
//! ```text
//! HEADER: magic(4) | version(u16) | flags(u16)
//! BODY:   record[0] || record[1] || …            (seq-ascending)
//! SPARSE: (seq u64, offset u64) every N records
//! KEYS:   count(u64) | seq[0] u64 | seq[1] u64 | …
//! META:   min_seq | max_seq | row_count | sparse_off | keys_off | meta_off
//! FOOTER: meta_off u64 | magic(4) | crc32(u32)
//! ```
//!
//! All integers are little-endian. The footer CRC covers the META block.
//! Records carry their own CRC32 (see [`crate::record`]), so the body is
//! verified lazily as records are decoded.
//!
//! # Reading
//!
//! [`TableReader`] memory-maps the file, validates magic / version /
//! footer checksum on open, and loads META, SPARSE, and KEYS into memory.
//! A point lookup binary-searches the key list for membership, then
//! binary-searches the sparse index for the nearest preceding offset and
//! scans forward at most N records.
//!
//! # Concurrency
//!
//! Tables are immutable, so readers are lock-free and share one mmap via
//! [`TableCache`] handles. Deleting the file path after compaction never
//! invalidates a live reader.

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::{TableBuildSummary, TableWriter};

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crc32fast::Hasher as Crc32;
use memmap2::Mmap;
use thiserror::Error;
use tracing::{debug, trace};

use crate::encoding::EncodingError;
use crate::record::RecordError;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

pub(crate) const SST_MAGIC: [u8; 4] = *b"SRTB";
pub(crate) const SST_VERSION: u16 = 1;
pub(crate) const SST_HEADER_SIZE: usize = 8;
pub(crate) const SST_META_SIZE: usize = 48;
pub(crate) const SST_FOOTER_SIZE: usize = 16;
const SPARSE_ENTRY_SIZE: usize = 16;

/// Default sparse-index sampling stride.
pub const DEFAULT_SPARSE_STRIDE: usize = 64;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by sorted-table operations.
#[derive(Debug, Error)]
pub enum SsTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Binary encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Record-level decode failure inside the body.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// File does not start (or end) with the table magic.
    #[error("invalid magic number")]
    InvalidMagicNumber,

    /// File was written by an unknown format version.
    #[error("unsupported sstable version {0}")]
    UnsupportedVersion(u16),

    /// Footer checksum did not match the metadata block.
    #[error("sstable checksum mismatch")]
    ChecksumMismatch,

    /// Structural corruption beyond a checksum failure.
    #[error("sstable corrupted: {0}")]
    Corrupted(String),

    /// Writer received seqs out of order.
    #[error("non-monotonic seq {seq} (last written {last})")]
    NonMonotonicSeq {
        /// Offending seq.
        seq: u64,
        /// Previously written seq.
        last: u64,
    },

    /// Point lookup missed.
    #[error("seq {0} not found")]
    NotFound(u64),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

impl SsTableError {
    /// `true` for errors that indicate on-disk damage rather than a
    /// transient I/O condition.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            SsTableError::InvalidMagicNumber
                | SsTableError::UnsupportedVersion(_)
                | SsTableError::ChecksumMismatch
                | SsTableError::Corrupted(_)
                | SsTableError::Record(_)
        )
    }
}

// ------------------------------------------------------------------------------------------------
// Metadata
// ------------------------------------------------------------------------------------------------

/// Decoded META block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct TableMeta {
    pub min_seq: u64,
    pub max_seq: u64,
    pub row_count: u64,
    pub sparse_off: u64,
    pub keys_off: u64,
    pub meta_off: u64,
}

impl TableMeta {
    fn encode(&self) -> [u8; SST_META_SIZE] {
        let mut buf = [0u8; SST_META_SIZE];
        for (i, v) in [
            self.min_seq,
            self.max_seq,
            self.row_count,
            self.sparse_off,
            self.keys_off,
            self.meta_off,
        ]
        .iter()
        .enumerate()
        {
            buf[i * 8..i * 8 + 8].copy_from_slice(&v.to_le_bytes());
        }
        buf
    }

    fn decode(buf: &[u8]) -> Result<Self, SsTableError> {
        if buf.len() < SST_META_SIZE {
            return Err(SsTableError::Corrupted("short metadata block".into()));
        }
        let word = |i: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&buf[i * 8..i * 8 + 8]);
            u64::from_le_bytes(b)
        };
        Ok(Self {
            min_seq: word(0),
            max_seq: word(1),
            row_count: word(2),
            sparse_off: word(3),
            keys_off: word(4),
            meta_off: word(5),
        })
    }
}

// ------------------------------------------------------------------------------------------------
// TableReader
// ------------------------------------------------------------------------------------------------

/// A fully memory-mapped, immutable sorted table.
pub struct TableReader {
    /// File number assigned by the version set; 0 until the owner sets it.
    file_number: u64,
    mmap: Mmap,
    meta: TableMeta,
    keys: Vec<u64>,
    sparse: Vec<(u64, u64)>,
    file_size: u64,
}

impl std::fmt::Debug for TableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableReader")
            .field("file_number", &self.file_number)
            .field("meta", &self.meta)
            .field("file_size", &self.file_size)
            .finish_non_exhaustive()
    }
}

impl TableReader {
    /// Opens a sorted table, validating magic, version, footer checksum,
    /// and the internal consistency of META / KEYS / SPARSE.
    ///
    /// # Safety
    ///
    /// The mmap is sound because tables are immutable once their final
    /// rename lands and the map is read-only.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SsTableError> {
        let path = path.as_ref();
        let file = File::open(path)?;
        let mmap = unsafe { Mmap::map(&file)? };
        let file_len = mmap.len();

        if file_len < SST_HEADER_SIZE + SST_META_SIZE + SST_FOOTER_SIZE {
            return Err(SsTableError::Corrupted("file too small".into()));
        }

        // Header.
        if mmap[..4] != SST_MAGIC {
            return Err(SsTableError::InvalidMagicNumber);
        }
        let version = u16::from_le_bytes([mmap[4], mmap[5]]);
        if version != SST_VERSION {
            return Err(SsTableError::UnsupportedVersion(version));
        }

        // Footer: meta_off u64 | magic(4) | crc(4).
        let footer_start = file_len - SST_FOOTER_SIZE;
        let footer = &mmap[footer_start..];
        let meta_off = u64::from_le_bytes([
            footer[0], footer[1], footer[2], footer[3], footer[4], footer[5], footer[6], footer[7],
        ]) as usize;
        if footer[8..12] != SST_MAGIC {
            return Err(SsTableError::InvalidMagicNumber);
        }
        let stored_crc = u32::from_le_bytes([footer[12], footer[13], footer[14], footer[15]]);

        if meta_off + SST_META_SIZE > footer_start {
            return Err(SsTableError::Corrupted("metadata offset out of range".into()));
        }
        let meta_bytes = &mmap[meta_off..meta_off + SST_META_SIZE];
        let mut hasher = Crc32::new();
        hasher.update(meta_bytes);
        if hasher.finalize() != stored_crc {
            return Err(SsTableError::ChecksumMismatch);
        }

        let meta = TableMeta::decode(meta_bytes)?;
        if meta.meta_off as usize != meta_off {
            return Err(SsTableError::Corrupted("metadata offset mismatch".into()));
        }
        let sparse_off = meta.sparse_off as usize;
        let keys_off = meta.keys_off as usize;
        if sparse_off < SST_HEADER_SIZE || keys_off < sparse_off || meta_off < keys_off {
            return Err(SsTableError::Corrupted("section offsets out of order".into()));
        }

        // Sparse index.
        let sparse_bytes = &mmap[sparse_off..keys_off];
        if sparse_bytes.len() % SPARSE_ENTRY_SIZE != 0 {
            return Err(SsTableError::Corrupted("ragged sparse index".into()));
        }
        let mut sparse = Vec::with_capacity(sparse_bytes.len() / SPARSE_ENTRY_SIZE);
        for chunk in sparse_bytes.chunks_exact(SPARSE_ENTRY_SIZE) {
            let mut seq = [0u8; 8];
            let mut off = [0u8; 8];
            seq.copy_from_slice(&chunk[..8]);
            off.copy_from_slice(&chunk[8..]);
            sparse.push((u64::from_le_bytes(seq), u64::from_le_bytes(off)));
        }

        // Dense key list.
        let keys_bytes = &mmap[keys_off..meta_off];
        if keys_bytes.len() < 8 {
            return Err(SsTableError::Corrupted("short key list".into()));
        }
        let mut count_buf = [0u8; 8];
        count_buf.copy_from_slice(&keys_bytes[..8]);
        let count = u64::from_le_bytes(count_buf) as usize;
        if keys_bytes.len() != 8 + count * 8 {
            return Err(SsTableError::Corrupted("key list length mismatch".into()));
        }
        let mut keys = Vec::with_capacity(count);
        for chunk in keys_bytes[8..].chunks_exact(8) {
            let mut b = [0u8; 8];
            b.copy_from_slice(chunk);
            keys.push(u64::from_le_bytes(b));
        }

        // Cross-checks.
        if count as u64 != meta.row_count {
            return Err(SsTableError::Corrupted("row count mismatch".into()));
        }
        if !keys.windows(2).all(|w| w[0] < w[1]) {
            return Err(SsTableError::Corrupted("keys not strictly ascending".into()));
        }
        if let (Some(first), Some(last)) = (keys.first(), keys.last())
            && (*first != meta.min_seq || *last != meta.max_seq)
        {
            return Err(SsTableError::Corrupted("seq bounds mismatch".into()));
        }

        debug!(
            path = %path.display(),
            rows = meta.row_count,
            min_seq = meta.min_seq,
            max_seq = meta.max_seq,
            "sstable opened"
        );

        Ok(Self {
            file_number: 0,
            mmap,
            meta,
            keys,
            sparse,
            file_size: file_len as u64,
        })
    }

    /// Sets the version-set file number of this table.
    pub fn set_file_number(&mut self, n: u64) {
        self.file_number = n;
    }

    /// File number assigned by the version set.
    pub fn file_number(&self) -> u64 {
        self.file_number
    }

    /// Smallest seq in the table.
    pub fn min_seq(&self) -> u64 {
        self.meta.min_seq
    }

    /// Largest seq in the table.
    pub fn max_seq(&self) -> u64 {
        self.meta.max_seq
    }

    /// Number of rows.
    pub fn row_count(&self) -> u64 {
        self.meta.row_count
    }

    /// Total file size in bytes.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    /// The dense, ascending key list.
    pub fn all_keys(&self) -> &[u64] {
        &self.keys
    }

    /// `true` when the table contains the seq.
    pub fn contains(&self, seq: u64) -> bool {
        self.keys.binary_search(&seq).is_ok()
    }

    /// Point lookup: returns the encoded record bytes for `seq`.
    ///
    /// Binary-searches the key list for membership, then the sparse index
    /// for the nearest preceding offset, and scans forward from there.
    pub fn get(&self, seq: u64) -> Result<Vec<u8>, SsTableError> {
        if self.keys.binary_search(&seq).is_err() {
            return Err(SsTableError::NotFound(seq));
        }

        // Nearest sparse entry at or before `seq`.
        let idx = self.sparse.partition_point(|(s, _)| *s <= seq);
        let mut offset = if idx == 0 {
            SST_HEADER_SIZE
        } else {
            self.sparse[idx - 1].1 as usize
        };
        let body_end = self.meta.sparse_off as usize;

        while offset < body_end {
            let record = self.record_at(offset, body_end)?;
            let record_seq = crate::record::RowCodec::record_seq(record)?;
            trace!(seq, record_seq, offset, "sstable scan step");
            match record_seq.cmp(&seq) {
                std::cmp::Ordering::Equal => return Ok(record.to_vec()),
                std::cmp::Ordering::Greater => break,
                std::cmp::Ordering::Less => offset += record.len(),
            }
        }

        // The key list said the seq exists; reaching here means the body
        // disagrees with the index structures.
        Err(SsTableError::Corrupted(format!(
            "seq {seq} present in key list but missing from body"
        )))
    }

    fn record_at(&self, offset: usize, body_end: usize) -> Result<&[u8], SsTableError> {
        if offset + 4 > body_end {
            return Err(SsTableError::Corrupted("record header out of bounds".into()));
        }
        let total = crate::record::RowCodec::record_len(&self.mmap[offset..body_end])?;
        if offset + total > body_end {
            return Err(SsTableError::Corrupted("record overruns body".into()));
        }
        Ok(&self.mmap[offset..offset + total])
    }

    /// Streaming cursor over `(seq, record bytes)` in ascending seq order.
    pub fn iter_records(&self) -> RecordCursor<'_> {
        RecordCursor {
            table: self,
            offset: SST_HEADER_SIZE,
        }
    }
}

/// Sequential record cursor used by compaction and verification.
pub struct RecordCursor<'a> {
    table: &'a TableReader,
    offset: usize,
}

impl<'a> Iterator for RecordCursor<'a> {
    type Item = Result<(u64, &'a [u8]), SsTableError>;

    fn next(&mut self) -> Option<Self::Item> {
        let body_end = self.table.meta.sparse_off as usize;
        if self.offset >= body_end {
            return None;
        }
        match self.table.record_at(self.offset, body_end) {
            Ok(record) => {
                self.offset += record.len();
                match crate::record::RowCodec::record_seq(record) {
                    Ok(seq) => Some(Ok((seq, record))),
                    Err(e) => {
                        // A record whose framing cannot be trusted poisons
                        // everything after it; fuse the cursor.
                        self.offset = body_end;
                        Some(Err(e.into()))
                    }
                }
            }
            Err(e) => {
                self.offset = body_end;
                Some(Err(e))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TableCache
// ------------------------------------------------------------------------------------------------

/// Shared, refcounted open-table handles keyed by file number.
///
/// Readers hold `Arc<TableReader>`s, so evicting (or deleting the file
/// behind) a table never invalidates an in-flight read.
#[derive(Debug, Default)]
pub struct TableCache {
    tables: Mutex<HashMap<u64, Arc<TableReader>>>,
}

impl TableCache {
    /// Creates an empty cache.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached reader for `file_number`, opening `path` on a
    /// miss.
    pub fn get_or_open(
        &self,
        file_number: u64,
        path: &PathBuf,
    ) -> Result<Arc<TableReader>, SsTableError> {
        let mut tables = self
            .tables
            .lock()
            .map_err(|_| SsTableError::Internal("table cache mutex poisoned".into()))?;
        if let Some(reader) = tables.get(&file_number) {
            return Ok(Arc::clone(reader));
        }
        let mut reader = TableReader::open(path)?;
        reader.set_file_number(file_number);
        let reader = Arc::new(reader);
        tables.insert(file_number, Arc::clone(&reader));
        Ok(reader)
    }

    /// Drops cached handles for the given file numbers.
    pub fn evict(&self, file_numbers: &[u64]) {
        if let Ok(mut tables) = self.tables.lock() {
            for n in file_numbers {
                tables.remove(n);
            }
        }
    }
}
