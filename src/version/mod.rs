//! Version set — the durable record of which table files exist at which
//! level.
//!
//! A [`Version`] is an immutable snapshot of the file set. The only way
//! live state changes is by applying a [`VersionEdit`] through
//! [`VersionSet::log_and_apply`]: the edit is appended to the MANIFEST,
//! fsync'ed, folded into a clone of the current version, and the result
//! is published atomically. Readers holding an `Arc<Version>` keep a
//! consistent snapshot for as long as they like.
//!
//! # On-disk layout
//!
//! ```text
//! <table>/CURRENT            one line: name of the active MANIFEST
//! <table>/MANIFEST           append-only log of edit records
//! <table>/sst/<n>.sst        table files, named by file number
//! ```
//!
//! Each MANIFEST record is framed as
//! `[length u32][crc32 u32][type u8 = 1][payload]` with the CRC computed
//! over `type || payload`. Recovery replays records in order and
//! discards a truncated or corrupt tail — an edit that never finished
//! landing was, by definition, never acknowledged.
//!
//! # Level invariants
//!
//! - L0 files may overlap in seq range; the list is kept in min-seq
//!   order, which under append-only writes equals flush order.
//! - L1+ files have pairwise-disjoint seq ranges and are sorted by
//!   min-seq.


use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};

/// Name of the CURRENT pointer file.
pub const CURRENT_FILE: &str = "CURRENT";

/// Default MANIFEST file name (CURRENT points at it).
pub const MANIFEST_FILE: &str = "MANIFEST";

/// Directory holding table files inside a table directory.
pub const SST_DIR: &str = "sst";

/// Number of LSM levels.
pub const MAX_LEVEL: usize = 7;

/// MANIFEST record type tag for a version edit.
const RECORD_TYPE_EDIT: u8 = 1;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by version-set operations.
#[derive(Debug, Error)]
pub enum VersionError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Binary encoding failure.
    #[error("encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// MANIFEST named by CURRENT does not exist.
    #[error("manifest `{0}` named by CURRENT not found")]
    ManifestNotFound(String),

    /// Structural corruption in CURRENT or the MANIFEST.
    #[error("manifest corrupted: {0}")]
    Corrupted(String),

    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// FileMetadata
// ------------------------------------------------------------------------------------------------

/// Descriptor of one table file in the version set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileMetadata {
    /// Monotonic file number; also the file name (`<n>.sst`).
    pub file_number: u64,
    /// Level the file lives at.
    pub level: u32,
    /// File size in bytes.
    pub file_size: u64,
    /// Smallest seq contained.
    pub min_seq: u64,
    /// Largest seq contained.
    pub max_seq: u64,
    /// Number of rows contained.
    pub row_count: u64,
}

impl FileMetadata {
    /// `true` when this file's seq range intersects `[min, max]`.
    pub fn overlaps(&self, min: u64, max: u64) -> bool {
        self.min_seq <= max && min <= self.max_seq
    }
}

impl Encode for FileMetadata {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.file_number.encode_to(buf)?;
        self.level.encode_to(buf)?;
        self.file_size.encode_to(buf)?;
        self.min_seq.encode_to(buf)?;
        self.max_seq.encode_to(buf)?;
        self.row_count.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for FileMetadata {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (file_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (level, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (file_size, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (min_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (max_seq, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        let (row_count, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                file_number,
                level,
                file_size,
                min_seq,
                max_seq,
                row_count,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// VersionEdit
// ------------------------------------------------------------------------------------------------

/// An atomic change to the file set, persisted to the MANIFEST.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionEdit {
    /// Files added by this edit.
    pub added: Vec<FileMetadata>,
    /// `(level, file_number)` pairs removed by this edit.
    pub deleted: Vec<(u32, u64)>,
    /// New file-number watermark, if this edit advances it.
    pub next_file_number: Option<u64>,
}

impl VersionEdit {
    /// Edit that adds a single freshly-flushed L0 file.
    pub fn flush(file: FileMetadata, next_file_number: u64) -> Self {
        Self {
            added: vec![file],
            deleted: Vec::new(),
            next_file_number: Some(next_file_number),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct DeletedFile {
    level: u32,
    file_number: u64,
}

impl Encode for DeletedFile {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.level.encode_to(buf)?;
        self.file_number.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for DeletedFile {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (level, n) = u32::decode_from(&buf[offset..])?;
        offset += n;
        let (file_number, n) = u64::decode_from(&buf[offset..])?;
        offset += n;
        Ok((Self { level, file_number }, offset))
    }
}

impl Encode for VersionEdit {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        encoding::encode_vec(&self.added, buf)?;
        let deleted: Vec<DeletedFile> = self
            .deleted
            .iter()
            .map(|&(level, file_number)| DeletedFile { level, file_number })
            .collect();
        encoding::encode_vec(&deleted, buf)?;
        self.next_file_number.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for VersionEdit {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut offset = 0;
        let (added, n) = encoding::decode_vec::<FileMetadata>(&buf[offset..])?;
        offset += n;
        let (deleted, n) = encoding::decode_vec::<DeletedFile>(&buf[offset..])?;
        offset += n;
        let (next_file_number, n) = Option::<u64>::decode_from(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                added,
                deleted: deleted.into_iter().map(|d| (d.level, d.file_number)).collect(),
                next_file_number,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Version
// ------------------------------------------------------------------------------------------------

/// An immutable snapshot of the file set.
#[derive(Debug, Default, Clone)]
pub struct Version {
    files: [Vec<Arc<FileMetadata>>; MAX_LEVEL],
}

impl Version {
    /// Files at the given level, in min-seq order.
    pub fn level(&self, n: usize) -> &[Arc<FileMetadata>] {
        &self.files[n]
    }

    /// All `(level, files)` pairs.
    pub fn levels(&self) -> impl Iterator<Item = (usize, &[Arc<FileMetadata>])> {
        self.files.iter().enumerate().map(|(n, v)| (n, v.as_slice()))
    }

    /// Total number of files across all levels.
    pub fn file_count(&self) -> usize {
        self.files.iter().map(Vec::len).sum()
    }

    /// Number of files per level.
    pub fn files_per_level(&self) -> Vec<usize> {
        self.files.iter().map(Vec::len).collect()
    }

    /// Sum of file sizes at a level.
    pub fn level_bytes(&self, n: usize) -> u64 {
        self.files[n].iter().map(|f| f.file_size).sum()
    }

    /// Sum of row counts across all files.
    pub fn total_rows(&self) -> u64 {
        self.files.iter().flatten().map(|f| f.row_count).sum()
    }

    /// Largest seq covered by any file (0 when empty).
    pub fn max_seq(&self) -> u64 {
        self.files
            .iter()
            .flatten()
            .map(|f| f.max_seq)
            .max()
            .unwrap_or(0)
    }

    /// Largest file number referenced (0 when empty).
    pub fn max_file_number(&self) -> u64 {
        self.files
            .iter()
            .flatten()
            .map(|f| f.file_number)
            .max()
            .unwrap_or(0)
    }

    /// File numbers of every live file.
    pub fn live_file_numbers(&self) -> std::collections::HashSet<u64> {
        self.files.iter().flatten().map(|f| f.file_number).collect()
    }

    /// Applies an edit, producing the successor version.
    fn apply(&self, edit: &VersionEdit) -> Result<Version, VersionError> {
        let mut next = self.clone();

        for &(level, file_number) in &edit.deleted {
            let level = level as usize;
            if level >= MAX_LEVEL {
                return Err(VersionError::Corrupted(format!(
                    "edit deletes from level {level}"
                )));
            }
            next.files[level].retain(|f| f.file_number != file_number);
        }

        for file in &edit.added {
            let level = file.level as usize;
            if level >= MAX_LEVEL {
                return Err(VersionError::Corrupted(format!(
                    "edit adds to level {level}"
                )));
            }
            next.files[level].push(Arc::new(file.clone()));
        }

        for level in next.files.iter_mut() {
            level.sort_by_key(|f| (f.min_seq, f.file_number));
        }

        Ok(next)
    }
}

// ------------------------------------------------------------------------------------------------
// VersionSet
// ------------------------------------------------------------------------------------------------

/// Owns the MANIFEST and the current published [`Version`].
#[derive(Debug)]
pub struct VersionSet {
    dir: PathBuf,
    /// MANIFEST handle; the lock also serializes log_and_apply.
    manifest: Mutex<File>,
    current: RwLock<Arc<Version>>,
    next_file_number: AtomicU64,
}

impl VersionSet {
    /// Opens the version set rooted at a table directory.
    ///
    /// Creates `CURRENT`, the MANIFEST, and the `sst/` directory when
    /// missing; otherwise replays the MANIFEST (discarding a torn tail)
    /// to rebuild the current version.
    pub fn open(table_dir: impl AsRef<Path>) -> Result<Self, VersionError> {
        let dir = table_dir.as_ref().to_path_buf();
        fs::create_dir_all(dir.join(SST_DIR))?;

        let current_path = dir.join(CURRENT_FILE);
        let manifest_name = if current_path.exists() {
            let mut name = String::new();
            File::open(&current_path)?.read_to_string(&mut name)?;
            let name = name.trim().to_string();
            if name.is_empty() {
                return Err(VersionError::Corrupted("CURRENT is empty".into()));
            }
            name
        } else {
            let mut f = File::create(&current_path)?;
            f.write_all(MANIFEST_FILE.as_bytes())?;
            f.write_all(b"\n")?;
            f.sync_all()?;
            MANIFEST_FILE.to_string()
        };

        let manifest_path = dir.join(&manifest_name);
        let existed = manifest_path.exists();
        if !existed && manifest_name != MANIFEST_FILE {
            return Err(VersionError::ManifestNotFound(manifest_name));
        }

        let mut version = Version::default();
        let mut next_file_number = 1u64;

        if existed {
            let bytes = fs::read(&manifest_path)?;
            let (replayed, edits) = replay_manifest(&bytes, &mut version)?;
            if replayed < bytes.len() {
                warn!(
                    valid = replayed,
                    total = bytes.len(),
                    "discarding torn MANIFEST tail"
                );
            }
            for edit_next in edits {
                next_file_number = next_file_number.max(edit_next);
            }
            next_file_number = next_file_number.max(version.max_file_number() + 1);
            info!(
                files = version.file_count(),
                next_file_number, "version set recovered"
            );
        }

        let manifest = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&manifest_path)?;

        Ok(Self {
            dir,
            manifest: Mutex::new(manifest),
            current: RwLock::new(Arc::new(version)),
            next_file_number: AtomicU64::new(next_file_number),
        })
    }

    /// The currently published version.
    pub fn current(&self) -> Arc<Version> {
        self.current
            .read()
            .map(|v| Arc::clone(&v))
            .unwrap_or_default()
    }

    /// Allocates the next file number.
    pub fn allocate_file_number(&self) -> u64 {
        self.next_file_number.fetch_add(1, Ordering::SeqCst)
    }

    /// File-number watermark (the next number that would be allocated).
    pub fn next_file_number(&self) -> u64 {
        self.next_file_number.load(Ordering::SeqCst)
    }

    /// Path of the table file with the given number.
    pub fn sst_path(&self, file_number: u64) -> PathBuf {
        self.dir.join(SST_DIR).join(format!("{file_number:06}.sst"))
    }

    /// Appends the edit to the MANIFEST (fsync'ed), folds it into the
    /// current version, and publishes the successor atomically.
    pub fn log_and_apply(&self, edit: VersionEdit) -> Result<Arc<Version>, VersionError> {
        let payload = encoding::encode_to_vec(&edit)?;

        let mut framed = Vec::with_capacity(payload.len() + 9);
        let length = (payload.len() + 1) as u32;
        framed.extend_from_slice(&length.to_le_bytes());
        let mut hasher = Crc32::new();
        hasher.update(&[RECORD_TYPE_EDIT]);
        hasher.update(&payload);
        framed.extend_from_slice(&hasher.finalize().to_le_bytes());
        framed.push(RECORD_TYPE_EDIT);
        framed.extend_from_slice(&payload);

        // The manifest lock is held across append + publish so edits are
        // applied in exactly the order they are logged.
        let mut manifest = self
            .manifest
            .lock()
            .map_err(|_| VersionError::Internal("manifest mutex poisoned".into()))?;
        manifest.write_all(&framed)?;
        manifest.sync_all()?;

        let next = {
            let current = self.current();
            Arc::new(current.apply(&edit)?)
        };

        {
            let mut slot = self
                .current
                .write()
                .map_err(|_| VersionError::Internal("version lock poisoned".into()))?;
            *slot = Arc::clone(&next);
        }

        if let Some(n) = edit.next_file_number {
            self.next_file_number.fetch_max(n, Ordering::SeqCst);
        }

        debug!(
            added = edit.added.len(),
            deleted = edit.deleted.len(),
            files = next.file_count(),
            "version edit applied"
        );
        Ok(next)
    }
}

/// Replays MANIFEST bytes into `version`.
///
/// Returns the number of bytes consumed by valid records and the
/// `next_file_number` watermarks seen. A torn or corrupt tail terminates
/// replay without error.
fn replay_manifest(bytes: &[u8], version: &mut Version) -> Result<(usize, Vec<u64>), VersionError> {
    let mut offset = 0usize;
    let mut watermarks = Vec::new();

    while offset < bytes.len() {
        if bytes.len() - offset < 8 {
            break; // torn frame header
        }
        let length = u32::from_le_bytes([
            bytes[offset],
            bytes[offset + 1],
            bytes[offset + 2],
            bytes[offset + 3],
        ]) as usize;
        let stored_crc = u32::from_le_bytes([
            bytes[offset + 4],
            bytes[offset + 5],
            bytes[offset + 6],
            bytes[offset + 7],
        ]);
        if length == 0 || bytes.len() - offset - 8 < length {
            break; // torn payload
        }

        let body = &bytes[offset + 8..offset + 8 + length];
        let mut hasher = Crc32::new();
        hasher.update(body);
        if hasher.finalize() != stored_crc {
            break; // corrupt tail
        }

        if body[0] != RECORD_TYPE_EDIT {
            return Err(VersionError::Corrupted(format!(
                "unknown manifest record type {}",
                body[0]
            )));
        }

        let (edit, _) = VersionEdit::decode_from(&body[1..])?;
        *version = version.apply(&edit)?;
        if let Some(n) = edit.next_file_number {
            watermarks.push(n);
        }
        offset += 8 + length;
    }

    Ok((offset, watermarks))
}
