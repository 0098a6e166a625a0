//! Persistent secondary indexes.
//!
//! Each indexed field owns one `idx_<field>.sst` file mapping canonical
//! value strings to sorted seq lists (see [`btree`] for the on-disk
//! format). At runtime an index is the union of two layers:
//!
//! - an in-memory `BTreeMap` accumulating [`SecondaryIndex::add`] calls,
//! - the persisted B+-tree from the last [`SecondaryIndex::build`].
//!
//! [`SecondaryIndex::get`] reads both layers and unions the seq sets;
//! [`SecondaryIndex::for_each`] / [`for_each_desc`](SecondaryIndex::for_each_desc)
//! iterate **persisted data only** — entries added but not yet built are
//! invisible to iteration. `build` folds the persisted tree into the
//! in-memory map first, so repeated builds always include both old and
//! new entries.
//!
//! # Staleness and repair
//!
//! The metadata block records the highest seq the index has absorbed.
//! After a restart [`SecondaryIndex::needs_update`] compares it against
//! the engine's current max seq, and
//! [`SecondaryIndex::incremental_update`] walks the missing range with a
//! row-fetching callback — seqs that no longer resolve (WAL-tail gaps)
//! are skipped silently.
//!
//! # Legacy format
//!
//! A file that does not start with the tree magic is attempted as the
//! legacy JSON blob (`{metadata, value → [seq]}`). Legacy-loaded indexes
//! are **read-only**: `add`, `build`, and `incremental_update` refuse
//! with [`IndexError::LegacyFormat`] until [`SecondaryIndex::rebuild`]
//! repopulates the index from scratch, after which it is written in the
//! tree format.

mod btree;

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::ops::ControlFlow;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::schema::{FieldType, Value};

pub(crate) use btree::{INDEX_MAGIC, INDEX_VERSION};

/// File name of the index for a field.
pub fn index_file_name(field: &str) -> String {
    format!("idx_{field}.sst")
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by secondary-index operations.
#[derive(Debug, Error)]
pub enum IndexError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Binary encoding failure inside the tree file.
    #[error("encoding error: {0}")]
    Encoding(#[from] crate::encoding::EncodingError),

    /// Legacy JSON parse failure.
    #[error("index json error: {0}")]
    Json(#[from] serde_json::Error),

    /// File is neither a tree nor parseable legacy JSON.
    #[error("index corrupted: {0}")]
    Corrupted(String),

    /// Footer checksum mismatch.
    #[error("index checksum mismatch")]
    ChecksumMismatch,

    /// File does not carry the index magic.
    #[error("invalid index magic number")]
    InvalidMagicNumber,

    /// File written by an unknown format version.
    #[error("unsupported index version {0}")]
    UnsupportedVersion(u16),

    /// On-disk field type disagrees with the schema.
    #[error("index field type tag {file} does not match schema tag {schema}")]
    FieldTypeMismatch {
        /// Tag stored in the file.
        file: u16,
        /// Tag the schema declares.
        schema: u16,
    },

    /// Index was loaded from the legacy JSON format and is read-only.
    #[error("legacy-format index is read-only until rebuilt")]
    LegacyFormat,
}

// ------------------------------------------------------------------------------------------------
// Metadata
// ------------------------------------------------------------------------------------------------

/// Index metadata block, persisted in both formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Format version.
    pub version: u32,
    /// Smallest seq absorbed (0 when empty).
    pub min_seq: u64,
    /// Largest seq absorbed (0 when empty).
    pub max_seq: u64,
    /// Number of `(value, seq)` pairs absorbed.
    pub row_count: u64,
    /// Creation time, nanoseconds since the UNIX epoch.
    pub created_at: i64,
    /// Last update time, nanoseconds since the UNIX epoch.
    pub updated_at: i64,
}

impl IndexMetadata {
    fn new() -> Self {
        let now = now_nanos();
        Self {
            version: 1,
            min_seq: 0,
            max_seq: 0,
            row_count: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Legacy on-disk representation: one JSON blob.
#[derive(Debug, Serialize, Deserialize)]
struct LegacyIndexFile {
    metadata: IndexMetadata,
    entries: BTreeMap<String, Vec<u64>>,
}

// ------------------------------------------------------------------------------------------------
// SecondaryIndex
// ------------------------------------------------------------------------------------------------

/// A per-field secondary index: in-memory additions over a persisted
/// B+-tree, with crash-consistent metadata.
#[derive(Debug)]
pub struct SecondaryIndex {
    field: String,
    field_type: FieldType,
    path: PathBuf,
    entries: BTreeMap<String, Vec<u64>>,
    metadata: IndexMetadata,
    reader: Option<btree::TreeReader>,
    legacy: bool,
}

impl SecondaryIndex {
    /// Opens the index for `field`, loading whatever is on disk.
    ///
    /// An empty or missing file starts a fresh index. A file starting
    /// with the tree magic is loaded as a B+-tree; anything else is
    /// attempted as the legacy JSON blob (read-only). Unparseable data
    /// is `Corrupted`.
    pub fn open(
        table_dir: impl AsRef<Path>,
        field: impl Into<String>,
        field_type: FieldType,
    ) -> Result<Self, IndexError> {
        let field = field.into();
        let path = table_dir.as_ref().join(index_file_name(&field));

        let file_len = match fs::metadata(&path) {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if file_len == 0 {
            debug!(field = %field, path = %path.display(), "fresh secondary index");
            return Ok(Self {
                field,
                field_type,
                path,
                entries: BTreeMap::new(),
                metadata: IndexMetadata::new(),
                reader: None,
                legacy: false,
            });
        }

        let head = {
            let bytes = fs::read(&path)?;
            if bytes.len() >= 4 {
                [bytes[0], bytes[1], bytes[2], bytes[3]]
            } else {
                [0u8; 4]
            }
        };

        if head == INDEX_MAGIC {
            let reader = btree::TreeReader::open(&path)?;
            if reader.field_type_tag() != field_type.tag() as u16 {
                return Err(IndexError::FieldTypeMismatch {
                    file: reader.field_type_tag(),
                    schema: field_type.tag() as u16,
                });
            }
            let metadata = *reader.metadata();
            info!(field = %field, rows = metadata.row_count, max_seq = metadata.max_seq, "index loaded");
            return Ok(Self {
                field,
                field_type,
                path,
                entries: BTreeMap::new(),
                metadata,
                reader: Some(reader),
                legacy: false,
            });
        }

        // Legacy fallback: a single JSON blob.
        let bytes = fs::read(&path)?;
        match serde_json::from_slice::<LegacyIndexFile>(&bytes) {
            Ok(legacy) => {
                warn!(
                    field = %field,
                    rows = legacy.metadata.row_count,
                    "index loaded from legacy json; read-only until rebuilt"
                );
                Ok(Self {
                    field,
                    field_type,
                    path,
                    entries: legacy.entries,
                    metadata: legacy.metadata,
                    reader: None,
                    legacy: true,
                })
            }
            Err(_) => Err(IndexError::Corrupted(format!(
                "index file for `{field}` is neither tree-format nor legacy json"
            ))),
        }
    }

    /// Field this index covers.
    pub fn field(&self) -> &str {
        &self.field
    }

    /// Current metadata.
    pub fn metadata(&self) -> &IndexMetadata {
        &self.metadata
    }

    /// `true` when the index was loaded from the legacy JSON format.
    pub fn is_legacy(&self) -> bool {
        self.legacy
    }

    /// Records `seq` under the value's canonical string. O(1) amortized;
    /// nothing is persisted until [`build`](Self::build).
    ///
    /// `Null` values are not indexed and are silently skipped.
    pub fn add(&mut self, value: &Value, seq: u64) -> Result<(), IndexError> {
        if self.legacy {
            return Err(IndexError::LegacyFormat);
        }
        let Some(key) = value.index_key() else {
            return Ok(());
        };

        self.entries.entry(key).or_default().push(seq);

        if self.metadata.row_count == 0 || seq < self.metadata.min_seq {
            self.metadata.min_seq = seq;
        }
        self.metadata.max_seq = self.metadata.max_seq.max(seq);
        self.metadata.row_count += 1;
        self.metadata.updated_at = now_nanos();
        Ok(())
    }

    /// Persists the index: folds the previously persisted tree into the
    /// in-memory map, rewrites the file as a B+-tree, and reloads the
    /// reader. The in-memory map is retained, so later builds include
    /// both old and new entries.
    pub fn build(&mut self) -> Result<(), IndexError> {
        if self.legacy {
            return Err(IndexError::LegacyFormat);
        }

        if let Some(reader) = self.reader.take() {
            reader.fold_into(&mut self.entries)?;
        }
        for seqs in self.entries.values_mut() {
            seqs.sort_unstable();
            seqs.dedup();
        }

        self.metadata.updated_at = now_nanos();
        btree::write_tree(
            &self.path,
            self.field_type,
            &self.metadata,
            self.entries.iter(),
        )?;
        self.reader = Some(btree::TreeReader::open(&self.path)?);

        debug!(
            field = %self.field,
            values = self.entries.len(),
            rows = self.metadata.row_count,
            "index built"
        );
        Ok(())
    }

    /// Returns the deduplicated seq set for a value, unioning the
    /// in-memory map and the persisted tree. The result is sorted by
    /// seq, though callers must not rely on any particular order.
    pub fn get(&self, value: &Value) -> Result<Vec<u64>, IndexError> {
        let Some(key) = value.index_key() else {
            return Ok(Vec::new());
        };
        self.get_key(&key)
    }

    /// [`get`](Self::get) by pre-computed canonical string.
    pub fn get_key(&self, key: &str) -> Result<Vec<u64>, IndexError> {
        let mut seqs: Vec<u64> = self.entries.get(key).cloned().unwrap_or_default();
        if let Some(reader) = &self.reader
            && let Some(persisted) = reader.get(key)?
        {
            seqs.extend(persisted);
        }
        seqs.sort_unstable();
        seqs.dedup();
        Ok(seqs)
    }

    /// Visits persisted `(value, seqs)` entries in ascending value order.
    ///
    /// Entries added since the last build are **not** visited. Return
    /// `ControlFlow::Break(())` to stop early.
    pub fn for_each(
        &self,
        f: impl FnMut(&str, &[u64]) -> ControlFlow<()>,
    ) -> Result<(), IndexError> {
        match &self.reader {
            Some(reader) => reader.for_each(f),
            None if self.legacy => {
                let mut f = f;
                for (key, seqs) in &self.entries {
                    if f(key, seqs).is_break() {
                        break;
                    }
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Visits persisted entries in descending value order.
    pub fn for_each_desc(
        &self,
        f: impl FnMut(&str, &[u64]) -> ControlFlow<()>,
    ) -> Result<(), IndexError> {
        match &self.reader {
            Some(reader) => reader.for_each_desc(f),
            None if self.legacy => {
                let mut f = f;
                for (key, seqs) in self.entries.iter().rev() {
                    if f(key, seqs).is_break() {
                        break;
                    }
                }
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// `true` when rows beyond the index's high-water mark exist.
    pub fn needs_update(&self, current_max_seq: u64) -> bool {
        self.metadata.max_seq < current_max_seq
    }

    /// Absorbs rows `metadata.max_seq + 1 ..= current_max_seq` using the
    /// given fetcher, then builds.
    ///
    /// The fetcher returns the indexed field's value for a seq, or `None`
    /// when the row does not exist — gaps from tail-corruption recovery
    /// are expected and skipped silently. Returns the number of values
    /// absorbed.
    pub fn incremental_update(
        &mut self,
        current_max_seq: u64,
        mut fetch: impl FnMut(u64) -> Option<Value>,
    ) -> Result<usize, IndexError> {
        if self.legacy {
            return Err(IndexError::LegacyFormat);
        }
        let start = self.metadata.max_seq + 1;
        if start > current_max_seq {
            return Ok(0);
        }

        let mut absorbed = 0usize;
        for seq in start..=current_max_seq {
            if let Some(value) = fetch(seq) {
                self.add(&value, seq)?;
                absorbed += 1;
            }
        }

        // The watermark advances even across gaps and nulls, otherwise a
        // missing tail row would force a rescan on every open.
        self.metadata.max_seq = self.metadata.max_seq.max(current_max_seq);
        self.build()?;

        info!(
            field = %self.field,
            absorbed,
            max_seq = current_max_seq,
            "index incrementally updated"
        );
        Ok(absorbed)
    }

    /// Discards all state (including a legacy payload) and re-absorbs
    /// rows `1 ..= current_max_seq` from the fetcher, writing the result
    /// in the tree format. This is the migration path off the legacy
    /// JSON format.
    pub fn rebuild(
        &mut self,
        current_max_seq: u64,
        mut fetch: impl FnMut(u64) -> Option<Value>,
    ) -> Result<usize, IndexError> {
        self.entries.clear();
        self.reader = None;
        self.legacy = false;
        self.metadata = IndexMetadata::new();

        let mut absorbed = 0usize;
        for seq in 1..=current_max_seq {
            if let Some(value) = fetch(seq) {
                self.add(&value, seq)?;
                absorbed += 1;
            }
        }
        self.metadata.max_seq = self.metadata.max_seq.max(current_max_seq);
        self.build()?;

        info!(field = %self.field, absorbed, "index rebuilt");
        Ok(absorbed)
    }
}
