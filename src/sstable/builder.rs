//! Sorted-table writer.
//!
//! [`TableWriter`] consumes encoded records in strictly increasing seq
//! order and produces a complete table file: header, record body, sparse
//! index, dense key list, metadata, and checksummed footer.
//!
//! # Atomicity
//!
//! Everything is written to `<path>.tmp`, fsync'ed, and renamed onto the
//! final path by [`TableWriter::finish`]. A crash mid-build leaves only a
//! `.tmp` file that recovery ignores; [`TableWriter::abandon`] removes it
//! eagerly when a build is cancelled.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use crc32fast::Hasher as Crc32;
use tracing::{debug, warn};

use super::{SST_HEADER_SIZE, SST_MAGIC, SST_VERSION, SsTableError, TableMeta};

/// Summary returned by a successful [`TableWriter::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableBuildSummary {
    /// Rows written.
    pub row_count: u64,
    /// Smallest seq written.
    pub min_seq: u64,
    /// Largest seq written.
    pub max_seq: u64,
    /// Final file size in bytes.
    pub file_size: u64,
}

/// Streams records into a new sorted-table file.
pub struct TableWriter {
    final_path: PathBuf,
    tmp_path: PathBuf,
    writer: BufWriter<File>,
    offset: u64,
    stride: usize,
    keys: Vec<u64>,
    sparse: Vec<(u64, u64)>,
    finished: bool,
}

impl TableWriter {
    /// Creates a writer targeting `path`, sampling a sparse-index entry
    /// every `stride` records.
    pub fn create(path: impl AsRef<Path>, stride: usize) -> Result<Self, SsTableError> {
        let final_path = path.as_ref().to_path_buf();
        let tmp_path = final_path.with_extension("tmp");

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        let mut writer = BufWriter::new(file);

        writer.write_all(&SST_MAGIC)?;
        writer.write_all(&SST_VERSION.to_le_bytes())?;
        writer.write_all(&0u16.to_le_bytes())?; // flags

        Ok(Self {
            final_path,
            tmp_path,
            writer,
            offset: SST_HEADER_SIZE as u64,
            stride: stride.max(1),
            keys: Vec::new(),
            sparse: Vec::new(),
            finished: false,
        })
    }

    /// Appends one encoded record. Seqs must be strictly increasing.
    pub fn append(&mut self, seq: u64, record: &[u8]) -> Result<(), SsTableError> {
        if let Some(&last) = self.keys.last()
            && seq <= last
        {
            return Err(SsTableError::NonMonotonicSeq { seq, last });
        }

        if self.keys.len() % self.stride == 0 {
            self.sparse.push((seq, self.offset));
        }
        self.keys.push(seq);

        self.writer.write_all(record)?;
        self.offset += record.len() as u64;
        Ok(())
    }

    /// Rows appended so far.
    pub fn row_count(&self) -> u64 {
        self.keys.len() as u64
    }

    /// Current body size — a lower bound on the final file size, used by
    /// compaction to decide when to roll over to a new output file.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    /// Writes the index structures and footer, fsyncs, and atomically
    /// renames the table onto its final path.
    pub fn finish(mut self) -> Result<TableBuildSummary, SsTableError> {
        if self.keys.is_empty() {
            self.remove_tmp();
            return Err(SsTableError::Internal(
                "cannot build an empty sstable".into(),
            ));
        }

        let sparse_off = self.offset;
        for (seq, off) in &self.sparse {
            self.writer.write_all(&seq.to_le_bytes())?;
            self.writer.write_all(&off.to_le_bytes())?;
        }
        self.offset += (self.sparse.len() * 16) as u64;

        let keys_off = self.offset;
        self.writer
            .write_all(&(self.keys.len() as u64).to_le_bytes())?;
        for seq in &self.keys {
            self.writer.write_all(&seq.to_le_bytes())?;
        }
        self.offset += 8 + (self.keys.len() * 8) as u64;

        let meta_off = self.offset;
        let meta = TableMeta {
            min_seq: self.keys[0],
            max_seq: *self.keys.last().unwrap_or(&0),
            row_count: self.keys.len() as u64,
            sparse_off,
            keys_off,
            meta_off,
        };
        let meta_bytes = meta.encode();
        self.writer.write_all(&meta_bytes)?;

        let mut hasher = Crc32::new();
        hasher.update(&meta_bytes);
        let crc = hasher.finalize();

        self.writer.write_all(&meta_off.to_le_bytes())?;
        self.writer.write_all(&SST_MAGIC)?;
        self.writer.write_all(&crc.to_le_bytes())?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;

        fs::rename(&self.tmp_path, &self.final_path)?;
        self.finished = true;

        let file_size = self.offset + super::SST_META_SIZE as u64 + super::SST_FOOTER_SIZE as u64;
        debug!(
            path = %self.final_path.display(),
            rows = meta.row_count,
            min_seq = meta.min_seq,
            max_seq = meta.max_seq,
            size = file_size,
            "sstable built"
        );

        Ok(TableBuildSummary {
            row_count: meta.row_count,
            min_seq: meta.min_seq,
            max_seq: meta.max_seq,
            file_size,
        })
    }

    /// Cancels the build and removes the temporary file.
    pub fn abandon(mut self) {
        self.remove_tmp();
        self.finished = true;
    }

    fn remove_tmp(&self) {
        if let Err(e) = fs::remove_file(&self.tmp_path)
            && e.kind() != std::io::ErrorKind::NotFound
        {
            warn!(path = %self.tmp_path.display(), error = %e, "failed to remove tmp sstable");
        }
    }
}

impl Drop for TableWriter {
    fn drop(&mut self) {
        if !self.finished {
            self.remove_tmp();
        }
    }
}
