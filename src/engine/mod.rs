//! Per-table storage engine.
//!
//! The engine wires every subsystem together: inserts flow through the
//! WAL into the active memtable (and the secondary indexes), a
//! background **flusher** turns immutable memtables into L0 sorted
//! tables, and a background **compactor** keeps the levels bounded.
//! Reads fuse all live sources through the merged iterator.
//!
//! ## Write path
//!
//! ```text
//! insert → validate → assign seq → encode → WAL append (policy flush)
//!        → memtable insert → index add → [rotate + signal flusher]
//! ```
//!
//! Writers are serialized by a write mutex, which is what makes seq
//! assignment strictly monotonic. A successful insert implies the WAL
//! frame is durable to the degree the flush policy promises.
//!
//! ## Background work
//!
//! Both workers are long-running threads fed by `crossbeam` channels.
//! The flusher wakes on rotation signals; the compactor wakes on a
//! fixed interval and after every flush. Both drain cleanly on
//! shutdown. A compaction I/O error is retried on the next tick; a
//! corrupt input halts the compactor.
//!
//! ## Recovery
//!
//! Open replays the MANIFEST to rebuild the file set, then replays WAL
//! frames whose seq exceeds everything the tables cover, and finally
//! repairs any stale secondary index by walking the missed seq range.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crossbeam::channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::compaction::{CompactionError, CompactionExecutor, CompactionPicker};
use crate::index::{IndexError, SecondaryIndex};
use crate::memtable::{Memtable, MemtableError, MemtableSet};
use crate::query::{MergedIter, Predicate, QueryBuilder, QueryError, RowSource};
use crate::record::{RecordError, Row, RowCodec};
use crate::schema::{Schema, SchemaError, Value};
use crate::sstable::{SsTableError, TableCache, TableWriter};
use crate::version::{FileMetadata, VersionEdit, VersionError, VersionSet};
use crate::wal::{WalError, WalFlushPolicy, WalManager};

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Tunables for one table's engine. All fields have sensible defaults.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Active-memtable size that triggers rotation (default 4 MiB).
    pub memtable_max_bytes: usize,

    /// WAL durability policy (default `Batch`).
    pub wal_flush_policy: WalFlushPolicy,

    /// L0 files below this size count as small for compaction
    /// (default 32 MiB).
    pub l0_small_threshold: u64,

    /// Per-file output target and L1 size budget (default 256 MiB).
    pub l1_target_file_size: u64,

    /// Geometric growth factor between level budgets (default 10).
    pub level_multiplier: u64,

    /// Sparse-index sampling stride inside sorted tables (default 64).
    pub sparse_index_stride: usize,

    /// Compactor tick interval (default 1 s).
    pub compaction_interval: Duration,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            memtable_max_bytes: 4 * 1024 * 1024,
            wal_flush_policy: WalFlushPolicy::Batch,
            l0_small_threshold: 32 * 1024 * 1024,
            l1_target_file_size: 256 * 1024 * 1024,
            level_multiplier: 10,
            sparse_index_stride: crate::sstable::DEFAULT_SPARSE_STRIDE,
            compaction_interval: Duration::from_secs(1),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by engine operations.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Schema validation failure.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Row codec failure.
    #[error("record error: {0}")]
    Record(#[from] RecordError),

    /// WAL failure.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Memtable failure.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Sorted-table failure.
    #[error("sstable error: {0}")]
    SsTable(#[from] SsTableError),

    /// Version-set failure.
    #[error("version error: {0}")]
    Version(#[from] VersionError),

    /// Compaction failure.
    #[error("compaction error: {0}")]
    Compaction(#[from] CompactionError),

    /// Secondary-index failure.
    #[error("index error: {0}")]
    Index(#[from] IndexError),

    /// Merged-read failure.
    #[error("query error: {0}")]
    Query(#[from] QueryError),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Point lookup missed.
    #[error("row {0} not found")]
    NotFound(u64),

    /// Operation on a closed engine.
    #[error("table is closed")]
    Closed,

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Snapshot of table statistics returned by [`Engine::stats`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableStats {
    /// Total live rows across memtables and tables.
    pub total_rows: u64,
    /// Number of files at each level.
    pub files_per_level: Vec<usize>,
    /// Number of secondary indexes.
    pub index_count: usize,
}

// ------------------------------------------------------------------------------------------------
// Engine
// ------------------------------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum Signal {
    Wake,
    Shutdown,
}

/// The per-table orchestrator.
pub struct Engine {
    inner: Arc<EngineInner>,
    flusher: Mutex<Option<JoinHandle<()>>>,
    compactor: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct EngineInner {
    dir: PathBuf,
    config: TableConfig,
    schema: Arc<Schema>,
    codec: RowCodec,
    wal: WalManager,
    memtables: MemtableSet,
    versions: Arc<VersionSet>,
    cache: Arc<TableCache>,
    indexes: HashMap<String, Mutex<SecondaryIndex>>,
    next_seq: AtomicU64,
    /// Serializes writers; seq assignment happens under this lock.
    write_lock: Mutex<()>,
    /// Serializes flush work between the worker and explicit flushes.
    flush_lock: Mutex<()>,
    /// Serializes compaction between the worker and explicit compacts;
    /// two executors racing on one task would double-apply its edit.
    compaction_lock: Mutex<()>,
    closed: AtomicBool,
    flush_tx: Sender<Signal>,
    compact_tx: Sender<Signal>,
}

impl Engine {
    /// Opens (or creates) the engine rooted at `dir`.
    ///
    /// Recovery order: MANIFEST replay → WAL replay above the table
    /// high-water mark → secondary-index repair → worker start.
    pub fn open(
        dir: impl AsRef<Path>,
        schema: Schema,
        config: TableConfig,
    ) -> Result<Self, EngineError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let schema = Arc::new(schema);
        let versions = Arc::new(VersionSet::open(&dir)?);
        let cache = Arc::new(TableCache::new());
        let wal = WalManager::open(&dir, config.wal_flush_policy)?;
        let memtables = MemtableSet::new(config.memtable_max_bytes);

        // Rows already persisted in tables never replay from the WAL.
        let sst_max_seq = versions.current().max_seq();
        let report = wal.replay(sst_max_seq, |seq, payload| {
            // Rotation during replay only queues immutables; the flusher
            // drains them once it starts.
            let _ = memtables.insert(seq, payload);
        })?;
        let last_seq = sst_max_seq.max(report.last_seq);

        let mut indexes = HashMap::new();
        for field in schema.indexed_fields() {
            let index = SecondaryIndex::open(&dir, &field.name, field.field_type)?;
            indexes.insert(field.name.clone(), Mutex::new(index));
        }

        let (flush_tx, flush_rx) = unbounded();
        let (compact_tx, compact_rx) = unbounded();

        let inner = Arc::new(EngineInner {
            dir: dir.clone(),
            codec: RowCodec::new(Arc::clone(&schema)),
            schema,
            wal,
            memtables,
            versions,
            cache,
            indexes,
            next_seq: AtomicU64::new(last_seq + 1),
            write_lock: Mutex::new(()),
            flush_lock: Mutex::new(()),
            compaction_lock: Mutex::new(()),
            closed: AtomicBool::new(false),
            flush_tx: flush_tx.clone(),
            compact_tx: compact_tx.clone(),
            config,
        });

        inner.repair_indexes()?;

        let flusher = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("srdb-flush".into())
                .spawn(move || run_flusher(inner, flush_rx))
                .map_err(EngineError::Io)?
        };
        let compactor = {
            let inner = Arc::clone(&inner);
            std::thread::Builder::new()
                .name("srdb-compact".into())
                .spawn(move || run_compactor(inner, compact_rx))
                .map_err(EngineError::Io)?
        };

        // Anything replayed past the threshold is ready to flush now.
        if inner.memtables.pending_flushes() > 0 {
            let _ = flush_tx.send(Signal::Wake);
        }

        info!(
            dir = %dir.display(),
            last_seq,
            replayed = report.frames,
            files = inner.versions.current().file_count(),
            "engine opened"
        );

        Ok(Self {
            inner,
            flusher: Mutex::new(Some(flusher)),
            compactor: Mutex::new(Some(compactor)),
        })
    }

    /// The table schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.inner.schema
    }

    /// Names of the indexed fields.
    pub fn list_indexes(&self) -> Vec<String> {
        let mut names: Vec<String> = self.inner.indexes.keys().cloned().collect();
        names.sort();
        names
    }

    /// Inserts a row, returning its assigned seq.
    pub fn insert(&self, values: HashMap<String, Value>) -> Result<u64, EngineError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        self.inner.schema.validate(&values)?;

        let _guard = self
            .inner
            .write_lock
            .lock()
            .map_err(|_| EngineError::Internal("write lock poisoned".into()))?;

        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let row = Row {
            seq,
            time: now_nanos(),
            values,
        };
        let bytes = self.inner.codec.encode(&row)?;

        self.inner.wal.append(seq, &bytes)?;
        let rotated = self.inner.memtables.insert(seq, bytes)?;

        for field in self.inner.schema.indexed_fields() {
            let Some(value) = row.values.get(&field.name) else {
                continue;
            };
            if let Some(slot) = self.inner.indexes.get(&field.name) {
                let mut index = slot
                    .lock()
                    .map_err(|_| EngineError::Internal("index lock poisoned".into()))?;
                match index.add(value, seq) {
                    Ok(()) => {}
                    Err(IndexError::LegacyFormat) => {
                        warn!(field = %field.name, "skipping add to legacy read-only index");
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }

        if rotated {
            self.inner.wal.rotate()?;
            let _ = self.inner.flush_tx.send(Signal::Wake);
        }

        Ok(seq)
    }

    /// Point lookup by seq.
    pub fn get(&self, seq: u64) -> Result<Row, EngineError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        self.inner.read_row(seq)
    }

    /// Starts building a query.
    pub fn query(&self) -> QueryBuilder<'_> {
        QueryBuilder::new(self)
    }

    /// Current table statistics.
    pub fn stats(&self) -> Result<TableStats, EngineError> {
        let version = self.inner.versions.current();
        let sst_rows = version.total_rows();
        let watermark = version.max_seq();

        // Memtable rows above the table high-water mark; rows at or
        // below it are (transiently) duplicated by a completed flush.
        let mut mem_rows = 0u64;
        let active = self.inner.memtables.active()?;
        mem_rows += active.keys()?.iter().filter(|&&s| s > watermark).count() as u64;
        for table in self.inner.memtables.immutables()? {
            mem_rows += table.keys()?.iter().filter(|&&s| s > watermark).count() as u64;
        }

        Ok(TableStats {
            total_rows: sst_rows + mem_rows,
            files_per_level: version.files_per_level(),
            index_count: self.inner.indexes.len(),
        })
    }

    /// Forces everything in memory down to L0: rotates the active
    /// memtable (if non-empty) and flushes all immutables synchronously.
    pub fn flush(&self) -> Result<(), EngineError> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EngineError::Closed);
        }
        {
            let _guard = self
                .inner
                .write_lock
                .lock()
                .map_err(|_| EngineError::Internal("write lock poisoned".into()))?;
            if !self.inner.memtables.active()?.is_empty() {
                self.inner.memtables.rotate()?;
                self.inner.wal.rotate()?;
            }
        }
        self.inner.flush_pending()?;
        let _ = self.inner.compact_tx.send(Signal::Wake);
        Ok(())
    }

    /// Runs one compaction pass synchronously: pick, execute, repeat
    /// until the picker finds nothing (or an error). Mostly useful for
    /// tests and maintenance tooling; the background compactor does the
    /// same work on its own schedule.
    pub fn compact(&self) -> Result<(), EngineError> {
        let picker = self.inner.picker();
        let executor = self.inner.executor();
        loop {
            let _guard = self
                .inner
                .compaction_lock
                .lock()
                .map_err(|_| EngineError::Internal("compaction lock poisoned".into()))?;
            let version = self.inner.versions.current();
            let tasks = picker.pick(&version);
            let Some(task) = tasks.first() else {
                return Ok(());
            };
            executor.run(task)?;
        }
    }

    /// Gracefully shuts the engine down: syncs the WAL, stops both
    /// workers (the flusher drains pending memtables first), and
    /// persists the secondary indexes.
    pub fn close(&self) -> Result<(), EngineError> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        self.inner.wal.sync()?;

        let _ = self.inner.flush_tx.send(Signal::Shutdown);
        let _ = self.inner.compact_tx.send(Signal::Shutdown);

        for slot in [&self.flusher, &self.compactor] {
            let handle = slot
                .lock()
                .map_err(|_| EngineError::Internal("worker handle lock poisoned".into()))?
                .take();
            if let Some(handle) = handle
                && handle.join().is_err()
            {
                return Err(EngineError::Internal("background worker panicked".into()));
            }
        }

        // Persist index additions that only lived in memory. Rows still
        // in the active memtable replay from the WAL on reopen, and the
        // index watermark keeps them covered.
        for slot in self.inner.indexes.values() {
            let mut index = slot
                .lock()
                .map_err(|_| EngineError::Internal("index lock poisoned".into()))?;
            if !index.is_legacy()
                && let Err(e) = index.build()
            {
                warn!(field = index.field(), error = %e, "index build on close failed");
            }
        }

        info!(dir = %self.inner.dir.display(), "engine closed");
        Ok(())
    }

    /// Current version snapshot, for test assertions on level shape.
    #[cfg(test)]
    pub(crate) fn inner_version_for_tests(&self) -> Arc<crate::version::Version> {
        self.inner.versions.current()
    }

    // --------------------------------------------------------------------------------------------
    // Query support (used by QueryBuilder)
    // --------------------------------------------------------------------------------------------

    /// Builds the merged iterator over every live source.
    pub(crate) fn merged_iter(
        &self,
        predicate: Option<Predicate>,
    ) -> Result<MergedIter, EngineError> {
        let mut sources = Vec::new();

        sources.push(RowSource::mem(self.inner.memtables.active()?).map_err(EngineError::Query)?);
        for table in self.inner.memtables.immutables()? {
            sources.push(RowSource::mem(table).map_err(EngineError::Query)?);
        }

        let version = self.inner.versions.current();

        // L0 newest-first (largest file number first).
        let mut l0: Vec<&Arc<FileMetadata>> = version.level(0).iter().collect();
        l0.sort_by_key(|f| std::cmp::Reverse(f.file_number));
        for meta in l0 {
            let reader = self
                .inner
                .cache
                .get_or_open(meta.file_number, &self.inner.versions.sst_path(meta.file_number))?;
            sources.push(RowSource::table(reader));
        }

        for n in 1..crate::version::MAX_LEVEL {
            for meta in version.level(n) {
                let reader = self.inner.cache.get_or_open(
                    meta.file_number,
                    &self.inner.versions.sst_path(meta.file_number),
                )?;
                sources.push(RowSource::table(reader));
            }
        }

        Ok(MergedIter::new(
            sources,
            self.inner.codec.clone(),
            predicate,
        ))
    }

    /// Resolves equality conditions through secondary indexes.
    ///
    /// Returns `Ok(None)` when any condition's field has no index (the
    /// caller falls back to a scan); otherwise the sorted intersection
    /// of the per-condition seq sets.
    pub(crate) fn index_candidates(
        &self,
        conditions: &[(String, Value)],
    ) -> Result<Option<Vec<u64>>, EngineError> {
        let mut result: Option<Vec<u64>> = None;

        for (field, value) in conditions {
            let Some(slot) = self.inner.indexes.get(field) else {
                return Ok(None);
            };
            let index = slot
                .lock()
                .map_err(|_| EngineError::Internal("index lock poisoned".into()))?;
            let seqs = index.get(value)?;
            result = Some(match result {
                None => seqs,
                Some(prev) => intersect_sorted(&prev, &seqs),
            });
            if result.as_ref().is_some_and(Vec::is_empty) {
                break;
            }
        }

        Ok(result)
    }
}

// ------------------------------------------------------------------------------------------------
// EngineInner — read path and background work
// ------------------------------------------------------------------------------------------------

impl EngineInner {
    fn picker(&self) -> CompactionPicker {
        CompactionPicker {
            l0_small_threshold: self.config.l0_small_threshold,
            l1_target_file_size: self.config.l1_target_file_size,
            level_multiplier: self.config.level_multiplier,
        }
    }

    fn executor(&self) -> CompactionExecutor {
        CompactionExecutor::new(
            Arc::clone(&self.versions),
            Arc::clone(&self.cache),
            self.config.l1_target_file_size,
        )
    }

    /// Point read across memtables (newest first), then L0 (newest
    /// first), then deeper levels by seq-range binary search.
    ///
    /// Memtables are consulted before the version snapshot: a flush
    /// publishes its table *before* retiring the immutable, so this
    /// order never loses a row mid-flush.
    fn read_row(&self, seq: u64) -> Result<Row, EngineError> {
        if let Some(bytes) = self.memtables.get(seq)? {
            return Ok(self.codec.decode(&bytes)?);
        }

        let version = self.versions.current();

        for meta in version.level(0).iter().rev() {
            if !meta.overlaps(seq, seq) {
                continue;
            }
            let reader = self
                .cache
                .get_or_open(meta.file_number, &self.versions.sst_path(meta.file_number))?;
            match reader.get(seq) {
                Ok(bytes) => return Ok(self.codec.decode(&bytes)?),
                Err(SsTableError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        for n in 1..crate::version::MAX_LEVEL {
            let files = version.level(n);
            // Disjoint and sorted by min_seq: at most one candidate.
            let idx = files.partition_point(|f| f.min_seq <= seq);
            if idx == 0 {
                continue;
            }
            let meta = &files[idx - 1];
            if meta.max_seq < seq {
                continue;
            }
            let reader = self
                .cache
                .get_or_open(meta.file_number, &self.versions.sst_path(meta.file_number))?;
            match reader.get(seq) {
                Ok(bytes) => return Ok(self.codec.decode(&bytes)?),
                Err(SsTableError::NotFound(_)) => continue,
                Err(e) => return Err(e.into()),
            }
        }

        Err(EngineError::NotFound(seq))
    }

    /// Flushes every queued immutable memtable, oldest first.
    fn flush_pending(&self) -> Result<(), EngineError> {
        let _guard = self
            .flush_lock
            .lock()
            .map_err(|_| EngineError::Internal("flush lock poisoned".into()))?;

        while let Some(table) = self.memtables.oldest_immutable()? {
            self.flush_one(&table)?;
        }
        Ok(())
    }

    /// Writes one immutable memtable out as an L0 table and publishes
    /// the edit.
    fn flush_one(&self, table: &Arc<Memtable>) -> Result<(), EngineError> {
        let entries = table.entries()?;
        if entries.is_empty() {
            self.memtables.remove_immutable(table)?;
            return Ok(());
        }

        let file_number = self.versions.allocate_file_number();
        let path = self.versions.sst_path(file_number);
        let mut writer = TableWriter::create(&path, self.config.sparse_index_stride)?;
        for (seq, bytes) in &entries {
            writer.append(*seq, bytes)?;
        }
        let summary = writer.finish()?;

        let meta = FileMetadata {
            file_number,
            level: 0,
            file_size: summary.file_size,
            min_seq: summary.min_seq,
            max_seq: summary.max_seq,
            row_count: summary.row_count,
        };
        self.versions
            .log_and_apply(VersionEdit::flush(meta, self.versions.next_file_number()))?;

        // Readers now find these rows in the table; retire the memtable
        // and any WAL segment the flush fully covers.
        self.memtables.remove_immutable(table)?;
        self.wal.remove_obsolete(summary.max_seq)?;

        // Persist index growth alongside the flush.
        for slot in self.indexes.values() {
            if let Ok(mut index) = slot.lock() {
                if index.is_legacy() {
                    continue;
                }
                if let Err(e) = index.build() {
                    warn!(field = index.field(), error = %e, "index build after flush failed");
                }
            }
        }

        debug!(
            file_number,
            rows = summary.row_count,
            min_seq = summary.min_seq,
            max_seq = summary.max_seq,
            "memtable flushed to L0"
        );

        let _ = self.compact_tx.send(Signal::Wake);
        Ok(())
    }

    /// Brings stale secondary indexes up to the current high-water mark.
    fn repair_indexes(&self) -> Result<(), EngineError> {
        let current_max = self.next_seq.load(Ordering::SeqCst).saturating_sub(1);

        for (field, slot) in &self.indexes {
            let mut index = slot
                .lock()
                .map_err(|_| EngineError::Internal("index lock poisoned".into()))?;
            if !index.needs_update(current_max) {
                continue;
            }
            if index.is_legacy() {
                warn!(
                    field = %field,
                    index_max = index.metadata().max_seq,
                    current_max,
                    "legacy index is stale but read-only; rebuild required"
                );
                continue;
            }

            let field_name = field.clone();
            index.incremental_update(current_max, |seq| {
                self.read_row(seq)
                    .ok()
                    .and_then(|row| row.values.get(&field_name).cloned())
            })?;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Background workers
// ------------------------------------------------------------------------------------------------

fn run_flusher(inner: Arc<EngineInner>, rx: Receiver<Signal>) {
    loop {
        match rx.recv() {
            Ok(Signal::Wake) => {
                if let Err(e) = inner.flush_pending() {
                    // The memtable stays queued; the next signal retries.
                    error!(error = %e, "flush failed");
                }
            }
            Ok(Signal::Shutdown) | Err(_) => {
                if let Err(e) = inner.flush_pending() {
                    error!(error = %e, "final flush on shutdown failed");
                }
                return;
            }
        }
    }
}

fn run_compactor(inner: Arc<EngineInner>, rx: Receiver<Signal>) {
    let picker = inner.picker();
    let executor = inner.executor();

    // Bound the work done per tick; leftovers surface again next tick.
    const MAX_TASKS_PER_TICK: usize = 16;

    loop {
        match rx.recv_timeout(inner.config.compaction_interval) {
            Ok(Signal::Shutdown) | Err(RecvTimeoutError::Disconnected) => return,
            Ok(Signal::Wake) | Err(RecvTimeoutError::Timeout) => {}
        }

        for _ in 0..MAX_TASKS_PER_TICK {
            // Re-pick against the freshly published version each round
            // so tasks never operate on files a previous round removed.
            let Ok(_guard) = inner.compaction_lock.lock() else {
                return;
            };
            let version = inner.versions.current();
            let tasks = picker.pick(&version);
            let Some(task) = tasks.first() else {
                break;
            };

            match executor.run(task) {
                Ok(_) => {}
                Err(e) if e.is_fatal() => {
                    error!(error = %e, "compaction halted by corrupt input");
                    return;
                }
                Err(e) => {
                    warn!(error = %e, "compaction task failed; retrying next tick");
                    break;
                }
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn now_nanos() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as i64)
        .unwrap_or(0)
}

/// Intersection of two ascending seq lists.
fn intersect_sorted(a: &[u64], b: &[u64]) -> Vec<u64> {
    let mut out = Vec::new();
    let (mut i, mut j) = (0, 0);
    while i < a.len() && j < b.len() {
        match a[i].cmp(&b[j]) {
            std::cmp::Ordering::Less => i += 1,
            std::cmp::Ordering::Greater => j += 1,
            std::cmp::Ordering::Equal => {
                out.push(a[i]);
                i += 1;
                j += 1;
            }
        }
    }
    out
}
