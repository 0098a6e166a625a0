//! Multi-stage leveled compaction.
//!
//! The [`CompactionPicker`] inspects a [`Version`] and proposes tasks;
//! the [`CompactionExecutor`] merges each task's inputs into new output
//! files and publishes a single [`VersionEdit`]. Compaction proceeds in
//! stages, at most one stage per trigger tick:
//!
//! ## Stage 0 — L0 merge
//!
//! Coalesces runs of small L0 files without touching large ones. A file
//! is *small* when its size is below the configured threshold. Maximal
//! contiguous runs of **two or more** small files (in natural L0 order,
//! oldest first) each become one task with `output_level = 0`. A lone
//! small file is deliberately left alone — Stage 1 will fold it into an
//! upgrade. This stage only reduces the L0 file count; it never disturbs
//! big files or seq-range continuity.
//!
//! ## Stage 1 — L0 upgrade
//!
//! Each *big* L0 file, taken as an anchor in natural order, greedily
//! absorbs unclaimed neighboring files — extending left first, then
//! right — while the combined size stays within the L1 target file
//! size. Absorbed files are claimed and cannot be reused by another
//! anchor. The task's inputs keep natural L0 order and its output level
//! is 1. Files left over stay in L0 for the next tick.
//!
//! ## Stage 2 — Ln → Ln+1 (n ≥ 1)
//!
//! For each level whose total size exceeds its budget (geometric: L1 is
//! the target file size, each level below is `multiplier` times bigger),
//! the file with the smallest min-seq is pushed down together with every
//! Ln+1 file whose seq range overlaps it.
//!
//! ## Failure semantics
//!
//! An I/O error aborts the task: partially written outputs are deleted,
//! the published version is untouched, and the task is simply picked
//! again on the next tick. A corrupt input table is fatal and halts the
//! compactor.

#[cfg(test)]
mod tests;

use std::fs;
use std::io;
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::sstable::{SsTableError, TableCache, TableWriter};
use crate::version::{FileMetadata, Version, VersionEdit, VersionSet};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compaction execution.
#[derive(Debug, Error)]
pub enum CompactionError {
    /// Underlying I/O error (retryable).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Table read/write failure.
    #[error("sstable error: {0}")]
    SsTable(#[from] SsTableError),

    /// MANIFEST append or publish failure.
    #[error("version error: {0}")]
    Version(#[from] crate::version::VersionError),

    /// An input table is damaged; compaction must halt.
    #[error("corrupt compaction input {file_number}: {source}")]
    CorruptInput {
        /// File number of the damaged input.
        file_number: u64,
        /// Underlying table error.
        source: SsTableError,
    },
}

impl CompactionError {
    /// `true` when retrying on the next tick cannot help.
    pub fn is_fatal(&self) -> bool {
        matches!(self, CompactionError::CorruptInput { .. })
    }
}

// ------------------------------------------------------------------------------------------------
// Task
// ------------------------------------------------------------------------------------------------

/// One unit of compaction work: input files and the level their merged
/// output lands at. Inputs are ordered as the picker prescribes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionTask {
    /// Input files, in natural order.
    pub inputs: Vec<Arc<FileMetadata>>,
    /// Level the merged output is written to.
    pub output_level: u32,
}

impl CompactionTask {
    /// File numbers of the inputs, in task order.
    pub fn input_numbers(&self) -> Vec<u64> {
        self.inputs.iter().map(|f| f.file_number).collect()
    }
}

/// Outcome of one executed task.
#[derive(Debug, Clone)]
pub struct CompactionOutcome {
    /// Files written and published.
    pub added: Vec<FileMetadata>,
    /// File numbers removed from the version.
    pub removed: Vec<u64>,
}

// ------------------------------------------------------------------------------------------------
// Picker
// ------------------------------------------------------------------------------------------------

/// Stage-ordered task selection over a version snapshot.
#[derive(Debug, Clone, Copy)]
pub struct CompactionPicker {
    /// L0 files below this size count as small (Stage 0 / Stage 1).
    pub l0_small_threshold: u64,
    /// Per-file output target and L1 level budget.
    pub l1_target_file_size: u64,
    /// Geometric growth factor between level budgets.
    pub level_multiplier: u64,
}

impl CompactionPicker {
    /// Size budget for level `n` (n ≥ 1).
    pub fn level_max_bytes(&self, n: usize) -> u64 {
        let mut budget = self.l1_target_file_size;
        for _ in 1..n {
            budget = budget.saturating_mul(self.level_multiplier);
        }
        budget
    }

    /// Returns this tick's tasks.
    ///
    /// Stages are strictly ordered: while Stage 0 has work, later stages
    /// wait for the next tick. This keeps every stage's input set exactly
    /// what its selection rules assume (e.g. Stage 1 anchors never race
    /// with a pending L0 merge of their neighbors).
    pub fn pick(&self, version: &Version) -> Vec<CompactionTask> {
        let stage0 = self.pick_l0_merge(version.level(0));
        if !stage0.is_empty() {
            debug!(tasks = stage0.len(), "picked stage 0 (L0 merge)");
            return stage0;
        }

        let stage1 = self.pick_l0_upgrade(version.level(0));
        if !stage1.is_empty() {
            debug!(tasks = stage1.len(), "picked stage 1 (L0 upgrade)");
            return stage1;
        }

        let stage2 = self.pick_level_overflow(version);
        if !stage2.is_empty() {
            debug!(tasks = stage2.len(), "picked stage 2 (level overflow)");
        }
        stage2
    }

    fn is_small(&self, file: &FileMetadata) -> bool {
        file.file_size < self.l0_small_threshold
    }

    /// Stage 0: maximal contiguous runs of ≥2 small files, big files
    /// breaking runs. Output stays at L0.
    fn pick_l0_merge(&self, l0: &[Arc<FileMetadata>]) -> Vec<CompactionTask> {
        let mut tasks = Vec::new();
        let mut run: Vec<Arc<FileMetadata>> = Vec::new();

        let mut flush_run = |run: &mut Vec<Arc<FileMetadata>>| {
            if run.len() >= 2 {
                tasks.push(CompactionTask {
                    inputs: std::mem::take(run),
                    output_level: 0,
                });
            } else {
                run.clear();
            }
        };

        for file in l0 {
            if self.is_small(file) {
                run.push(Arc::clone(file));
            } else {
                flush_run(&mut run);
            }
        }
        flush_run(&mut run);

        tasks
    }

    /// Stage 1: big-file anchors absorb unclaimed neighbors, left first
    /// then right, while the combined size fits the L1 target.
    fn pick_l0_upgrade(&self, l0: &[Arc<FileMetadata>]) -> Vec<CompactionTask> {
        let mut claimed = vec![false; l0.len()];
        let mut tasks = Vec::new();

        for anchor in 0..l0.len() {
            if claimed[anchor] || self.is_small(&l0[anchor]) {
                continue;
            }
            claimed[anchor] = true;
            let mut total = l0[anchor].file_size;
            let mut lo = anchor;
            let mut hi = anchor;

            // Extend left across contiguous unclaimed neighbors.
            while lo > 0 && !claimed[lo - 1] {
                let size = l0[lo - 1].file_size;
                if total + size > self.l1_target_file_size {
                    break;
                }
                lo -= 1;
                claimed[lo] = true;
                total += size;
            }

            // Then right.
            while hi + 1 < l0.len() && !claimed[hi + 1] {
                let size = l0[hi + 1].file_size;
                if total + size > self.l1_target_file_size {
                    break;
                }
                hi += 1;
                claimed[hi] = true;
                total += size;
            }

            tasks.push(CompactionTask {
                inputs: l0[lo..=hi].iter().map(Arc::clone).collect(),
                output_level: 1,
            });
        }

        tasks
    }

    /// Stage 2: for each oversized level n ≥ 1, push the smallest-min-seq
    /// file down along with every overlapping Ln+1 file.
    fn pick_level_overflow(&self, version: &Version) -> Vec<CompactionTask> {
        let mut tasks = Vec::new();

        for n in 1..crate::version::MAX_LEVEL - 1 {
            let files = version.level(n);
            if files.is_empty() {
                continue;
            }
            let total = version.level_bytes(n);
            if total <= self.level_max_bytes(n) {
                continue;
            }

            // Levels are sorted by min_seq, so the first file has the
            // smallest one.
            let victim = Arc::clone(&files[0]);
            let mut inputs = vec![Arc::clone(&victim)];
            for file in version.level(n + 1) {
                if file.overlaps(victim.min_seq, victim.max_seq) {
                    inputs.push(Arc::clone(file));
                }
            }

            tasks.push(CompactionTask {
                inputs,
                output_level: (n + 1) as u32,
            });
        }

        tasks
    }
}

// ------------------------------------------------------------------------------------------------
// Executor
// ------------------------------------------------------------------------------------------------

/// Merges task inputs into new tables and publishes the edit.
#[derive(Debug)]
pub struct CompactionExecutor {
    versions: Arc<VersionSet>,
    cache: Arc<TableCache>,
    /// Per-output-file size target; a writer rolls over when it fills.
    output_file_size: u64,
}

impl CompactionExecutor {
    /// Creates an executor over the given version set and table cache.
    pub fn new(versions: Arc<VersionSet>, cache: Arc<TableCache>, output_file_size: u64) -> Self {
        Self {
            versions,
            cache,
            output_file_size,
        }
    }

    /// Runs one task to completion.
    ///
    /// The merge is a k-way walk by seq over the input tables; on a
    /// duplicate seq the row from the newest input (latest in natural
    /// order) wins — under append-only writes duplicates do not occur,
    /// but the rule keeps the merge total.
    pub fn run(&self, task: &CompactionTask) -> Result<CompactionOutcome, CompactionError> {
        info!(
            inputs = ?task.input_numbers(),
            output_level = task.output_level,
            "compaction task started"
        );

        // Open every input up front; a damaged table is fatal.
        let mut readers = Vec::with_capacity(task.inputs.len());
        for file in &task.inputs {
            let path = self.versions.sst_path(file.file_number);
            let reader = self
                .cache
                .get_or_open(file.file_number, &path)
                .map_err(|e| {
                    if e.is_corruption() {
                        CompactionError::CorruptInput {
                            file_number: file.file_number,
                            source: e,
                        }
                    } else {
                        CompactionError::SsTable(e)
                    }
                })?;
            readers.push(reader);
        }

        let mut outputs: Vec<FileMetadata> = Vec::new();
        let result = self.merge_into_outputs(task, &readers, &mut outputs);

        if let Err(e) = result {
            // Remove anything already finished; the version never saw it.
            for meta in &outputs {
                let path = self.versions.sst_path(meta.file_number);
                if let Err(rm) = fs::remove_file(&path) {
                    warn!(file = meta.file_number, error = %rm, "failed to remove aborted output");
                }
            }
            warn!(error = %e, "compaction task aborted");
            return Err(e);
        }

        // One atomic edit: drop the inputs, add the outputs.
        let deleted: Vec<(u32, u64)> = task
            .inputs
            .iter()
            .map(|f| (f.level, f.file_number))
            .collect();
        let removed: Vec<u64> = deleted.iter().map(|&(_, n)| n).collect();
        let edit = VersionEdit {
            added: outputs.clone(),
            deleted,
            next_file_number: Some(self.versions.next_file_number()),
        };
        self.versions.log_and_apply(edit)?;

        // Input files are dead in every future version; readers holding
        // an Arc keep their mmap valid after the unlink.
        self.cache.evict(&removed);
        for number in &removed {
            let path = self.versions.sst_path(*number);
            if let Err(e) = fs::remove_file(&path) {
                warn!(file = number, error = %e, "failed to remove compacted input");
            }
        }

        info!(
            added = ?outputs.iter().map(|f| f.file_number).collect::<Vec<_>>(),
            removed = ?removed,
            output_level = task.output_level,
            "compaction task committed"
        );

        Ok(CompactionOutcome {
            added: outputs,
            removed,
        })
    }

    fn merge_into_outputs(
        &self,
        task: &CompactionTask,
        readers: &[Arc<crate::sstable::TableReader>],
        outputs: &mut Vec<FileMetadata>,
    ) -> Result<(), CompactionError> {
        let mut merge = MergeCursor::new(readers, task);
        let mut writer: Option<TableWriter> = None;

        while let Some((seq, record)) = merge.next_record()? {
            if writer.is_none() {
                let number = self.versions.allocate_file_number();
                let path = self.versions.sst_path(number);
                outputs.push(FileMetadata {
                    file_number: number,
                    level: task.output_level,
                    file_size: 0,
                    min_seq: 0,
                    max_seq: 0,
                    row_count: 0,
                });
                writer = Some(TableWriter::create(
                    &path,
                    crate::sstable::DEFAULT_SPARSE_STRIDE,
                )?);
            }

            let mut full = false;
            if let Some(w) = writer.as_mut() {
                w.append(seq, &record)?;
                full = w.file_size() >= self.output_file_size;
            }

            if full && let Some(finished) = writer.take() {
                Self::seal_output(finished, outputs)?;
            }
        }

        if let Some(w) = writer.take() {
            Self::seal_output(w, outputs)?;
        }

        Ok(())
    }

    fn seal_output(
        writer: TableWriter,
        outputs: &mut [FileMetadata],
    ) -> Result<(), CompactionError> {
        let summary = writer.finish()?;
        if let Some(meta) = outputs.last_mut() {
            meta.file_size = summary.file_size;
            meta.min_seq = summary.min_seq;
            meta.max_seq = summary.max_seq;
            meta.row_count = summary.row_count;
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// MergeCursor — k-way merge by seq with newest-wins dedup
// ------------------------------------------------------------------------------------------------

struct MergeSource {
    keys: Vec<u64>,
    pos: usize,
    reader: Arc<crate::sstable::TableReader>,
    file_number: u64,
}

struct MergeCursor {
    /// Sources in task (natural) order; later index = newer.
    sources: Vec<MergeSource>,
    last_emitted: Option<u64>,
}

impl MergeCursor {
    fn new(readers: &[Arc<crate::sstable::TableReader>], task: &CompactionTask) -> Self {
        let sources = readers
            .iter()
            .zip(&task.inputs)
            .map(|(reader, meta)| MergeSource {
                keys: reader.all_keys().to_vec(),
                pos: 0,
                reader: Arc::clone(reader),
                file_number: meta.file_number,
            })
            .collect();
        Self {
            sources,
            last_emitted: None,
        }
    }

    /// Yields the next `(seq, record)` in ascending seq order.
    ///
    /// On a duplicate seq, the source with the larger task index (the
    /// newer file) supplies the record.
    fn next_record(&mut self) -> Result<Option<(u64, Vec<u8>)>, CompactionError> {
        loop {
            // Pick the source with the smallest head seq; ties go to the
            // later (newer) source.
            let mut best: Option<(u64, usize)> = None;
            for (idx, src) in self.sources.iter().enumerate() {
                if let Some(&seq) = src.keys.get(src.pos) {
                    let better = match best {
                        None => true,
                        Some((best_seq, _)) => seq <= best_seq,
                    };
                    if better {
                        best = Some((seq, idx));
                    }
                }
            }

            let Some((seq, idx)) = best else {
                return Ok(None);
            };
            self.sources[idx].pos += 1;

            if self.last_emitted == Some(seq) {
                continue; // duplicate from an older source
            }
            self.last_emitted = Some(seq);

            let src = &self.sources[idx];
            let record = src.reader.get(seq).map_err(|e| {
                if e.is_corruption() {
                    CompactionError::CorruptInput {
                        file_number: src.file_number,
                        source: e,
                    }
                } else {
                    CompactionError::SsTable(e)
                }
            })?;
            return Ok(Some((seq, record)));
        }
    }
}
