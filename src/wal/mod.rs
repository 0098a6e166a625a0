//! Segmented write-ahead log.
//!
//! Every insert is framed and appended to the active segment before it is
//! applied to the memtable, guaranteeing that acknowledged rows survive a
//! crash (subject to the configured [`WalFlushPolicy`]).
//!
//! # On-disk layout
//!
//! Segments live in `<table>/wal/` and are named `wal-<id>.log` with a
//! monotonically increasing id. Each segment is a sequence of frames:
//!
//! ```text
//! [length u32][crc32 u32][seq u64][payload]
//! ```
//!
//! `length` counts `seq || payload`; the CRC is computed over the same
//! bytes. There is no segment header — a zero-length file is a valid,
//! empty segment.
//!
//! # Flush policy
//!
//! - [`WalFlushPolicy::Always`] — every append is fsync'ed before return.
//! - [`WalFlushPolicy::Batch`] — appends are flushed to the kernel buffer;
//!   the OS decides when they hit the platter.
//! - [`WalFlushPolicy::Never`] — appends stay in the user-space buffer
//!   until rotation, shutdown, or an explicit [`WalManager::sync`].
//!
//! # Recovery
//!
//! [`WalManager::replay`] walks closed segments in id order and decodes
//! frames sequentially. The first torn or corrupt frame marks the durable
//! tail: the segment is truncated at the last good offset, the event is
//! logged, and replay stops. Tail corruption is recoverable by design —
//! only unacknowledged (or `Never`-policy) writes can be lost.
//!
//! # Garbage collection
//!
//! A segment may be deleted once every seq it holds has been flushed into
//! an L0 sorted table; [`WalManager::remove_obsolete`] compares each
//! closed segment's highest seq against the flushed watermark.

#[cfg(test)]
mod tests;

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Directory holding WAL segments inside a table directory.
pub const WAL_DIR: &str = "wal";

/// Frame header size: length(4) + crc(4).
const FRAME_PREFIX: usize = 8;

/// Upper bound on a single frame's `length` field (64 MiB). A larger
/// value can only come from corruption.
const MAX_FRAME_LEN: u32 = 64 * 1024 * 1024;

// ------------------------------------------------------------------------------------------------
// Flush policy
// ------------------------------------------------------------------------------------------------

/// Durability level applied to each WAL append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WalFlushPolicy {
    /// fsync after every append.
    Always,
    /// Flush to the kernel buffer after every append.
    #[default]
    Batch,
    /// Leave appends in the user-space buffer.
    Never,
}

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Segment file name did not match `wal-<id>.log`.
    #[error("invalid WAL segment name `{0}`")]
    InvalidSegmentName(String),

    /// Internal consistency or locking error.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Replay report
// ------------------------------------------------------------------------------------------------

/// Outcome of a full WAL replay.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    /// Number of frames delivered to the callback.
    pub frames: usize,
    /// Highest seq observed across all replayed frames (0 if none).
    pub last_seq: u64,
    /// Whether a corrupt tail was detected and truncated.
    pub truncated: bool,
}

// ------------------------------------------------------------------------------------------------
// Segment bookkeeping
// ------------------------------------------------------------------------------------------------

#[derive(Debug)]
struct SegmentInfo {
    id: u64,
    path: PathBuf,
    /// Highest seq seen in this segment; 0 until replay or append fills it.
    last_seq: u64,
}

#[derive(Debug)]
struct ActiveSegment {
    id: u64,
    path: PathBuf,
    writer: BufWriter<File>,
    last_seq: u64,
}

// ------------------------------------------------------------------------------------------------
// WalManager
// ------------------------------------------------------------------------------------------------

/// Owns the WAL directory of one table: the active segment plus the
/// ordered list of closed segments awaiting flush-then-delete.
#[derive(Debug)]
pub struct WalManager {
    dir: PathBuf,
    policy: WalFlushPolicy,
    inner: Mutex<WalInner>,
}

#[derive(Debug)]
struct WalInner {
    active: ActiveSegment,
    /// Closed segments, ascending by id.
    closed: Vec<SegmentInfo>,
}

impl WalManager {
    /// Opens (or creates) the WAL directory under `table_dir`.
    ///
    /// Existing segments are registered as closed; a fresh active segment
    /// with `max_existing_id + 1` is created so that recovery never
    /// appends to a possibly-truncated file.
    pub fn open(table_dir: impl AsRef<Path>, policy: WalFlushPolicy) -> Result<Self, WalError> {
        let dir = table_dir.as_ref().join(WAL_DIR);
        fs::create_dir_all(&dir)?;

        let mut closed = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_file() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            match parse_segment_id(name) {
                Some(id) => closed.push(SegmentInfo {
                    id,
                    path,
                    last_seq: 0,
                }),
                None => {
                    warn!(file = name, "ignoring unrecognized file in wal directory");
                }
            }
        }
        closed.sort_by_key(|s| s.id);

        let next_id = closed.last().map_or(1, |s| s.id + 1);
        let active = Self::create_segment(&dir, next_id)?;

        info!(
            dir = %dir.display(),
            closed = closed.len(),
            active = next_id,
            "WAL opened"
        );

        Ok(Self {
            dir,
            policy,
            inner: Mutex::new(WalInner { active, closed }),
        })
    }

    fn create_segment(dir: &Path, id: u64) -> Result<ActiveSegment, WalError> {
        let path = dir.join(segment_file_name(id));
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        debug!(path = %path.display(), id, "WAL segment created");
        Ok(ActiveSegment {
            id,
            path,
            writer: BufWriter::new(file),
            last_seq: 0,
        })
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, WalInner>, WalError> {
        self.inner
            .lock()
            .map_err(|_| WalError::Internal("WAL mutex poisoned".into()))
    }

    /// Appends one frame to the active segment, honoring the flush policy.
    pub fn append(&self, seq: u64, payload: &[u8]) -> Result<(), WalError> {
        let length = (8 + payload.len()) as u32;
        if length > MAX_FRAME_LEN {
            return Err(WalError::Internal(format!(
                "frame of {length} bytes exceeds MAX_FRAME_LEN"
            )));
        }

        let seq_bytes = seq.to_le_bytes();
        let mut hasher = Crc32::new();
        hasher.update(&seq_bytes);
        hasher.update(payload);
        let crc = hasher.finalize();

        let mut inner = self.lock()?;
        let active = &mut inner.active;
        active.writer.write_all(&length.to_le_bytes())?;
        active.writer.write_all(&crc.to_le_bytes())?;
        active.writer.write_all(&seq_bytes)?;
        active.writer.write_all(payload)?;
        active.last_seq = active.last_seq.max(seq);

        match self.policy {
            WalFlushPolicy::Always => {
                active.writer.flush()?;
                active.writer.get_ref().sync_all()?;
            }
            WalFlushPolicy::Batch => {
                active.writer.flush()?;
            }
            WalFlushPolicy::Never => {}
        }

        trace!(seq, len = length, crc = format_args!("{crc:08x}"), "WAL frame appended");
        Ok(())
    }

    /// Flushes and fsyncs the active segment regardless of policy.
    pub fn sync(&self) -> Result<(), WalError> {
        let mut inner = self.lock()?;
        inner.active.writer.flush()?;
        inner.active.writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Closes the active segment and starts a new one.
    ///
    /// Called on memtable rotation so that each closed segment covers a
    /// contiguous, flushable seq range. Returns the new segment id.
    pub fn rotate(&self) -> Result<u64, WalError> {
        let mut inner = self.lock()?;

        inner.active.writer.flush()?;
        inner.active.writer.get_ref().sync_all()?;

        let next_id = inner.active.id + 1;
        let new_active = Self::create_segment(&self.dir, next_id)?;
        let old_active = std::mem::replace(&mut inner.active, new_active);

        inner.closed.push(SegmentInfo {
            id: old_active.id,
            path: old_active.path,
            last_seq: old_active.last_seq,
        });

        info!(closed = old_active.id, active = next_id, "WAL rotated");
        Ok(next_id)
    }

    /// Deletes closed segments whose every frame is covered by the given
    /// flushed-seq watermark. Returns the number of segments removed.
    pub fn remove_obsolete(&self, flushed_seq: u64) -> Result<usize, WalError> {
        let mut inner = self.lock()?;
        let mut removed = 0;

        inner.closed.retain(|seg| {
            if seg.last_seq <= flushed_seq {
                match fs::remove_file(&seg.path) {
                    Ok(()) => {
                        debug!(id = seg.id, last_seq = seg.last_seq, "WAL segment removed");
                        removed += 1;
                        false
                    }
                    Err(e) => {
                        warn!(id = seg.id, error = %e, "failed to remove WAL segment");
                        true
                    }
                }
            } else {
                true
            }
        });

        Ok(removed)
    }

    /// Replays all closed segments in id order, invoking `f(seq, payload)`
    /// for each frame whose seq is strictly greater than `min_seq`.
    ///
    /// On the first torn or corrupt frame the containing segment is
    /// truncated at the last good offset and replay stops; segments after
    /// it are left untouched (they cannot contain acknowledged data, since
    /// seqs are appended in order).
    pub fn replay(
        &self,
        min_seq: u64,
        mut f: impl FnMut(u64, Vec<u8>),
    ) -> Result<ReplayReport, WalError> {
        let mut inner = self.lock()?;
        let mut report = ReplayReport::default();

        let mut stop = false;
        for seg in &mut inner.closed {
            if stop {
                warn!(id = seg.id, "skipping WAL segment after corrupt tail");
                continue;
            }

            let outcome = replay_segment(&seg.path, min_seq, &mut report, &mut f)?;
            seg.last_seq = outcome.segment_last_seq;

            if let Some(good_offset) = outcome.truncate_at {
                warn!(
                    id = seg.id,
                    offset = good_offset,
                    last_seq = report.last_seq,
                    "WAL tail corruption; truncating segment"
                );
                let file = OpenOptions::new().write(true).open(&seg.path)?;
                file.set_len(good_offset)?;
                file.sync_all()?;
                report.truncated = true;
                stop = true;
            }
        }

        info!(
            frames = report.frames,
            last_seq = report.last_seq,
            truncated = report.truncated,
            "WAL replay complete"
        );
        Ok(report)
    }
}

// ------------------------------------------------------------------------------------------------
// Segment replay
// ------------------------------------------------------------------------------------------------

struct SegmentReplay {
    /// Offset to truncate at, if a bad frame was found.
    truncate_at: Option<u64>,
    /// Highest seq seen in this segment.
    segment_last_seq: u64,
}

fn replay_segment(
    path: &Path,
    min_seq: u64,
    report: &mut ReplayReport,
    f: &mut impl FnMut(u64, Vec<u8>),
) -> Result<SegmentReplay, WalError> {
    let mut file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut offset: u64 = 0;
    let mut segment_last_seq = 0u64;

    loop {
        if offset == file_len {
            return Ok(SegmentReplay {
                truncate_at: None,
                segment_last_seq,
            });
        }

        // Torn prefix: not even a full frame header remains.
        if file_len - offset < FRAME_PREFIX as u64 {
            return Ok(SegmentReplay {
                truncate_at: Some(offset),
                segment_last_seq,
            });
        }

        file.seek(SeekFrom::Start(offset))?;
        let mut prefix = [0u8; FRAME_PREFIX];
        file.read_exact(&mut prefix)?;
        let length = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        let stored_crc = u32::from_le_bytes([prefix[4], prefix[5], prefix[6], prefix[7]]);

        if length < 8 || length > MAX_FRAME_LEN {
            return Ok(SegmentReplay {
                truncate_at: Some(offset),
                segment_last_seq,
            });
        }
        if file_len - offset - (FRAME_PREFIX as u64) < length as u64 {
            // Torn payload.
            return Ok(SegmentReplay {
                truncate_at: Some(offset),
                segment_last_seq,
            });
        }

        let mut body = vec![0u8; length as usize];
        file.read_exact(&mut body)?;

        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != stored_crc {
            return Ok(SegmentReplay {
                truncate_at: Some(offset),
                segment_last_seq,
            });
        }

        let seq = u64::from_le_bytes([
            body[0], body[1], body[2], body[3], body[4], body[5], body[6], body[7],
        ]);
        let payload = body.split_off(8);

        segment_last_seq = segment_last_seq.max(seq);
        report.last_seq = report.last_seq.max(seq);

        if seq > min_seq {
            report.frames += 1;
            f(seq, payload);
        }

        offset += FRAME_PREFIX as u64 + length as u64;
    }
}

// ------------------------------------------------------------------------------------------------
// Naming helpers
// ------------------------------------------------------------------------------------------------

/// Formats a segment file name for the given id.
pub fn segment_file_name(id: u64) -> String {
    format!("wal-{id:06}.log")
}

/// Parses a segment id out of a `wal-<id>.log` file name.
fn parse_segment_id(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse()
        .ok()
}
