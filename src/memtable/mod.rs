//! In-memory write buffers.
//!
//! A [`Memtable`] is a seq-ordered map of encoded rows — the freshest
//! layer of the LSM tree. The [`MemtableSet`] holds one mutable active
//! table plus an ordered queue of immutable tables awaiting flush.
//!
//! ## Invariants
//!
//! - Keys are primary sequence numbers; enumeration always yields them in
//!   ascending order.
//! - Durability comes from the WAL, written before the memtable insert;
//!   the memtable itself never touches disk.
//! - An immutable table stays readable until the flusher has published
//!   its L0 sorted table, so readers never observe a gap.
//!
//! ## Concurrency
//!
//! Writers take the inner write lock per insert; readers proceed
//! concurrently under the read lock. Rotation swaps `Arc` handles, so
//! long-lived readers keep a consistent snapshot of whichever table they
//! grabbed.


use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use thiserror::Error;
use tracing::{debug, trace};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by memtable operations.
#[derive(Debug, Error)]
pub enum MemtableError {
    /// Internal invariant violation or poisoned lock.
    #[error("internal error: {0}")]
    Internal(String),
}

fn poisoned() -> MemtableError {
    MemtableError::Internal("memtable lock poisoned".into())
}

// ------------------------------------------------------------------------------------------------
// Memtable
// ------------------------------------------------------------------------------------------------

/// A seq-ordered, in-memory buffer of encoded rows.
#[derive(Debug, Default)]
pub struct Memtable {
    inner: RwLock<MemtableInner>,
}

#[derive(Debug, Default)]
struct MemtableInner {
    rows: BTreeMap<u64, Vec<u8>>,
    /// Approximate footprint: encoded bytes plus fixed per-entry overhead.
    bytes: usize,
}

/// Per-entry bookkeeping overhead added to the byte-size estimate.
const ENTRY_OVERHEAD: usize = std::mem::size_of::<u64>() + std::mem::size_of::<Vec<u8>>();

impl Memtable {
    /// Creates an empty memtable.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts an encoded row under its seq.
    ///
    /// Seqs are unique by construction (assigned under the engine's write
    /// lock), so an existing entry is only ever replaced during WAL
    /// replay of the same frame.
    pub fn insert(&self, seq: u64, encoded: Vec<u8>) -> Result<(), MemtableError> {
        let mut inner = self.inner.write().map_err(|_| poisoned())?;
        let added = encoded.len() + ENTRY_OVERHEAD;
        if let Some(old) = inner.rows.insert(seq, encoded) {
            inner.bytes = inner.bytes.saturating_sub(old.len() + ENTRY_OVERHEAD);
        }
        inner.bytes += added;
        trace!(seq, bytes = inner.bytes, "memtable insert");
        Ok(())
    }

    /// Point lookup by seq.
    pub fn get(&self, seq: u64) -> Result<Option<Vec<u8>>, MemtableError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.rows.get(&seq).cloned())
    }

    /// All seqs in ascending order.
    pub fn keys(&self) -> Result<Vec<u64>, MemtableError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.rows.keys().copied().collect())
    }

    /// All `(seq, encoded)` entries in ascending seq order.
    pub fn entries(&self) -> Result<Vec<(u64, Vec<u8>)>, MemtableError> {
        let inner = self.inner.read().map_err(|_| poisoned())?;
        Ok(inner.rows.iter().map(|(k, v)| (*k, v.clone())).collect())
    }

    /// Approximate in-memory footprint in bytes.
    pub fn approximate_bytes(&self) -> usize {
        self.inner.read().map(|i| i.bytes).unwrap_or(0)
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.inner.read().map(|i| i.rows.len()).unwrap_or(0)
    }

    /// `true` when the table holds no rows.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Smallest seq, if any.
    pub fn min_seq(&self) -> Option<u64> {
        self.inner
            .read()
            .ok()
            .and_then(|i| i.rows.keys().next().copied())
    }

    /// Largest seq, if any.
    pub fn max_seq(&self) -> Option<u64> {
        self.inner
            .read()
            .ok()
            .and_then(|i| i.rows.keys().next_back().copied())
    }
}

// ------------------------------------------------------------------------------------------------
// MemtableSet
// ------------------------------------------------------------------------------------------------

/// The active memtable plus the queue of immutables awaiting flush.
#[derive(Debug)]
pub struct MemtableSet {
    state: RwLock<SetState>,
    max_bytes: usize,
}

#[derive(Debug)]
struct SetState {
    active: Arc<Memtable>,
    /// Immutable tables, newest first.
    immutables: Vec<Arc<Memtable>>,
}

impl MemtableSet {
    /// Creates a set with an empty active table.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            state: RwLock::new(SetState {
                active: Arc::new(Memtable::new()),
                immutables: Vec::new(),
            }),
            max_bytes,
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, SetState>, MemtableError> {
        self.state.read().map_err(|_| poisoned())
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, SetState>, MemtableError> {
        self.state.write().map_err(|_| poisoned())
    }

    /// Handle to the current active table.
    pub fn active(&self) -> Result<Arc<Memtable>, MemtableError> {
        Ok(Arc::clone(&self.read()?.active))
    }

    /// Handles to the immutable tables, newest first.
    pub fn immutables(&self) -> Result<Vec<Arc<Memtable>>, MemtableError> {
        Ok(self.read()?.immutables.clone())
    }

    /// Inserts into the active table, rotating afterwards if its size
    /// estimate crossed the threshold.
    ///
    /// Returns `true` when a rotation happened — the caller should rotate
    /// the WAL and signal the flusher.
    pub fn insert(&self, seq: u64, encoded: Vec<u8>) -> Result<bool, MemtableError> {
        let state = self.read()?;
        state.active.insert(seq, encoded)?;
        let full = state.active.approximate_bytes() > self.max_bytes;
        drop(state);

        if full {
            self.rotate()?;
        }
        Ok(full)
    }

    /// Swaps the active table for a fresh one, pushing the old active to
    /// the front of the immutable queue.
    pub fn rotate(&self) -> Result<(), MemtableError> {
        let mut state = self.write()?;
        let old = std::mem::replace(&mut state.active, Arc::new(Memtable::new()));
        debug!(
            rows = old.len(),
            bytes = old.approximate_bytes(),
            pending = state.immutables.len() + 1,
            "memtable rotated"
        );
        state.immutables.insert(0, old);
        Ok(())
    }

    /// Oldest immutable table (the next to flush), if any.
    pub fn oldest_immutable(&self) -> Result<Option<Arc<Memtable>>, MemtableError> {
        Ok(self.read()?.immutables.last().cloned())
    }

    /// Removes a flushed immutable from the queue.
    pub fn remove_immutable(&self, table: &Arc<Memtable>) -> Result<(), MemtableError> {
        let mut state = self.write()?;
        state.immutables.retain(|m| !Arc::ptr_eq(m, table));
        Ok(())
    }

    /// Number of immutables awaiting flush.
    pub fn pending_flushes(&self) -> usize {
        self.read().map(|s| s.immutables.len()).unwrap_or(0)
    }

    /// Point lookup across the active table and the immutables
    /// (newest first).
    pub fn get(&self, seq: u64) -> Result<Option<Vec<u8>>, MemtableError> {
        let state = self.read()?;
        if let Some(bytes) = state.active.get(seq)? {
            return Ok(Some(bytes));
        }
        for table in &state.immutables {
            if let Some(bytes) = table.get(seq)? {
                return Ok(Some(bytes));
            }
        }
        Ok(None)
    }

    /// Highest seq present in any memtable.
    pub fn max_seq(&self) -> Result<Option<u64>, MemtableError> {
        let state = self.read()?;
        let mut max = state.active.max_seq();
        for table in &state.immutables {
            max = max.max(table.max_seq());
        }
        Ok(max)
    }
}
