//! Merged reads and the query builder.
//!
//! [`MergedIter`] fuses every live row source into one stream:
//!
//! 1. the active memtable,
//! 2. immutable memtables, newest first,
//! 3. L0 tables, newest first (by file number),
//! 4. L1+ tables in min-seq order.
//!
//! Each source is drained before the next begins. A `visited` seq set
//! de-duplicates rows that are momentarily visible in two places (an
//! immutable memtable and its freshly flushed L0 table); because writes
//! are append-only, newer sources are searched first and always win.
//! An optional predicate filters decoded rows.
//!
//! Iteration is lazy ([`MergedIter::next_row`], [`MergedIter::first`]);
//! operations that need the full result ([`MergedIter::len`],
//! [`MergedIter::last`], [`MergedIter::collect_rows`]) materialize the
//! remainder into a cache, after which iteration reads from the cache.
//!
//! [`QueryBuilder`] is the public query surface: equality conditions
//! (served from a secondary index when one covers the field), arbitrary
//! row predicates, and a limit, with `collect` / `first` / `last` /
//! `count` / `seqs` terminals.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use thiserror::Error;

use crate::engine::{Engine, EngineError};
use crate::memtable::{Memtable, MemtableError};
use crate::record::{RecordError, Row, RowCodec};
use crate::schema::Value;
use crate::sstable::{SsTableError, TableReader};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced while driving a merged read.
#[derive(Debug, Error)]
pub enum QueryError {
    /// Memtable access failure.
    #[error("memtable error: {0}")]
    Memtable(#[from] MemtableError),

    /// Table read failure.
    #[error("sstable error: {0}")]
    SsTable(#[from] SsTableError),

    /// Row decode failure.
    #[error("record error: {0}")]
    Record(#[from] RecordError),
}

/// Row filter applied by the merged iterator.
pub type Predicate = Box<dyn Fn(&Row) -> bool + Send + Sync>;

// ------------------------------------------------------------------------------------------------
// Row sources
// ------------------------------------------------------------------------------------------------

/// One drainable source of encoded rows, in engine priority order.
pub enum RowSource {
    /// A memtable snapshot (active or immutable).
    Mem {
        /// The table.
        table: Arc<Memtable>,
        /// Seq snapshot taken at iterator construction.
        keys: Vec<u64>,
        /// Cursor into `keys`.
        pos: usize,
    },
    /// An open sorted table.
    Table {
        /// The reader.
        reader: Arc<TableReader>,
        /// Cursor into the reader's dense key list.
        pos: usize,
    },
}

impl RowSource {
    /// Wraps a memtable, snapshotting its keys.
    pub fn mem(table: Arc<Memtable>) -> Result<Self, QueryError> {
        let keys = table.keys()?;
        Ok(RowSource::Mem {
            table,
            keys,
            pos: 0,
        })
    }

    /// Wraps a sorted table.
    pub fn table(reader: Arc<TableReader>) -> Self {
        RowSource::Table { reader, pos: 0 }
    }

    /// Next `(seq, encoded)` from this source, or `None` when drained.
    fn next_entry(&mut self) -> Result<Option<(u64, Vec<u8>)>, QueryError> {
        match self {
            RowSource::Mem { table, keys, pos } => {
                while *pos < keys.len() {
                    let seq = keys[*pos];
                    *pos += 1;
                    if let Some(bytes) = table.get(seq)? {
                        return Ok(Some((seq, bytes)));
                    }
                }
                Ok(None)
            }
            RowSource::Table { reader, pos } => {
                let keys = reader.all_keys();
                if *pos >= keys.len() {
                    return Ok(None);
                }
                let seq = keys[*pos];
                *pos += 1;
                let bytes = reader.get(seq)?;
                Ok(Some((seq, bytes)))
            }
        }
    }
}

// ------------------------------------------------------------------------------------------------
// MergedIter
// ------------------------------------------------------------------------------------------------

/// Union iterator over all row sources with per-seq de-duplication.
pub struct MergedIter {
    sources: Vec<RowSource>,
    source_idx: usize,
    codec: RowCodec,
    visited: HashSet<u64>,
    predicate: Option<Predicate>,
    cache: Option<VecDeque<Row>>,
}

impl MergedIter {
    /// Creates an iterator over sources already ordered newest-first.
    pub fn new(sources: Vec<RowSource>, codec: RowCodec, predicate: Option<Predicate>) -> Self {
        Self {
            sources,
            source_idx: 0,
            codec,
            visited: HashSet::new(),
            predicate,
            cache: None,
        }
    }

    /// Advances the underlying sources to the next matching row.
    fn advance(&mut self) -> Result<Option<Row>, QueryError> {
        while self.source_idx < self.sources.len() {
            let Some((seq, bytes)) = self.sources[self.source_idx].next_entry()? else {
                self.source_idx += 1;
                continue;
            };

            if !self.visited.insert(seq) {
                continue;
            }

            let row = self.codec.decode(&bytes)?;
            if let Some(pred) = &self.predicate
                && !pred(&row)
            {
                continue;
            }
            return Ok(Some(row));
        }
        Ok(None)
    }

    /// Next matching row, from the cache when materialized.
    pub fn next_row(&mut self) -> Result<Option<Row>, QueryError> {
        if let Some(cache) = self.cache.as_mut() {
            return Ok(cache.pop_front());
        }
        self.advance()
    }

    /// Drains the remaining rows into the cache.
    fn materialize(&mut self) -> Result<(), QueryError> {
        if self.cache.is_some() {
            return Ok(());
        }
        let mut cache = VecDeque::new();
        while let Some(row) = self.advance()? {
            cache.push_back(row);
        }
        self.cache = Some(cache);
        Ok(())
    }

    /// First matching row. Lazy — stops at the first hit.
    pub fn first(&mut self) -> Result<Option<Row>, QueryError> {
        self.next_row()
    }

    /// Last matching row. Materializes the remainder.
    pub fn last(&mut self) -> Result<Option<Row>, QueryError> {
        self.materialize()?;
        Ok(self
            .cache
            .as_ref()
            .and_then(|c| c.back().cloned()))
    }

    /// Number of rows remaining. Materializes the remainder; subsequent
    /// iteration reads from the cache.
    pub fn len(&mut self) -> Result<usize, QueryError> {
        self.materialize()?;
        Ok(self.cache.as_ref().map(VecDeque::len).unwrap_or(0))
    }

    /// `true` when no rows remain.
    pub fn is_empty(&mut self) -> Result<bool, QueryError> {
        Ok(self.len()? == 0)
    }

    /// Collects every remaining row.
    pub fn collect_rows(&mut self) -> Result<Vec<Row>, QueryError> {
        self.materialize()?;
        Ok(self
            .cache
            .take()
            .map(|c| c.into_iter().collect())
            .unwrap_or_default())
    }
}

// ------------------------------------------------------------------------------------------------
// QueryBuilder
// ------------------------------------------------------------------------------------------------

/// Fluent query surface returned by `Table::query` / `Engine::query`.
pub struct QueryBuilder<'a> {
    engine: &'a Engine,
    eq: Vec<(String, Value)>,
    predicate: Option<Predicate>,
    limit: Option<usize>,
}

impl<'a> QueryBuilder<'a> {
    pub(crate) fn new(engine: &'a Engine) -> Self {
        Self {
            engine,
            eq: Vec::new(),
            predicate: None,
            limit: None,
        }
    }

    /// Adds an equality condition. When the field carries a secondary
    /// index the condition is answered from it instead of scanning.
    pub fn filter_eq(mut self, field: impl Into<String>, value: Value) -> Self {
        self.eq.push((field.into(), value));
        self
    }

    /// Adds an arbitrary row predicate.
    pub fn filter(mut self, pred: impl Fn(&Row) -> bool + Send + Sync + 'static) -> Self {
        let pred: Predicate = Box::new(pred);
        self.predicate = Some(match self.predicate.take() {
            None => pred,
            Some(prev) => Box::new(move |row| prev(row) && pred(row)),
        });
        self
    }

    /// Caps the number of rows returned by `collect` / `seqs` / `count`.
    pub fn limit(mut self, n: usize) -> Self {
        self.limit = Some(n);
        self
    }

    /// Combined predicate: every equality condition plus the user filter.
    fn compound_predicate(eq: Vec<(String, Value)>, user: Option<Predicate>) -> Option<Predicate> {
        if eq.is_empty() {
            return user;
        }
        Some(Box::new(move |row: &Row| {
            eq.iter()
                .all(|(field, value)| row.get(field) == Some(value))
                && user.as_ref().is_none_or(|p| p(row))
        }))
    }

    /// Runs the query, collecting up to `limit` rows.
    pub fn collect(self) -> Result<Vec<Row>, EngineError> {
        let limit = self.limit.unwrap_or(usize::MAX);

        // Index path: every equality condition must be answerable from
        // an index; otherwise fall back to a merged scan.
        if !self.eq.is_empty()
            && let Some(seqs) = self.engine.index_candidates(&self.eq)?
        {
            let pred = Self::compound_predicate(self.eq, self.predicate);
            let mut rows = Vec::new();
            for seq in seqs {
                match self.engine.get(seq) {
                    Ok(row) => {
                        if pred.as_ref().is_none_or(|p| p(&row)) {
                            rows.push(row);
                            if rows.len() >= limit {
                                break;
                            }
                        }
                    }
                    // An index may momentarily reference a row the read
                    // path cannot resolve; treat it as absent.
                    Err(EngineError::NotFound(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            return Ok(rows);
        }

        let pred = Self::compound_predicate(self.eq, self.predicate);
        let mut iter = self.engine.merged_iter(pred)?;
        let mut rows = Vec::new();
        while rows.len() < limit {
            match iter.next_row().map_err(EngineError::from)? {
                Some(row) => rows.push(row),
                None => break,
            }
        }
        Ok(rows)
    }

    /// First matching row, lazily.
    pub fn first(self) -> Result<Option<Row>, EngineError> {
        Ok(self.limit(1).collect()?.into_iter().next())
    }

    /// Last matching row. Requires full materialization.
    pub fn last(self) -> Result<Option<Row>, EngineError> {
        Ok(self.collect()?.into_iter().next_back())
    }

    /// Number of matching rows.
    pub fn count(self) -> Result<usize, EngineError> {
        Ok(self.collect()?.len())
    }

    /// Seqs of matching rows, ascending.
    pub fn seqs(self) -> Result<Vec<u64>, EngineError> {
        let mut seqs: Vec<u64> = self.collect()?.into_iter().map(|r| r.seq).collect();
        seqs.sort_unstable();
        Ok(seqs)
    }
}
