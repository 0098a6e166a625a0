//! # SRDB
//!
//! An embeddable, append-oriented table store built on a
//! **Log-Structured Merge Tree (LSM-tree)** architecture. Rows are
//! schema-defined, keyed by a monotonically assigned 64-bit sequence
//! number, and never mutated after insert.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                       Engine                           │
//! │  ┌────────────┐  ┌──────────────┐  ┌──────────────┐    │
//! │  │  Active    │  │  Immutable   │  │  SSTs        │    │
//! │  │  Memtable  │  │  Memtables   │  │  L0 … Ln     │    │
//! │  │  + WAL     │  │              │  │  (on disk)   │    │
//! │  └─────┬──────┘  └──────┬───────┘  └──────┬───────┘    │
//! │        │  rotate        │  flush          │            │
//! │        └────────►       └────────►        │            │
//! │                                           │            │
//! │  ┌─────────────────────────────────────────┘           │
//! │  │  Compaction (L0 merge / L0 upgrade / Ln→Ln+1)      │
//! │  └────────────────────────────────────────────────────┐│
//! │                                                        │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │         Version set (MANIFEST + CURRENT)         │  │
//! │  └──────────────────────────────────────────────────┘  │
//! │  ┌──────────────────────────────────────────────────┐  │
//! │  │      Secondary indexes (B+-tree, per field)      │  │
//! │  └──────────────────────────────────────────────────┘  │
//! └────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`db`] | Database / table façade — open, create, destroy, list |
//! | [`engine`] | Per-table orchestrator — insert, get, query, flush, compact |
//! | [`schema`] | Field types, values, schema definition and validation |
//! | [`record`] | Typed binary row codec with CRC32 integrity |
//! | [`memtable`] | In-memory seq-ordered write buffer |
//! | [`wal`] | Segmented, CRC-protected write-ahead log |
//! | [`sstable`] | Immutable, sorted, on-disk tables with sparse indices |
//! | [`version`] | File-set snapshots and the MANIFEST edit log |
//! | [`compaction`] | Multi-stage leveled compaction picker and executor |
//! | [`index`] | Persistent per-field secondary indexes (B+-tree) |
//! | [`query`] | Merged read iterator and the query builder |
//! | [`encoding`] | Deterministic binary encoding for on-disk structures |
//!
//! ## Key guarantees
//!
//! - **Write-ahead logging** — every insert is persisted to a WAL before
//!   being acknowledged (flush policy configurable).
//! - **Strictly monotonic sequence numbers** — `seq` is assigned under the
//!   write lock; ordering survives crashes, though gaps may appear after
//!   tail-corruption recovery.
//! - **Crash-safe metadata** — the live file set only changes through
//!   checksummed MANIFEST edits published atomically.
//! - **Bounded levels** — a background compactor coalesces L0 runs,
//!   promotes files to L1, and spills oversized levels downward without
//!   ever breaking sequence continuity.
//! - **Indexed point queries** — per-field B+-tree indexes map values to
//!   seq lists and repair themselves incrementally after restarts.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use srdb::{Database, Field, FieldType, Value};
//!
//! let db = Database::open("/tmp/my_db").unwrap();
//!
//! let schema = srdb::Schema::new(vec![
//!     Field::new("name", FieldType::String),
//!     Field::new("category", FieldType::String).indexed(),
//!     Field::new("price", FieldType::Float64).nullable(),
//! ]).unwrap();
//!
//! let table = db.create_table("products", schema).unwrap();
//!
//! let seq = table.insert([
//!     ("name".to_string(), Value::String("widget".into())),
//!     ("category".to_string(), Value::String("tools".into())),
//! ].into_iter().collect()).unwrap();
//!
//! let row = table.get(seq).unwrap();
//! assert_eq!(row.get("name"), Some(&Value::String("widget".into())));
//!
//! let rows = table.query()
//!     .filter_eq("category", Value::String("tools".into()))
//!     .collect()
//!     .unwrap();
//! assert_eq!(rows.len(), 1);
//!
//! db.close().unwrap();
//! ```

#![allow(dead_code)]

pub mod compaction;
pub mod db;
pub mod encoding;
pub mod engine;
pub mod index;
pub mod memtable;
pub mod query;
pub mod record;
pub mod schema;
pub mod sstable;
pub mod version;
pub mod wal;

pub use db::{Database, DbError, Table};
pub use engine::{EngineError, TableConfig, TableStats};
pub use query::QueryBuilder;
pub use record::Row;
pub use schema::{Field, FieldType, Schema, SchemaError, Value};
pub use wal::WalFlushPolicy;
