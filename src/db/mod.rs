//! Database façade — named tables under one root directory.
//!
//! A [`Database`] is a directory of tables; each table is a
//! subdirectory owning its schema file, WAL, MANIFEST, sorted tables,
//! and secondary indexes:
//!
//! ```text
//! <root>/
//!   <table>/
//!     schema.json        canonical schema + checksum
//!     CURRENT            name of the active MANIFEST
//!     MANIFEST           append-only log of version edits
//!     wal/               WAL segments (wal-<id>.log)
//!     sst/               sorted tables (<n>.sst)
//!     idx_<field>.sst    one per indexed field
//! ```
//!
//! Tables found on open (any subdirectory with a `schema.json`) are
//! opened eagerly so recovery cost is paid up front.


use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{info, warn};

use crate::engine::{Engine, EngineError, TableConfig, TableStats};
use crate::query::QueryBuilder;
use crate::record::Row;
use crate::schema::{SCHEMA_FILE, Schema, SchemaError, Value};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by database-level operations.
#[derive(Debug, Error)]
pub enum DbError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Failure inside a table's engine.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),

    /// Schema load/save failure.
    #[error("schema error: {0}")]
    Schema(#[from] SchemaError),

    /// Named table does not exist.
    #[error("table `{0}` not found")]
    TableNotFound(String),

    /// Named table already exists.
    #[error("table `{0}` already exists")]
    TableExists(String),

    /// Operation on a closed database.
    #[error("database is closed")]
    Closed,

    /// Table name is empty or contains path separators.
    #[error("invalid table name `{0}`")]
    InvalidParam(String),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Table
// ------------------------------------------------------------------------------------------------

/// A handle to one open table.
pub struct Table {
    name: String,
    schema: Arc<Schema>,
    engine: Engine,
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table").field("name", &self.name).finish()
    }
}

impl Table {
    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The immutable table schema.
    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    /// Inserts a row, returning its assigned seq.
    pub fn insert(&self, values: HashMap<String, Value>) -> Result<u64, EngineError> {
        self.engine.insert(values)
    }

    /// Point lookup by seq.
    pub fn get(&self, seq: u64) -> Result<Row, EngineError> {
        self.engine.get(seq)
    }

    /// Starts building a query.
    pub fn query(&self) -> QueryBuilder<'_> {
        self.engine.query()
    }

    /// Names of the indexed fields.
    pub fn list_indexes(&self) -> Vec<String> {
        self.engine.list_indexes()
    }

    /// Current table statistics.
    pub fn stats(&self) -> Result<TableStats, EngineError> {
        self.engine.stats()
    }

    /// Forces in-memory rows down to L0.
    pub fn flush(&self) -> Result<(), EngineError> {
        self.engine.flush()
    }

    /// Closes the table's engine, draining background work.
    pub fn close(&self) -> Result<(), EngineError> {
        self.engine.close()
    }
}

// ------------------------------------------------------------------------------------------------
// Database
// ------------------------------------------------------------------------------------------------

/// A directory of tables.
pub struct Database {
    dir: PathBuf,
    config: TableConfig,
    tables: Mutex<HashMap<String, Arc<Table>>>,
    closed: AtomicBool,
}

impl Database {
    /// Opens (or creates) a database at `dir` with default tuning.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, DbError> {
        Self::open_with_config(dir, TableConfig::default())
    }

    /// Opens (or creates) a database with explicit tuning applied to
    /// every table.
    pub fn open_with_config(dir: impl AsRef<Path>, config: TableConfig) -> Result<Self, DbError> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let mut tables = HashMap::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            let path = entry.path();
            if !path.is_dir() || !path.join(SCHEMA_FILE).exists() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|n| n.to_str()).map(String::from) else {
                continue;
            };
            let table = Self::open_table(&path, &name, &config)?;
            tables.insert(name, Arc::new(table));
        }

        info!(dir = %dir.display(), tables = tables.len(), "database opened");
        Ok(Self {
            dir,
            config,
            tables: Mutex::new(tables),
            closed: AtomicBool::new(false),
        })
    }

    fn open_table(path: &Path, name: &str, config: &TableConfig) -> Result<Table, DbError> {
        let schema = Schema::load(path.join(SCHEMA_FILE))?;
        let engine = Engine::open(path, schema.clone(), config.clone())?;
        Ok(Table {
            name: name.to_string(),
            schema: Arc::new(schema),
            engine,
        })
    }

    fn check_open(&self) -> Result<(), DbError> {
        if self.closed.load(Ordering::SeqCst) {
            Err(DbError::Closed)
        } else {
            Ok(())
        }
    }

    fn validate_name(name: &str) -> Result<(), DbError> {
        if name.is_empty()
            || name.starts_with('.')
            || name.contains(['/', '\\'])
        {
            return Err(DbError::InvalidParam(name.to_string()));
        }
        Ok(())
    }

    fn lock_tables(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, Arc<Table>>>, DbError> {
        self.tables
            .lock()
            .map_err(|_| DbError::Internal("table map lock poisoned".into()))
    }

    /// Creates a new table with the given schema.
    pub fn create_table(&self, name: &str, schema: Schema) -> Result<Arc<Table>, DbError> {
        self.check_open()?;
        Self::validate_name(name)?;

        let mut tables = self.lock_tables()?;
        if tables.contains_key(name) {
            return Err(DbError::TableExists(name.to_string()));
        }
        let path = self.dir.join(name);
        if path.join(SCHEMA_FILE).exists() {
            return Err(DbError::TableExists(name.to_string()));
        }

        fs::create_dir_all(&path)?;
        schema.save(path.join(SCHEMA_FILE))?;

        let table = Arc::new(Self::open_table(&path, name, &self.config)?);
        tables.insert(name.to_string(), Arc::clone(&table));

        info!(table = name, "table created");
        Ok(table)
    }

    /// Returns an open table by name.
    pub fn get_table(&self, name: &str) -> Result<Arc<Table>, DbError> {
        self.check_open()?;
        self.lock_tables()?
            .get(name)
            .cloned()
            .ok_or_else(|| DbError::TableNotFound(name.to_string()))
    }

    /// Table names, sorted.
    pub fn list_tables(&self) -> Result<Vec<String>, DbError> {
        self.check_open()?;
        let mut names: Vec<String> = self.lock_tables()?.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Closes and irreversibly deletes a table.
    pub fn destroy_table(&self, name: &str) -> Result<(), DbError> {
        self.check_open()?;
        let table = {
            let mut tables = self.lock_tables()?;
            tables
                .remove(name)
                .ok_or_else(|| DbError::TableNotFound(name.to_string()))?
        };

        table.close()?;
        fs::remove_dir_all(self.dir.join(name))?;
        info!(table = name, "table destroyed");
        Ok(())
    }

    /// Removes all rows from a table by destroying and recreating it
    /// with the same schema.
    pub fn clean_table(&self, name: &str) -> Result<Arc<Table>, DbError> {
        self.check_open()?;
        let schema = {
            let tables = self.lock_tables()?;
            let table = tables
                .get(name)
                .ok_or_else(|| DbError::TableNotFound(name.to_string()))?;
            table.schema.as_ref().clone()
        };

        self.destroy_table(name)?;
        self.create_table(name, schema)
    }

    /// Closes every table and marks the database closed.
    pub fn close(&self) -> Result<(), DbError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let tables = self.lock_tables()?;
        for (name, table) in tables.iter() {
            if let Err(e) = table.close() {
                warn!(table = %name, error = %e, "table close failed");
            }
        }
        info!(dir = %self.dir.display(), "database closed");
        Ok(())
    }
}
