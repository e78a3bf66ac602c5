// ABOUTME: Databases and tables selected for the dump, with their live chunk-step lists
// ABOUTME: Read-mostly after discovery except for chunk lists and counters

pub mod discovery;

use crate::chunk::{ChunkStep, ChunkType, Stolen};
use crate::utils::{qualified_name, quote_ident};
use parking_lot::Mutex;
use std::cmp::Reverse;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

/// A schema selected for the dump
#[derive(Debug)]
pub struct Database {
    pub name: String,
    /// Backtick-quoted name, ready for SQL
    pub escaped: String,
    schema_emitted: Mutex<bool>,
}

impl Database {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            escaped: quote_ident(name),
            schema_emitted: Mutex::new(false),
        }
    }

    /// Returns true exactly once, for the caller that must emit the
    /// database's schema job
    pub fn claim_schema_job(&self) -> bool {
        let mut emitted = self.schema_emitted.lock();
        if *emitted {
            return false;
        }
        *emitted = true;
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TableKind {
    #[default]
    Base,
    View,
    Sequence,
}

/// What discovery learned about a table
#[derive(Debug, Clone, Default)]
pub struct TableInfo {
    pub kind: TableKind,
    pub engine: String,
    pub is_transactional: bool,
    pub rows_estimate: u64,
    pub data_length: u64,
    pub charset: Option<String>,
    /// Explicit column list; `None` selects `*`
    pub columns: Option<Vec<String>>,
    /// Primary key columns in key order
    pub primary_key: Vec<String>,
}

/// One table, view or sequence selected for the dump
#[derive(Debug)]
pub struct DbTable {
    pub database: Arc<Database>,
    pub name: String,
    pub kind: TableKind,
    pub engine: String,
    pub is_transactional: bool,
    pub rows_estimate: u64,
    pub data_length: u64,
    pub charset: Option<String>,
    pub columns: Option<Vec<String>>,
    pub primary_key: Vec<String>,
    chunk_type: OnceLock<ChunkType>,
    chunks: Mutex<Vec<Arc<ChunkStep>>>,
    chunk_numbers: AtomicU64,
    chunks_written: AtomicU64,
    rows_dumped: AtomicU64,
    checksum: Mutex<Option<String>>,
    completed: AtomicBool,
}

impl DbTable {
    pub fn new(database: Arc<Database>, name: &str, info: TableInfo) -> Self {
        let TableInfo {
            kind,
            engine,
            is_transactional,
            rows_estimate,
            data_length,
            charset,
            columns,
            primary_key,
        } = info;
        Self {
            database,
            name: name.to_string(),
            kind,
            engine,
            is_transactional,
            rows_estimate,
            data_length,
            charset,
            columns,
            primary_key,
            chunk_type: OnceLock::new(),
            chunks: Mutex::new(Vec::new()),
            chunk_numbers: AtomicU64::new(0),
            chunks_written: AtomicU64::new(0),
            rows_dumped: AtomicU64::new(0),
            checksum: Mutex::new(None),
            completed: AtomicBool::new(false),
        }
    }

    /// `` `db`.`table` ``
    pub fn qualified(&self) -> String {
        qualified_name(&self.database.name, &self.name)
    }

    /// `db.table`, as used in file names and filters
    pub fn display_name(&self) -> String {
        format!("{}.{}", self.database.name, self.name)
    }

    /// The chunk type, `None` until `DetermineChunkType` ran
    pub fn chunk_type(&self) -> Option<ChunkType> {
        self.chunk_type.get().copied()
    }

    /// Record the chunk type; only the first call has any effect
    pub fn set_chunk_type(&self, chunk_type: ChunkType) -> bool {
        self.chunk_type.set(chunk_type).is_ok()
    }

    pub fn add_step(&self, step: Arc<ChunkStep>) {
        self.chunks.lock().push(step);
    }

    /// Run `f` with the chunk list locked
    pub fn with_chunks<R>(&self, f: impl FnOnce(&mut Vec<Arc<ChunkStep>>) -> R) -> R {
        f(&mut self.chunks.lock())
    }

    /// Remove a finished step; returns true when it was the table's last one
    pub fn finish_step(&self, step: &Arc<ChunkStep>) -> bool {
        let mut chunks = self.chunks.lock();
        let before = chunks.len();
        chunks.retain(|s| !Arc::ptr_eq(s, step));
        before != chunks.len() && chunks.is_empty()
    }

    /// Find work for an idle worker among this table's steps
    ///
    /// The step with the most estimated work left is tried first.
    pub(crate) fn steal(&self) -> Option<Arc<ChunkStep>> {
        let mut chunks = self.chunks.lock();
        let mut candidates: Vec<Arc<ChunkStep>> = chunks.clone();
        candidates.sort_by_key(|step| Reverse(step.estimated_remaining_steps()));

        for candidate in candidates {
            match candidate.steal() {
                Some(Stolen::Register(step)) => {
                    chunks.push(step.clone());
                    return Some(step);
                }
                Some(stolen) => return Some(stolen.into_step()),
                None => {}
            }
        }
        None
    }

    /// Name of the next data file of this table
    ///
    /// Only call this once the file is known to be kept, so numbering has
    /// no gaps.
    pub fn next_chunk_file(&self) -> String {
        let number = self.chunk_numbers.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}.{}.{:05}.sql",
            self.database.name, self.name, number
        )
    }

    /// Data files persisted so far
    pub fn chunks_written(&self) -> u64 {
        self.chunks_written.load(Ordering::SeqCst)
    }

    /// Account for one persisted data file
    pub fn record_chunk(&self, rows: u64) {
        self.chunks_written.fetch_add(1, Ordering::SeqCst);
        self.rows_dumped.fetch_add(rows, Ordering::SeqCst);
    }

    pub fn rows_dumped(&self) -> u64 {
        self.rows_dumped.load(Ordering::SeqCst)
    }

    pub fn set_checksum(&self, checksum: Option<String>) {
        *self.checksum.lock() = checksum;
    }

    pub fn checksum(&self) -> Option<String> {
        self.checksum.lock().clone()
    }

    /// Returns true for the single caller that completes the table
    pub fn mark_completed(&self) -> bool {
        !self.completed.swap(true, Ordering::SeqCst)
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    /// Whether rows of this table are exported at all
    pub fn has_data(&self) -> bool {
        self.kind == TableKind::Base && !self.engine.eq_ignore_ascii_case("MRG_MYISAM")
    }
}

/// Every database and table discovered so far
#[derive(Debug, Default)]
pub struct Catalog {
    databases: Mutex<BTreeMap<String, Arc<Database>>>,
    tables: Mutex<Vec<Arc<DbTable>>>,
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The database entry for `name`, created on first use
    pub fn database(&self, name: &str) -> Arc<Database> {
        self.databases
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Database::new(name)))
            .clone()
    }

    pub fn databases(&self) -> Vec<Arc<Database>> {
        self.databases.lock().values().cloned().collect()
    }

    /// Adds a table unless one with the same name is already known
    ///
    /// Returns the catalog's entry and whether it was newly added.
    pub fn add_table(&self, table: DbTable) -> (Arc<DbTable>, bool) {
        let mut tables = self.tables.lock();
        if let Some(existing) = tables
            .iter()
            .find(|t| t.database.name == table.database.name && t.name == table.name)
        {
            return (existing.clone(), false);
        }
        let table = Arc::new(table);
        tables.push(table.clone());
        (table, true)
    }

    pub fn tables(&self) -> Vec<Arc<DbTable>> {
        self.tables.lock().clone()
    }

    /// Tables whose rows are dumped without a snapshot transaction guarantee
    pub fn non_transactional_tables(&self) -> Vec<Arc<DbTable>> {
        self.tables
            .lock()
            .iter()
            .filter(|t| t.has_data() && !t.is_transactional)
            .cloned()
            .collect()
    }
}
