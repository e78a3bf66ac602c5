// ABOUTME: Units of work flowing through the dump pipeline
// ABOUTME: Each job is created by discovery or chunking and consumed exactly once

pub mod queue;

pub use queue::JobQueue;

use crate::catalog::{Database, DbTable};
use crate::chunk::ChunkStep;
use std::fmt;
use std::sync::Arc;

/// A unit of work for one worker
pub enum Job {
    DiscoverAllDatabases,
    DiscoverDatabase(Arc<Database>),
    /// Explicit `db.table` names
    DiscoverTableList(Vec<String>),
    DetermineChunkType(Arc<DbTable>),
    DumpSchema(SchemaJob),
    DumpView(Arc<DbTable>),
    DumpSequence(Arc<DbTable>),
    DumpTriggers(Arc<DbTable>),
    DumpChecksum(Arc<DbTable>),
    DumpData(TableJob),
    DumpDataNonTransactional(TableJob),
    /// Procedures, functions and events of one database
    DumpPostData(Arc<Database>),
    WriteSnapshotInfo,
    Shutdown,
}

pub enum SchemaJob {
    CreateDatabase(Arc<Database>),
    Table(Arc<DbTable>),
}

/// Data job for one table, optionally bound to a chunk-step
pub struct TableJob {
    pub table: Arc<DbTable>,
    pub step: Option<Arc<ChunkStep>>,
}

impl TableJob {
    pub fn new(table: Arc<DbTable>, step: Option<Arc<ChunkStep>>) -> Self {
        Self { table, step }
    }

    /// Wrap into the data job kind matching the table's stage
    pub fn into_job(self) -> Job {
        if self.table.is_transactional {
            Job::DumpData(self)
        } else {
            Job::DumpDataNonTransactional(self)
        }
    }
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::DiscoverAllDatabases => "DiscoverAllDatabases",
            Job::DiscoverDatabase(_) => "DiscoverDatabase",
            Job::DiscoverTableList(_) => "DiscoverTableList",
            Job::DetermineChunkType(_) => "DetermineChunkType",
            Job::DumpSchema(_) => "DumpSchema",
            Job::DumpView(_) => "DumpView",
            Job::DumpSequence(_) => "DumpSequence",
            Job::DumpTriggers(_) => "DumpTriggers",
            Job::DumpChecksum(_) => "DumpChecksum",
            Job::DumpData(_) => "DumpData",
            Job::DumpDataNonTransactional(_) => "DumpDataNonTransactional",
            Job::DumpPostData(_) => "DumpPostData",
            Job::WriteSnapshotInfo => "WriteSnapshotInfo",
            Job::Shutdown => "Shutdown",
        }
    }

    /// Discovery jobs are tracked until they finish
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            Job::DiscoverAllDatabases | Job::DiscoverDatabase(_) | Job::DiscoverTableList(_)
        )
    }

    pub fn is_shutdown(&self) -> bool {
        matches!(self, Job::Shutdown)
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Job::DiscoverDatabase(db) | Job::DumpPostData(db) => {
                write!(f, "{}({})", self.kind(), db.name)
            }
            Job::DiscoverTableList(tables) => write!(f, "{}({})", self.kind(), tables.join(",")),
            Job::DetermineChunkType(table)
            | Job::DumpView(table)
            | Job::DumpSequence(table)
            | Job::DumpTriggers(table)
            | Job::DumpChecksum(table)
            | Job::DumpSchema(SchemaJob::Table(table)) => {
                write!(f, "{}({})", self.kind(), table.qualified())
            }
            Job::DumpSchema(SchemaJob::CreateDatabase(db)) => {
                write!(f, "{}({})", self.kind(), db.name)
            }
            Job::DumpData(job) | Job::DumpDataNonTransactional(job) => {
                write!(f, "{}({})", self.kind(), job.table.qualified())
            }
            _ => f.write_str(self.kind()),
        }
    }
}
