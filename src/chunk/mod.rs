// ABOUTME: Chunking strategies that split one table into independently dumpable ranges
// ABOUTME: Holds the adaptive sizer, the step sum type and the per-job execution dispatch

pub mod char;
pub mod integer;
pub mod partition;
pub mod selection;

use crate::catalog::DbTable;
use crate::config::RowsPerChunk;
use crate::connection::DumpConnection;
use crate::context::DumpContext;
use crate::jobs::TableJob;
use crate::writer;
use anyhow::Result;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub use self::char::CharStep;
pub use self::integer::IntegerStep;
pub use self::partition::PartitionStep;

/// Chunks that take longer than this shrink
pub const SLOW_CHUNK: Duration = Duration::from_secs(2);
/// Chunks that finish faster than this grow
pub const FAST_CHUNK: Duration = Duration::from_secs(1);

/// Adaptive step control shared by the integer and char strategies
///
/// Each chunk is timed; the next window halves when a chunk was slow and
/// doubles when it was fast, always staying within `[floor, ceiling]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSizer {
    floor: u64,
    target: u64,
    ceiling: u64,
}

impl ChunkSizer {
    pub fn new(rows: RowsPerChunk) -> Self {
        let floor = rows.floor.max(1);
        let ceiling = rows.ceiling.max(floor);
        Self {
            floor,
            target: rows.target.clamp(floor, ceiling),
            ceiling,
        }
    }

    /// Step every new chunk-step starts with
    pub fn initial(&self) -> u64 {
        self.target
    }

    pub fn floor(&self) -> u64 {
        self.floor
    }

    pub fn ceiling(&self) -> u64 {
        self.ceiling
    }

    /// Next step given how long the last chunk took
    pub fn resize(&self, step: u64, elapsed: Duration) -> u64 {
        let next = if elapsed > SLOW_CHUNK {
            step / 2
        } else if elapsed < FAST_CHUNK {
            step.saturating_mul(2)
        } else {
            step
        };
        next.clamp(self.floor, self.ceiling)
    }
}

/// How a table is split, decided once per table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChunkType {
    Integer,
    Char,
    Partition,
    None,
}

impl fmt::Display for ChunkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChunkType::Integer => "INTEGER",
            ChunkType::Char => "CHAR",
            ChunkType::Partition => "PARTITION",
            ChunkType::None => "NONE",
        };
        f.write_str(name)
    }
}

/// One live range of a table
///
/// A step sits in exactly one table's chunk list. Code that touches both the
/// list and a step takes the list lock first.
#[derive(Debug)]
pub enum ChunkStep {
    Integer(IntegerStep),
    Char(CharStep),
    Partition(PartitionStep),
}

impl ChunkStep {
    pub fn chunk_type(&self) -> ChunkType {
        match self {
            ChunkStep::Integer(_) => ChunkType::Integer,
            ChunkStep::Char(_) => ChunkType::Char,
            ChunkStep::Partition(_) => ChunkType::Partition,
        }
    }

    /// Rough number of windows left, used to pick what to steal
    pub fn estimated_remaining_steps(&self) -> u64 {
        match self {
            ChunkStep::Integer(step) => step.estimated_remaining_steps(),
            ChunkStep::Char(_) => 1,
            ChunkStep::Partition(step) => step.remaining() as u64,
        }
    }

    /// Produce work for an idle worker out of this step
    ///
    /// Called with the owning table's chunk list locked. Integer steps hand
    /// back a freshly split-off step that the caller must register, char steps
    /// an unregistered successor that registers itself once its boundary is
    /// known, and partition steps are shared as they are.
    pub(crate) fn steal(self: &Arc<Self>) -> Option<Stolen> {
        match &**self {
            ChunkStep::Integer(step) => step
                .split()
                .map(|split| Stolen::Register(Arc::new(ChunkStep::Integer(split)))),
            ChunkStep::Char(step) => step
                .begin_split(self)
                .map(|successor| Stolen::Pending(Arc::new(ChunkStep::Char(successor)))),
            ChunkStep::Partition(step) => step.has_remaining().then(|| Stolen::Shared(self.clone())),
        }
    }
}

/// What stealing from a step produced
pub(crate) enum Stolen {
    /// A new step to add to the table's list
    Register(Arc<ChunkStep>),
    /// A step that is not in the list yet
    Pending(Arc<ChunkStep>),
    /// The same step, worked on concurrently
    Shared(Arc<ChunkStep>),
}

impl Stolen {
    pub(crate) fn into_step(self) -> Arc<ChunkStep> {
        match self {
            Stolen::Register(step) | Stolen::Pending(step) | Stolen::Shared(step) => step,
        }
    }
}

/// Run one data job to completion
///
/// Jobs without a step dump the whole table into a single file.
pub async fn process_table_job<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    job: TableJob,
) -> Result<()> {
    let TableJob { table, step } = job;

    let Some(step) = step else {
        writer::write_chunk(ctx, conn, &table, &writer::ChunkQuery::whole_table()).await?;
        finish_table(ctx, &table);
        return Ok(());
    };

    let retired = match &*step {
        ChunkStep::Integer(integer) => {
            integer::process(ctx, conn, &table, integer).await?;
            true
        }
        ChunkStep::Char(char_step) => char::process(ctx, conn, &table, &step, char_step).await?,
        ChunkStep::Partition(partition) => partition::process(ctx, conn, &table, partition).await?,
    };

    if retired && table.finish_step(&step) {
        finish_table(ctx, &table);
    }
    Ok(())
}

/// Called by the worker that emptied a table's chunk list
pub(crate) fn finish_table(ctx: &DumpContext, table: &Arc<DbTable>) {
    if table.mark_completed() {
        tracing::info!(
            "Table completed: {} ({} rows in {} chunk(s))",
            table.qualified(),
            table.rows_dumped(),
            table.chunks_written()
        );
        ctx.pipeline.remove_from_pools(table);
        ctx.progress.inc(1);
    }
}
