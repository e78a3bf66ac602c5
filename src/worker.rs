// ABOUTME: One dump worker: owns a session and walks the pipeline stages in order
// ABOUTME: Dispatches each dequeued job and steals chunk work once a data queue runs dry

use crate::barrier::SnapshotOutcome;
use crate::catalog::discovery;
use crate::chunk::{self, selection};
use crate::connection::DumpConnection;
use crate::context::DumpContext;
use crate::error::{self, DumpError};
use crate::jobs::{Job, JobQueue, SchemaJob};
use crate::pipeline::{Pipeline, StagePool};
use crate::writer;
use anyhow::{Context, Result};
use std::sync::Arc;

/// Pipeline stages in the order every worker runs them
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Discovery,
    Schema,
    NonTransactional,
    Transactional,
    PostData,
}

impl Stage {
    fn queue(self, pipeline: &Pipeline) -> &JobQueue {
        match self {
            Stage::Discovery => &pipeline.discovery,
            Stage::Schema => &pipeline.schema,
            Stage::NonTransactional => &pipeline.non_transactional,
            Stage::Transactional => &pipeline.transactional,
            Stage::PostData => &pipeline.post_data,
        }
    }

    /// Data stages refill from their stealing pool
    fn pool(self, pipeline: &Pipeline) -> Option<&StagePool> {
        match self {
            Stage::NonTransactional => Some(&pipeline.non_transactional_tables),
            Stage::Transactional => Some(&pipeline.transactional_tables),
            _ => None,
        }
    }

    /// Whether a job belongs on this stage's queue
    pub fn accepts(self, job: &Job) -> bool {
        match self {
            Stage::Discovery => job.is_discovery() || matches!(job, Job::WriteSnapshotInfo),
            Stage::Schema => matches!(
                job,
                Job::DumpSchema(_) | Job::DumpSequence(_) | Job::DetermineChunkType(_)
            ),
            Stage::NonTransactional => matches!(job, Job::DumpDataNonTransactional(_)),
            Stage::Transactional => matches!(job, Job::DumpData(_)),
            Stage::PostData => matches!(
                job,
                Job::DumpView(_) | Job::DumpTriggers(_) | Job::DumpChecksum(_) | Job::DumpPostData(_)
            ),
        }
    }
}

pub struct Worker<C: DumpConnection> {
    id: usize,
    ctx: Arc<DumpContext>,
    conn: C,
    /// Holds the non-transactional table locks under `less_locking`
    ///
    /// `LOCK TABLES` commits the running transaction, so it never runs on
    /// the snapshot session.
    lock_session: Option<C>,
    /// Replication marker of this worker's snapshot, once certified
    marker: Option<String>,
}

impl<C: DumpConnection> Worker<C> {
    pub fn new(id: usize, ctx: Arc<DumpContext>, conn: C) -> Self {
        Self {
            id,
            ctx,
            conn,
            lock_session: None,
            marker: None,
        }
    }

    pub fn with_lock_session(mut self, session: C) -> Self {
        self.lock_session = Some(session);
        self
    }

    /// Run every stage, then close the session
    ///
    /// An error returned here is fatal for the whole dump; per-job failures
    /// are counted and skipped.
    pub async fn run(mut self) -> Result<()> {
        let result = self.drive().await;
        let Worker {
            id,
            conn,
            lock_session,
            marker,
            ..
        } = self;
        if let Some(session) = lock_session {
            if let Err(e) = session.close().await {
                tracing::warn!("Thread {}: failed to close lock session: {:#}", id, e);
            }
        }
        if let Err(e) = conn.close().await {
            tracing::warn!("Thread {}: failed to close session: {:#}", id, e);
        }
        tracing::info!("Thread {}: shutting down (snapshot marker {:?})", id, marker);
        result
    }

    async fn drive(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        let pipeline = &ctx.pipeline;

        self.init_session().await?;
        self.establish_snapshot().await?;

        pipeline.ready.signal();
        tracing::info!("Thread {}: creating jobs", self.id);
        self.drain(Stage::Discovery).await?;

        pipeline.ready.signal();
        tracing::info!("Thread {}: schema queue", self.id);
        self.drain(Stage::Schema).await?;

        if ctx.options.no_data {
            pipeline.unlock_tables.signal();
        } else {
            pipeline.ready.signal();
            pipeline.ready_non_transactional.wait(1).await?;
            tracing::info!("Thread {}: schema done, starting non-transactional tables", self.id);

            if ctx.options.less_locking {
                self.lock_non_transactional().await?;
                pipeline.unlock_tables.signal();
                self.drain(Stage::NonTransactional).await?;
                self.unlock_non_transactional().await?;
            } else {
                self.drain(Stage::NonTransactional).await?;
                pipeline.unlock_tables.signal();
            }

            tracing::info!("Thread {}: non-transactional done, starting transactional tables", self.id);
            self.drain(Stage::Transactional).await?;
        }

        self.drain(Stage::PostData).await?;
        Ok(())
    }

    async fn lock_non_transactional(&mut self) -> Result<()> {
        let Some(statement) = self.ctx.pipeline.lock_tables_statement() else {
            return Ok(());
        };
        let session = self
            .lock_session
            .as_mut()
            .ok_or_else(|| DumpError::Fatal("less_locking needs a lock session".into()))?;
        session.execute(&statement).await.map_err(|e| {
            DumpError::Fatal(format!("Error locking non-transactional tables: {:#}", e))
        })?;
        tracing::debug!("Thread {}: non-transactional tables locked", self.id);
        Ok(())
    }

    async fn unlock_non_transactional(&mut self) -> Result<()> {
        if let Some(session) = self.lock_session.as_mut() {
            session.execute("UNLOCK TABLES").await.map_err(|e| {
                DumpError::Fatal(format!("Error unlocking non-transactional tables: {:#}", e))
            })?;
        }
        Ok(())
    }

    async fn init_session(&mut self) -> Result<()> {
        if !self.ctx.options.skip_tz {
            if let Err(e) = self.conn.execute("/*!40103 SET TIME_ZONE='+00:00' */").await {
                tracing::error!("Thread {}: failed to set time zone: {:#}", self.id, e);
            }
        }
        self.conn
            .execute("SET SESSION TRANSACTION ISOLATION LEVEL REPEATABLE READ")
            .await
            .context("Failed to set isolation level")
    }

    async fn establish_snapshot(&mut self) -> Result<()> {
        let ctx = self.ctx.clone();
        let outcome = ctx.pipeline.barrier.establish(&mut self.conn, self.id).await?;
        match outcome {
            SnapshotOutcome::Consistent(marker) => {
                tracing::debug!("Thread {}: snapshot certified at {}", self.id, marker);
                self.marker = Some(marker);
                ctx.mark_consistent();
            }
            SnapshotOutcome::Inconsistent { rounds } => {
                if !ctx.options.no_locks {
                    return Err(DumpError::InconsistentSnapshot { rounds }.into());
                }
                tracing::warn!(
                    "Thread {}: backup will not be consistent, workers disagreed for {} round(s)",
                    self.id,
                    rounds
                );
            }
            SnapshotOutcome::Undetermined => {
                if ctx.options.no_locks {
                    tracing::warn!(
                        "Thread {}: not able to determine if the backup will be consistent",
                        self.id
                    );
                } else {
                    tracing::info!(
                        "Thread {}: no replication marker to compare, relying on the global read lock",
                        self.id
                    );
                }
            }
        }
        Ok(())
    }

    /// Process one stage's queue until its shutdown job arrives
    async fn drain(&mut self, stage: Stage) -> Result<()> {
        let ctx = self.ctx.clone();
        let queue = stage.queue(&ctx.pipeline);
        let pool = stage.pool(&ctx.pipeline);

        loop {
            ctx.wait_if_paused().await;

            let job = match pool {
                Some(pool) => match queue.try_pop() {
                    Some(job) => job,
                    None => match pool.take_any() {
                        Some(stolen) => stolen.into_job(),
                        None => queue.pop().await,
                    },
                },
                None => queue.pop().await,
            };

            if job.is_shutdown() {
                if let Some(pool) = pool {
                    while !ctx.is_shutting_down() {
                        let Some(stolen) = pool.take_any() else {
                            break;
                        };
                        self.run_job(stage, stolen.into_job()).await?;
                    }
                }
                tracing::debug!("Thread {}: {} queue done", self.id, queue.name());
                return Ok(());
            }

            if ctx.is_shutting_down() {
                self.discard(job);
                continue;
            }
            self.run_job(stage, job).await?;
        }
    }

    /// Drop a job without running it, keeping stage bookkeeping intact
    fn discard(&self, job: Job) {
        tracing::debug!("Thread {}: discarding {:?}", self.id, job);
        if job.is_discovery() {
            self.ctx.pipeline.discovery_jobs.end();
        }
        if matches!(job, Job::WriteSnapshotInfo) {
            self.ctx.pipeline.snapshot_info.signal();
        }
    }

    /// Run a job; only fatal errors propagate
    async fn run_job(&mut self, stage: Stage, job: Job) -> Result<()> {
        let description = format!("{:?}", job);
        let discovery = job.is_discovery();

        let result = if stage.accepts(&job) {
            self.process(job).await
        } else {
            Err(DumpError::UnknownJob(job.kind()).into())
        };
        if discovery {
            self.ctx.pipeline.discovery_jobs.end();
        }

        match result {
            Ok(()) => Ok(()),
            Err(e) if error::is_fatal(&e) => {
                tracing::error!("Thread {}: {} failed: {:#}", self.id, description, e);
                Err(e)
            }
            Err(e) => {
                tracing::error!("Thread {}: {} failed: {:#}", self.id, description, e);
                self.ctx.record_error();
                Ok(())
            }
        }
    }

    async fn process(&mut self, job: Job) -> Result<()> {
        let ctx = self.ctx.clone();
        let conn = &mut self.conn;
        match job {
            Job::DiscoverAllDatabases => discovery::discover_all_databases(&ctx, conn).await,
            Job::DiscoverDatabase(database) => {
                discovery::discover_database(&ctx, conn, &database).await
            }
            Job::DiscoverTableList(tables) => {
                discovery::discover_table_list(&ctx, conn, &tables).await
            }
            Job::DetermineChunkType(table) => {
                selection::determine_chunk_type(&ctx, conn, &table).await
            }
            Job::DumpSchema(SchemaJob::CreateDatabase(database)) => {
                writer::write_database_schema(&ctx, conn, &database).await
            }
            Job::DumpSchema(SchemaJob::Table(table)) => {
                writer::write_table_schema(&ctx, conn, &table).await
            }
            Job::DumpView(table) => writer::write_view_schema(&ctx, conn, &table).await,
            Job::DumpSequence(table) => writer::write_sequence_schema(&ctx, conn, &table).await,
            Job::DumpTriggers(table) => writer::write_triggers(&ctx, conn, &table).await,
            Job::DumpChecksum(table) => writer::write_checksum(conn, &table).await,
            Job::DumpData(table_job) | Job::DumpDataNonTransactional(table_job) => {
                chunk::process_table_job(&ctx, conn, table_job).await
            }
            Job::DumpPostData(database) => writer::write_post_data(&ctx, conn, &database).await,
            Job::WriteSnapshotInfo => {
                let captured = writer::capture_snapshot_info(conn).await;
                ctx.pipeline.snapshot_info.signal();
                ctx.set_snapshot_info(captured?);
                Ok(())
            }
            Job::Shutdown => Ok(()),
        }
    }
}
