// ABOUTME: Dump coordinator: takes the global freeze, feeds the pipeline and gates its stages
// ABOUTME: Spawns one worker task per thread and reports what was written

use crate::catalog::discovery;
use crate::chunk::ChunkType;
use crate::config::DumpOptions;
use crate::connection::{Connector, DumpConnection};
use crate::context::{DumpContext, DumpControl};
use crate::error::DumpError;
use crate::filters::DumpFilter;
use crate::jobs::{Job, JobQueue};
use crate::pipeline::build_lock_tables_statement;
use crate::sink::FileSink;
use crate::utils::{retry_with_backoff, unix_timestamp};
use crate::worker::Worker;
use crate::writer;
use anyhow::{anyhow, Context, Result};
use futures::future::try_join_all;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;

/// Per-table outcome of a dump
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableSummary {
    pub database: String,
    pub table: String,
    pub chunk_type: Option<ChunkType>,
    pub rows: u64,
    pub chunks: u64,
}

#[derive(Debug, Clone, Default)]
pub struct DumpReport {
    /// Per-job failures that were skipped
    pub errors: u64,
    pub tables: Vec<TableSummary>,
    pub chunks: u64,
    pub rows: u64,
    /// Every worker's snapshot was certified identical
    pub consistent: bool,
    pub files: Vec<PathBuf>,
}

impl DumpReport {
    pub fn is_success(&self) -> bool {
        self.errors == 0
    }

    pub fn table(&self, database: &str, table: &str) -> Option<&TableSummary> {
        self.tables
            .iter()
            .find(|t| t.database == database && t.table == table)
    }
}

/// Run a complete dump
///
/// Returns an error for fatal conditions and for a dump interrupted through
/// [`DumpControl::request_shutdown`]. Failed jobs are counted in
/// [`DumpReport::errors`].
pub async fn run_dump<C: Connector>(
    connector: Arc<C>,
    options: DumpOptions,
    sink: Arc<dyn FileSink>,
    control: Arc<DumpControl>,
) -> Result<DumpReport> {
    options.validate()?;
    let started_at = unix_timestamp();
    let threads = options.threads;

    let mut main = retry_with_backoff(|| connector.connect(), 3, Duration::from_secs(1))
        .await
        .context("Failed to connect to the source database")?;
    tracing::info!("Connected (connection id {})", main.connection_id());

    let locked = options.uses_global_lock();
    if locked {
        tracing::info!("Acquiring global read lock");
        main.execute("FLUSH TABLES WITH READ LOCK")
            .await
            .context("Couldn't acquire global lock. Use no_locks to dump without it")?;
    } else {
        tracing::warn!("Executing in no-locks mode, snapshot might not be consistent");
    }

    let mut filter = DumpFilter::from_options(&options)?;
    if let Some(days) = options.updated_since {
        filter = filter.with_not_updated(discovery::not_updated_tables(&mut main, days).await?);
    }
    let ctx = Arc::new(DumpContext::new(options, filter, sink, control)?);

    seed_discovery(&ctx);

    let sessions = try_join_all((0..threads).map(|_| connector.connect()))
        .await
        .context("Failed to open worker sessions")?;
    let mut lock_sessions = if ctx.options.less_locking {
        try_join_all((0..threads).map(|_| connector.connect()))
            .await
            .context("Failed to open lock sessions")?
    } else {
        Vec::new()
    }
    .into_iter();

    let mut workers = JoinSet::new();
    for (id, conn) in sessions.into_iter().enumerate() {
        let mut worker = Worker::new(id, ctx.clone(), conn);
        if let Some(session) = lock_sessions.next() {
            worker = worker.with_lock_session(session);
        }
        workers.spawn(worker.run());
    }
    tracing::info!("Started {} worker(s)", threads);

    let outcome = tokio::select! {
        result = drive_stages(&ctx, &mut main, threads, locked) => result,
        failure = first_failure(&mut workers) => Err(failure),
    };

    if let Err(e) = outcome {
        ctx.request_shutdown();
        workers.abort_all();
        while workers.join_next().await.is_some() {}
        ctx.progress.abandon();
        let _ = main.close().await;
        return Err(e);
    }

    while let Some(joined) = workers.join_next().await {
        joined.context("Worker task failed")??;
    }
    if let Err(e) = main.close().await {
        tracing::warn!("Failed to close main session: {:#}", e);
    }

    // Discarded jobs leave holes, so an interrupted dump gets no metadata
    if ctx.is_shutting_down() {
        ctx.progress.abandon();
        return Err(DumpError::Interrupted.into());
    }
    ctx.progress.finish_and_clear();

    let metadata = writer::write_metadata(&ctx, started_at)?;
    let report = build_report(&ctx, metadata);
    tracing::info!(
        "Dump finished: {} table(s), {} row(s) in {} chunk(s), {} error(s){}",
        report.tables.len(),
        report.rows,
        report.chunks,
        report.errors,
        if report.consistent {
            ", consistent snapshot"
        } else {
            ""
        }
    );
    Ok(report)
}

/// Queue the snapshot-info job and the root discovery job(s)
fn seed_discovery(ctx: &DumpContext) {
    let pipeline = &ctx.pipeline;
    pipeline.discovery.push_now(Job::WriteSnapshotInfo);

    if !ctx.options.tables_list.is_empty() {
        pipeline.discovery_jobs.begin();
        pipeline
            .discovery
            .push_now(Job::DiscoverTableList(ctx.options.tables_list.clone()));
    } else if !ctx.options.databases.is_empty() {
        for name in &ctx.options.databases {
            pipeline.discovery_jobs.begin();
            pipeline
                .discovery
                .push_now(Job::DiscoverDatabase(ctx.catalog.database(name)));
        }
    } else {
        pipeline.discovery_jobs.begin();
        pipeline.discovery.push_now(Job::DiscoverAllDatabases);
    }
}

fn push_shutdowns(queue: &JobQueue, workers: usize) {
    for _ in 0..workers {
        queue.push_now(Job::Shutdown);
    }
}

/// Walk the stage gates in lockstep with the workers
async fn drive_stages<C: DumpConnection>(
    ctx: &DumpContext,
    main: &mut C,
    threads: usize,
    locked: bool,
) -> Result<()> {
    let pipeline = &ctx.pipeline;

    pipeline.ready.wait(threads).await?;
    tracing::info!("All workers hold their snapshot");

    if locked && ctx.options.trx_consistency_only {
        pipeline.snapshot_info.wait(1).await?;
        tracing::info!("Transactions started, unlocking tables");
        main.execute("UNLOCK TABLES")
            .await
            .context("Failed to release global read lock")?;
    }

    pipeline.discovery_jobs.wait_idle().await;
    push_shutdowns(&pipeline.discovery, threads);
    pipeline.ready.wait(threads).await?;
    tracing::info!("Discovery finished, {} table(s) selected", ctx.catalog.tables().len());

    push_shutdowns(&pipeline.schema, threads);

    if !ctx.options.no_data {
        pipeline.ready.wait(threads).await?;
        pipeline.set_lock_tables_statement(build_lock_tables_statement(
            &ctx.catalog.non_transactional_tables(),
        ));
        push_shutdowns(&pipeline.non_transactional, threads);
        push_shutdowns(&pipeline.transactional, threads);
        pipeline.ready_non_transactional.signal_n(threads);
    }

    if locked && !ctx.options.trx_consistency_only {
        pipeline.unlock_tables.wait(threads).await?;
        tracing::info!("Non-transactional tables locked or dumped, unlocking tables");
        main.execute("UNLOCK TABLES")
            .await
            .context("Failed to release global read lock")?;
    }

    push_shutdowns(&pipeline.post_data, threads);
    Ok(())
}

/// Resolves with the first worker error; pending while workers succeed
async fn first_failure(workers: &mut JoinSet<Result<()>>) -> anyhow::Error {
    loop {
        match workers.join_next().await {
            Some(Ok(Ok(()))) => continue,
            Some(Ok(Err(e))) => return e,
            Some(Err(e)) => return anyhow!("Worker task failed: {}", e),
            None => std::future::pending::<()>().await,
        }
    }
}

fn build_report(ctx: &DumpContext, metadata: PathBuf) -> DumpReport {
    let tables: Vec<TableSummary> = ctx
        .catalog
        .tables()
        .iter()
        .filter(|table| table.has_data() && !ctx.options.no_data)
        .map(|table| TableSummary {
            database: table.database.name.clone(),
            table: table.name.clone(),
            chunk_type: table.chunk_type(),
            rows: table.rows_dumped(),
            chunks: table.chunks_written(),
        })
        .collect();

    let mut files = ctx.files();
    files.push(metadata);

    DumpReport {
        errors: ctx.errors(),
        chunks: tables.iter().map(|t| t.chunks).sum(),
        rows: tables.iter().map(|t| t.rows).sum(),
        tables,
        consistent: ctx.is_consistent(),
        files,
    }
}
