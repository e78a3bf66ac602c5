// ABOUTME: Process-scoped state shared by the coordinator and every worker of one dump
// ABOUTME: Built before the first worker starts and torn down after the last one exits

use crate::catalog::Catalog;
use crate::chunk::ChunkSizer;
use crate::config::DumpOptions;
use crate::connection::DumpConnection;
use crate::filters::DumpFilter;
use crate::pipeline::Pipeline;
use crate::sink::FileSink;
use crate::utils::escape_string;
use anyhow::Result;
use indicatif::{ProgressBar, ProgressDrawTarget, ProgressStyle};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

/// Run-wide switches that outside code may flip while a dump is running
///
/// Signal handlers hold a clone of this; the dump itself only reads it.
#[derive(Debug)]
pub struct DumpControl {
    shutdown: AtomicBool,
    pause: watch::Sender<bool>,
}

impl Default for DumpControl {
    fn default() -> Self {
        let (pause, _) = watch::channel(false);
        Self {
            shutdown: AtomicBool::new(false),
            pause,
        }
    }
}

impl DumpControl {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Ask every worker to drain its queues without executing further jobs
    pub fn request_shutdown(&self) {
        if !self.shutdown.swap(true, Ordering::SeqCst) {
            tracing::warn!("Shutdown requested, discarding remaining jobs");
        }
        self.resume();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    /// Hold workers before their next dequeue
    pub fn pause(&self) {
        tracing::info!("Pausing workers before their next job");
        self.pause.send_replace(true);
    }

    pub fn resume(&self) {
        if self.pause.send_replace(false) {
            tracing::info!("Resuming workers");
        }
    }

    pub fn is_paused(&self) -> bool {
        *self.pause.borrow()
    }

    /// Returns once the dump is not paused
    pub async fn wait_if_paused(&self) {
        let mut paused = self.pause.subscribe();
        // The sender lives as long as the control, so this cannot fail
        let _ = paused.wait_for(|paused| !*paused).await;
    }
}

pub struct DumpContext {
    pub options: DumpOptions,
    pub filter: DumpFilter,
    pub sink: Arc<dyn FileSink>,
    pub catalog: Catalog,
    pub pipeline: Pipeline,
    /// `None` when chunking is disabled
    pub sizer: Option<ChunkSizer>,
    pub progress: ProgressBar,
    control: Arc<DumpControl>,
    errors: AtomicU64,
    consistent: AtomicBool,
    charsets: Mutex<HashMap<String, Option<String>>>,
    snapshot_info: Mutex<Option<String>>,
    files: Mutex<Vec<PathBuf>>,
}

impl DumpContext {
    pub fn new(
        options: DumpOptions,
        filter: DumpFilter,
        sink: Arc<dyn FileSink>,
        control: Arc<DumpControl>,
    ) -> Result<Self> {
        let sizer = options.rows_per_chunk()?.map(ChunkSizer::new);
        let pipeline = Pipeline::new(&options);

        Ok(Self {
            options,
            filter,
            sink,
            catalog: Catalog::new(),
            pipeline,
            sizer,
            progress: table_progress_bar(),
            control,
            errors: AtomicU64::new(0),
            consistent: AtomicBool::new(false),
            charsets: Mutex::new(HashMap::new()),
            snapshot_info: Mutex::new(None),
            files: Mutex::new(Vec::new()),
        })
    }

    /// Count a per-job failure
    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::SeqCst);
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.control.request_shutdown();
    }

    pub fn is_shutting_down(&self) -> bool {
        self.control.is_shutting_down()
    }

    pub fn mark_consistent(&self) {
        self.consistent.store(true, Ordering::SeqCst);
    }

    pub fn is_consistent(&self) -> bool {
        self.consistent.load(Ordering::SeqCst)
    }

    pub async fn wait_if_paused(&self) {
        self.control.wait_if_paused().await;
    }

    /// Character set of a collation, looked up once per collation
    pub async fn charset_for<C: DumpConnection>(
        &self,
        conn: &mut C,
        collation: &str,
    ) -> Result<Option<String>> {
        let cached = self.charsets.lock().get(collation).cloned();
        if let Some(charset) = cached {
            return Ok(charset);
        }

        let result = conn
            .query(&format!(
                "SELECT CHARACTER_SET_NAME FROM INFORMATION_SCHEMA.COLLATIONS WHERE COLLATION_NAME='{}'",
                escape_string(collation)
            ))
            .await?;
        let charset = result.scalar().map(str::to_string);
        self.charsets
            .lock()
            .insert(collation.to_string(), charset.clone());
        Ok(charset)
    }

    pub fn set_snapshot_info(&self, info: String) {
        *self.snapshot_info.lock() = Some(info);
    }

    pub fn snapshot_info(&self) -> Option<String> {
        self.snapshot_info.lock().clone()
    }

    pub fn record_file(&self, path: PathBuf) {
        self.files.lock().push(path);
    }

    pub fn files(&self) -> Vec<PathBuf> {
        self.files.lock().clone()
    }
}

/// Completed-table counter shown while stderr is a terminal
fn table_progress_bar() -> ProgressBar {
    if !std::io::stderr().is_terminal() {
        return ProgressBar::hidden();
    }
    let bar = ProgressBar::new(0);
    bar.set_draw_target(ProgressDrawTarget::stderr());
    if let Ok(style) = ProgressStyle::default_bar()
        .template("{spinner:.green} [{elapsed_precise}] {pos}/{len} tables dumped {msg}")
    {
        bar.set_style(style);
    }
    bar
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sink::DirectorySink;
    use std::time::Duration;
    use tempfile::tempdir;

    fn context() -> (tempfile::TempDir, Arc<DumpContext>) {
        let dir = tempdir().unwrap();
        let sink = Arc::new(DirectorySink::new(dir.path()).unwrap());
        let ctx = DumpContext::new(
            DumpOptions::default(),
            DumpFilter::default(),
            sink,
            DumpControl::new(),
        )
        .unwrap();
        (dir, Arc::new(ctx))
    }

    #[tokio::test]
    async fn test_pause_holds_waiters_until_resume() {
        let control = DumpControl::new();
        control.pause();
        assert!(control.is_paused());

        let waiter = {
            let control = control.clone();
            tokio::spawn(async move { control.wait_if_paused().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        control.resume();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter stayed paused")
            .unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_paused_workers() {
        let control = DumpControl::new();
        control.pause();
        control.request_shutdown();
        assert!(control.is_shutting_down());
        assert!(!control.is_paused());
        control.wait_if_paused().await;
    }

    #[test]
    fn test_error_counter_and_chunking_defaults() {
        let (_dir, ctx) = context();
        assert_eq!(ctx.errors(), 0);
        ctx.record_error();
        ctx.record_error();
        assert_eq!(ctx.errors(), 2);
        assert!(ctx.sizer.is_none());
        assert!(!ctx.is_consistent());
        ctx.request_shutdown();
        assert!(ctx.is_shutting_down());
    }
}
