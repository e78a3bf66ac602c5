// ABOUTME: Shared pipeline state: stage queues, readiness signals and work-stealing pools
// ABOUTME: Workers and the coordinator rendezvous here between dump stages

use crate::barrier::SnapshotBarrier;
use crate::catalog::DbTable;
use crate::config::DumpOptions;
use crate::jobs::{JobQueue, TableJob};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, Semaphore};

/// Counting signal between workers and the coordinator
///
/// Signals are never lost: a signal sent before anyone waits is kept until
/// a waiter consumes it.
#[derive(Debug)]
pub struct StageSignal {
    permits: Semaphore,
}

impl Default for StageSignal {
    fn default() -> Self {
        Self {
            permits: Semaphore::new(0),
        }
    }
}

impl StageSignal {
    pub fn signal(&self) {
        self.permits.add_permits(1);
    }

    pub fn signal_n(&self, n: usize) {
        self.permits.add_permits(n);
    }

    /// Wait until `n` signals arrived, consuming them
    pub async fn wait(&self, n: usize) -> Result<()> {
        if n == 0 {
            return Ok(());
        }
        let count = u32::try_from(n).context("Too many signals to wait for")?;
        self.permits
            .acquire_many(count)
            .await
            .context("Stage signal closed")?
            .forget();
        Ok(())
    }
}

/// Tables of one data stage that may still have stealable work
#[derive(Debug)]
pub struct StagePool {
    name: &'static str,
    tables: Mutex<VecDeque<Arc<DbTable>>>,
}

impl StagePool {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            tables: Mutex::new(VecDeque::new()),
        }
    }

    pub fn add(&self, table: Arc<DbTable>) {
        self.tables.lock().push_back(table);
    }

    pub fn remove(&self, table: &Arc<DbTable>) {
        self.tables.lock().retain(|t| !Arc::ptr_eq(t, table));
    }

    pub fn len(&self) -> usize {
        self.tables.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Pull work for an idle worker from any table of this stage
    ///
    /// Tables are visited round-robin so consecutive thieves spread over
    /// different tables.
    pub fn take_any(&self) -> Option<TableJob> {
        let mut tables = self.tables.lock();
        for _ in 0..tables.len() {
            let table = tables.pop_front()?;
            let stolen = table.steal();
            tables.push_back(table.clone());
            if let Some(step) = stolen {
                tracing::debug!("Stole work from {} in {} stage", table.qualified(), self.name);
                return Some(TableJob::new(table, Some(step)));
            }
        }
        None
    }
}

/// Counts discovery jobs that are queued or running
#[derive(Debug, Default)]
pub struct DiscoveryTracker {
    outstanding: AtomicUsize,
    idle: Notify,
}

impl DiscoveryTracker {
    /// Call before enqueuing a discovery job
    pub fn begin(&self) {
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    /// Call once a discovery job finished, failed or was discarded
    pub fn end(&self) {
        if self.outstanding.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.idle.notify_one();
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Wait until every tracked discovery job has ended
    pub async fn wait_idle(&self) {
        loop {
            let idle = self.idle.notified();
            if self.outstanding() == 0 {
                return;
            }
            idle.await;
        }
    }
}

/// Everything the workers of one dump share
pub struct Pipeline {
    pub discovery: JobQueue,
    pub schema: JobQueue,
    pub non_transactional: JobQueue,
    pub transactional: JobQueue,
    pub post_data: JobQueue,

    /// One signal per worker per finished stage
    pub ready: StageSignal,
    /// Released by the coordinator once the non-transactional stage may start
    pub ready_non_transactional: StageSignal,
    /// One signal per worker once the global freeze is no longer needed
    pub unlock_tables: StageSignal,
    /// Sent once the snapshot info has been captured
    pub snapshot_info: StageSignal,

    pub non_transactional_tables: StagePool,
    pub transactional_tables: StagePool,
    pub discovery_jobs: DiscoveryTracker,
    pub barrier: SnapshotBarrier,

    lock_tables_statement: Mutex<Option<String>>,
}

impl Pipeline {
    pub fn new(options: &DumpOptions) -> Self {
        let queue = |name| JobQueue::new(name, options.queue_high_water, options.queue_pause);
        Self {
            discovery: queue("discovery"),
            schema: queue("schema"),
            non_transactional: queue("non_transactional"),
            transactional: queue("transactional"),
            post_data: queue("post_data"),
            ready: StageSignal::default(),
            ready_non_transactional: StageSignal::default(),
            unlock_tables: StageSignal::default(),
            snapshot_info: StageSignal::default(),
            non_transactional_tables: StagePool::new("non_transactional"),
            transactional_tables: StagePool::new("transactional"),
            discovery_jobs: DiscoveryTracker::default(),
            barrier: SnapshotBarrier::new(options.threads),
            lock_tables_statement: Mutex::new(None),
        }
    }

    /// Data queue and stealing pool for a table
    pub fn stage_for(&self, table: &DbTable) -> (&JobQueue, &StagePool) {
        if table.is_transactional {
            (&self.transactional, &self.transactional_tables)
        } else {
            (&self.non_transactional, &self.non_transactional_tables)
        }
    }

    pub fn remove_from_pools(&self, table: &Arc<DbTable>) {
        self.non_transactional_tables.remove(table);
        self.transactional_tables.remove(table);
    }

    pub fn set_lock_tables_statement(&self, statement: Option<String>) {
        *self.lock_tables_statement.lock() = statement;
    }

    pub fn lock_tables_statement(&self) -> Option<String> {
        self.lock_tables_statement.lock().clone()
    }
}

/// `LOCK TABLES` covering every given table with a plain `READ` lock
///
/// The lock is held on a separate session from the one reading the rows,
/// and `READ LOCAL` would let that reading session see concurrent inserts.
pub fn build_lock_tables_statement<'a>(
    tables: impl IntoIterator<Item = &'a Arc<DbTable>>,
) -> Option<String> {
    let targets: Vec<String> = tables
        .into_iter()
        .map(|table| format!("{} READ", table.qualified()))
        .collect();
    (!targets.is_empty()).then(|| format!("LOCK TABLES {}", targets.join(", ")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Database, DbTable, TableInfo};
    use std::time::Duration;

    fn table(db: &Arc<Database>, name: &str, is_transactional: bool) -> Arc<DbTable> {
        Arc::new(DbTable::new(
            db.clone(),
            name,
            TableInfo {
                is_transactional,
                ..Default::default()
            },
        ))
    }

    #[tokio::test]
    async fn test_signals_sent_early_are_kept() {
        let signal = StageSignal::default();
        signal.signal();
        signal.signal();
        signal.signal();
        tokio::time::timeout(Duration::from_secs(1), signal.wait(3))
            .await
            .expect("signals were lost")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_blocks_until_enough_signals() {
        let signal = Arc::new(StageSignal::default());
        signal.signal();
        let waiter = {
            let signal = signal.clone();
            tokio::spawn(async move { signal.wait(2).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());
        signal.signal();
        waiter.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_discovery_tracker_waits_for_nested_jobs() {
        let tracker = Arc::new(DiscoveryTracker::default());
        tracker.begin();
        let waiter = {
            let tracker = tracker.clone();
            tokio::spawn(async move { tracker.wait_idle().await })
        };

        // A running job enqueues a child before it ends
        tracker.begin();
        tracker.end();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        tracker.end();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("tracker never became idle")
            .unwrap();
    }

    #[test]
    fn test_lock_tables_statement_blocks_concurrent_inserts() {
        let shop = Arc::new(Database::new("shop"));
        let tables = vec![
            table(&shop, "legacy_orders", false),
            table(&shop, "audit", false),
        ];
        assert_eq!(
            build_lock_tables_statement(&tables).unwrap(),
            "LOCK TABLES `shop`.`legacy_orders` READ, `shop`.`audit` READ"
        );
        assert!(build_lock_tables_statement(&Vec::<Arc<DbTable>>::new()).is_none());
    }

    #[test]
    fn test_empty_pool_has_nothing_to_steal() {
        let pool = StagePool::new("transactional");
        assert!(pool.take_any().is_none());
        let shop = Arc::new(Database::new("shop"));
        let orders = table(&shop, "orders", true);
        pool.add(orders.clone());
        assert!(pool.take_any().is_none());
        pool.remove(&orders);
        assert!(pool.is_empty());
    }
}
