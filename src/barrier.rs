// ABOUTME: All-or-retry rendezvous used to certify that every worker shares one snapshot
// ABOUTME: Workers compare replication markers round by round until they agree or give up

use crate::connection::DumpConnection;
use anyhow::Result;
use parking_lot::Mutex;
use tokio::sync::Barrier;

/// Rounds attempted before the snapshot is declared inconsistent
pub const SNAPSHOT_ROUNDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
    /// Every party brought the same value
    Converged,
    /// At least two parties disagreed
    Diverged,
    /// At least one party had no value to compare
    Undetermined,
}

#[derive(Debug)]
struct RoundTally<T> {
    first: Option<T>,
    diverged: bool,
    undetermined: bool,
}

impl<T> Default for RoundTally<T> {
    fn default() -> Self {
        Self {
            first: None,
            diverged: false,
            undetermined: false,
        }
    }
}

/// Reusable rendezvous of a fixed number of parties
///
/// Every party records its value for round `r`, waits for all others, then
/// reads the same tally. Tallies are kept per round so a fast party starting
/// round `r + 1` can never disturb a slow party still reading round `r`.
#[derive(Debug)]
pub struct Rendezvous<T> {
    barrier: Barrier,
    rounds: Mutex<Vec<RoundTally<T>>>,
}

impl<T: PartialEq> Rendezvous<T> {
    pub fn new(parties: usize) -> Self {
        Self {
            barrier: Barrier::new(parties),
            rounds: Mutex::new(Vec::new()),
        }
    }

    /// Contribute a value to `round` and wait for the verdict
    pub async fn arrive(&self, round: usize, value: Option<T>) -> RoundOutcome {
        {
            let mut rounds = self.rounds.lock();
            if rounds.len() <= round {
                rounds.resize_with(round + 1, RoundTally::default);
            }
            let tally = &mut rounds[round];
            match value {
                None => tally.undetermined = true,
                Some(value) => match &tally.first {
                    None => tally.first = Some(value),
                    Some(first) if *first != value => tally.diverged = true,
                    Some(_) => {}
                },
            }
        }

        let wait = self.barrier.wait().await;

        let rounds = self.rounds.lock();
        let tally = &rounds[round];
        let outcome = if tally.undetermined {
            RoundOutcome::Undetermined
        } else if tally.diverged {
            RoundOutcome::Diverged
        } else {
            RoundOutcome::Converged
        };
        if wait.is_leader() {
            tracing::debug!("Rendezvous round {} closed: {:?}", round + 1, outcome);
        }
        outcome
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SnapshotOutcome {
    /// All workers observed this marker
    Consistent(String),
    Inconsistent { rounds: usize },
    /// The server exposes no marker to compare
    Undetermined,
}

/// Snapshot agreement among the workers of one dump
#[derive(Debug)]
pub struct SnapshotBarrier {
    rendezvous: Rendezvous<String>,
    max_rounds: usize,
}

impl SnapshotBarrier {
    pub fn new(workers: usize) -> Self {
        Self::with_rounds(workers, SNAPSHOT_ROUNDS)
    }

    pub fn with_rounds(workers: usize, max_rounds: usize) -> Self {
        Self {
            rendezvous: Rendezvous::new(workers),
            max_rounds: max_rounds.max(1),
        }
    }

    /// Open a snapshot transaction on `conn` that every other worker agrees with
    ///
    /// Must be called by every worker exactly once. Between rounds each worker
    /// rolls back and opens a fresh snapshot. A worker that fails to open its
    /// snapshot still takes part in the round so nobody waits forever, then
    /// reports its error.
    pub async fn establish<C: DumpConnection>(
        &self,
        conn: &mut C,
        worker: usize,
    ) -> Result<SnapshotOutcome> {
        for round in 0..self.max_rounds {
            let opened = open_snapshot(conn, round > 0).await;
            let marker = match &opened {
                Ok(marker) => marker.clone(),
                Err(_) => None,
            };

            let outcome = self.rendezvous.arrive(round, marker.clone()).await;
            let marker = opened?;
            tracing::debug!(
                "Thread {}: snapshot round {} with marker {:?}: {:?}",
                worker,
                round + 1,
                marker,
                outcome
            );

            match (outcome, marker) {
                (RoundOutcome::Converged, Some(marker)) => {
                    return Ok(SnapshotOutcome::Consistent(marker))
                }
                (RoundOutcome::Diverged, _) => continue,
                _ => return Ok(SnapshotOutcome::Undetermined),
            }
        }
        Ok(SnapshotOutcome::Inconsistent {
            rounds: self.max_rounds,
        })
    }
}

async fn open_snapshot<C: DumpConnection>(conn: &mut C, restart: bool) -> Result<Option<String>> {
    if restart {
        conn.rollback().await?;
    }
    conn.begin_snapshot().await?;
    read_snapshot_marker(conn).await
}

/// The executed GTID set the current snapshot was taken at, if the server reports one
pub async fn read_snapshot_marker<C: DumpConnection>(conn: &mut C) -> Result<Option<String>> {
    let status = match conn
        .query("SHOW STATUS LIKE 'binlog_snapshot_gtid_executed'")
        .await
    {
        Ok(status) => status,
        Err(e) => {
            tracing::warn!("Failed to get binlog_snapshot_gtid_executed: {:#}", e);
            return Ok(None);
        }
    };
    let marker = status
        .text_by_name(0, "Value")
        .or_else(|| status.text(0, 1))
        .map(str::to_string)
        .filter(|marker| !marker.is_empty());
    Ok(marker)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    async fn run_rounds(values: Vec<Vec<Option<&'static str>>>) -> Vec<Vec<RoundOutcome>> {
        let parties = values.len();
        let rendezvous = Arc::new(Rendezvous::new(parties));
        let handles: Vec<_> = values
            .into_iter()
            .map(|per_round| {
                let rendezvous = rendezvous.clone();
                tokio::spawn(async move {
                    let mut outcomes = Vec::new();
                    for (round, value) in per_round.into_iter().enumerate() {
                        let outcome = rendezvous.arrive(round, value.map(String::from)).await;
                        outcomes.push(outcome);
                        if outcome != RoundOutcome::Diverged {
                            break;
                        }
                    }
                    outcomes
                })
            })
            .collect();

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap());
        }
        results
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_identical_markers_converge_in_first_round() {
        let marker = Some("uuid:1-500");
        let results = run_rounds(vec![vec![marker]; 4]).await;
        for outcomes in results {
            assert_eq!(outcomes, vec![RoundOutcome::Converged]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_split_markers_never_converge() {
        let a = Some("uuid:1-500");
        let b = Some("uuid:1-501");
        let results = run_rounds(vec![vec![a; 5], vec![a; 5], vec![b; 5], vec![b; 5]]).await;
        for outcomes in results {
            assert_eq!(outcomes, vec![RoundOutcome::Diverged; 5]);
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_markers_converge_after_retry() {
        let a = Some("uuid:1-500");
        let b = Some("uuid:1-501");
        let results = run_rounds(vec![vec![a, b], vec![b, b], vec![b, b]]).await;
        for outcomes in results {
            assert_eq!(
                outcomes,
                vec![RoundOutcome::Diverged, RoundOutcome::Converged]
            );
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_missing_marker_makes_round_undetermined_for_everyone() {
        let a = Some("uuid:1-500");
        let results = run_rounds(vec![vec![a], vec![None], vec![a]]).await;
        for outcomes in results {
            assert_eq!(outcomes, vec![RoundOutcome::Undetermined]);
        }
    }

    #[tokio::test]
    async fn test_single_party_never_blocks() {
        let rendezvous = Rendezvous::new(1);
        assert_eq!(
            rendezvous.arrive(0, Some(7u64)).await,
            RoundOutcome::Converged
        );
        assert_eq!(rendezvous.arrive(1, None::<u64>).await, RoundOutcome::Undetermined);
    }
}
