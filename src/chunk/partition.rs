// ABOUTME: Partition chunking: one chunk file per physical partition
// ABOUTME: Several workers may drain the same partition list concurrently

use crate::catalog::DbTable;
use crate::connection::DumpConnection;
use crate::context::DumpContext;
use crate::writer::{self, ChunkQuery};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Debug)]
pub struct PartitionStep {
    state: Mutex<PartitionState>,
}

#[derive(Debug)]
struct PartitionState {
    remaining: VecDeque<String>,
    in_flight: usize,
    retired: bool,
}

impl PartitionStep {
    pub fn new(partitions: Vec<String>) -> Self {
        Self {
            state: Mutex::new(PartitionState {
                remaining: partitions.into(),
                in_flight: 0,
                retired: false,
            }),
        }
    }

    /// Take the next partition to dump
    pub fn claim(&self) -> Option<String> {
        let mut state = self.state.lock();
        let name = state.remaining.pop_front()?;
        state.in_flight += 1;
        Some(name)
    }

    /// Report a claimed partition as finished
    ///
    /// Returns true for exactly one caller: the one that finished the last
    /// partition, who then removes the step from its table.
    pub fn release(&self) -> bool {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
        if state.remaining.is_empty() && state.in_flight == 0 && !state.retired {
            state.retired = true;
            return true;
        }
        false
    }

    pub fn remaining(&self) -> usize {
        self.state.lock().remaining.len()
    }

    pub fn has_remaining(&self) -> bool {
        !self.state.lock().remaining.is_empty()
    }
}

/// Dump partitions until none are left; returns whether this worker retired the step
pub(crate) async fn process<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    table: &Arc<DbTable>,
    step: &PartitionStep,
) -> Result<bool> {
    let mut retired = false;
    while let Some(partition) = step.claim() {
        if ctx.is_shutting_down() {
            step.release();
            break;
        }
        tracing::debug!("Dumping partition {} of {}", partition, table.qualified());
        let result = writer::write_chunk(ctx, conn, table, &ChunkQuery::partition(&partition)).await;
        retired |= step.release();
        result?;
    }
    Ok(retired)
}
