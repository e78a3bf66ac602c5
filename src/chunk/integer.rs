// ABOUTME: Integer-key chunking over an exclusive/inclusive (nmin, nmax] range
// ABOUTME: Steps advance a cursor window by window and can be split in half for idle workers

use super::ChunkSizer;
use crate::catalog::DbTable;
use crate::connection::DumpConnection;
use crate::context::DumpContext;
use crate::utils::quote_ident;
use crate::writer::{self, ChunkQuery};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Cursor state of one integer range
///
/// `nmin` is exclusive and `nmax` inclusive, so the range `(nmin, nmax]` is
/// empty exactly when `nmin == nmax`. Bounds are `i128` so that the full
/// signed and unsigned BIGINT domains fit.
#[derive(Debug)]
pub struct IntegerStep {
    field: String,
    sizer: ChunkSizer,
    state: Mutex<IntegerState>,
}

#[derive(Debug, Clone)]
struct IntegerState {
    nmin: i128,
    nmax: i128,
    cursor: i128,
    step: u64,
    estimated_remaining_steps: u64,
    check_min: bool,
    check_max: bool,
    include_nulls: bool,
    nulls_only: bool,
    in_window: bool,
    done: bool,
}

/// Range claimed for one chunk file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IntegerWindow {
    Range {
        lower: i128,
        upper: i128,
        include_nulls: bool,
    },
    /// The key column holds nothing but NULLs
    NullsOnly,
}

impl IntegerWindow {
    /// WHERE clause fragment selecting exactly this window
    pub fn predicate(&self, field: &str) -> String {
        let column = quote_ident(field);
        match *self {
            IntegerWindow::NullsOnly => format!("{} IS NULL", column),
            IntegerWindow::Range {
                lower,
                upper,
                include_nulls,
            } => {
                let range = if lower == upper {
                    format!("{} = {}", column, upper)
                } else {
                    format!("({} < {} AND {} <= {})", lower, column, column, upper)
                };
                if include_nulls {
                    format!("({} IS NULL OR {})", column, range)
                } else {
                    range
                }
            }
        }
    }
}

impl IntegerStep {
    /// A step whose bounds are read by the first worker that runs it
    pub fn new(field: &str, sizer: ChunkSizer) -> Self {
        Self::from_state(
            field,
            sizer,
            IntegerState {
                nmin: 0,
                nmax: 0,
                cursor: 0,
                step: sizer.initial(),
                estimated_remaining_steps: 1,
                check_min: true,
                check_max: true,
                include_nulls: true,
                nulls_only: false,
                in_window: false,
                done: false,
            },
        )
    }

    /// A step over a known range `(nmin, nmax]`
    pub fn with_bounds(
        field: &str,
        sizer: ChunkSizer,
        nmin: i128,
        nmax: i128,
        include_nulls: bool,
    ) -> Self {
        let step = sizer.initial();
        Self::from_state(
            field,
            sizer,
            IntegerState {
                nmin,
                nmax,
                cursor: nmin,
                step,
                estimated_remaining_steps: remaining_steps(nmin, nmax, step),
                check_min: false,
                check_max: false,
                include_nulls,
                nulls_only: false,
                in_window: false,
                done: nmin >= nmax,
            },
        )
    }

    fn from_state(field: &str, sizer: ChunkSizer, state: IntegerState) -> Self {
        Self {
            field: field.to_string(),
            sizer,
            state: Mutex::new(state),
        }
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    /// Which bounds still need a MIN()/MAX() lookup
    pub fn pending_bounds(&self) -> (bool, bool) {
        let state = self.state.lock();
        (state.check_min, state.check_max)
    }

    /// Store looked-up bounds; `None` means the column had no non-NULL value
    pub fn apply_bounds(&self, min: Option<i128>, max: Option<i128>) {
        let mut state = self.state.lock();
        if state.check_min {
            match min {
                Some(min) => {
                    state.nmin = min.saturating_sub(1);
                    state.cursor = state.nmin;
                }
                None => state.nulls_only = true,
            }
            state.check_min = false;
        }
        if state.check_max {
            if let Some(max) = max {
                state.nmax = max;
            }
            state.check_max = false;
        }
        if !state.nulls_only && state.nmin >= state.nmax && !state.include_nulls {
            state.done = true;
        }
        state.estimated_remaining_steps = remaining_steps(state.nmin, state.nmax, state.step);
    }

    /// Claim the next window, or `None` once the range is exhausted
    pub fn next_window(&self) -> Option<IntegerWindow> {
        let mut state = self.state.lock();
        if state.done {
            return None;
        }
        if state.nulls_only {
            state.done = true;
            return Some(IntegerWindow::NullsOnly);
        }
        if state.nmin >= state.nmax {
            state.done = true;
            return None;
        }

        let step = i128::from(state.step);
        state.cursor = state.nmin.saturating_add(step).min(state.nmax);
        state.in_window = true;
        Some(IntegerWindow::Range {
            lower: state.nmin,
            upper: state.cursor,
            include_nulls: state.include_nulls,
        })
    }

    /// Advance past the window returned by the last `next_window`
    pub fn complete_window(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        if !state.in_window {
            return;
        }
        state.nmin = state.cursor;
        state.in_window = false;
        state.include_nulls = false;
        state.step = self.sizer.resize(state.step, elapsed);
        state.estimated_remaining_steps = remaining_steps(state.nmin, state.nmax, state.step);
        if state.nmin >= state.nmax {
            state.done = true;
        }
    }

    /// Hand the upper half of the unclaimed range to a new step
    ///
    /// The split point is always above the window currently being dumped so
    /// the two steps stay contiguous and disjoint.
    pub fn split(&self) -> Option<IntegerStep> {
        let mut state = self.state.lock();
        if state.done || state.nulls_only || state.check_min || state.check_max {
            return None;
        }

        let claimed = if state.in_window {
            state.cursor
        } else {
            state.nmin
        };
        let remaining = state.nmax - claimed;
        let step = i128::from(state.step);
        if remaining <= 2 * step {
            return None;
        }

        let mid = claimed + remaining / 2;
        let split = IntegerStep::with_bounds(&self.field, self.sizer, mid, state.nmax, false);
        {
            let mut split_state = split.state.lock();
            split_state.step = state.step;
            split_state.estimated_remaining_steps =
                remaining_steps(mid, split_state.nmax, state.step);
        }

        tracing::debug!(
            "Split integer range on {}: keeping ({}, {}], handing off ({}, {}]",
            self.field,
            state.nmin,
            mid,
            mid,
            state.nmax
        );
        state.nmax = mid;
        state.estimated_remaining_steps = remaining_steps(claimed, mid, state.step);
        Some(split)
    }

    pub fn estimated_remaining_steps(&self) -> u64 {
        self.state.lock().estimated_remaining_steps
    }

    /// Current `(nmin, nmax]` bounds
    #[cfg(test)]
    pub fn bounds(&self) -> (i128, i128) {
        let state = self.state.lock();
        (state.nmin, state.nmax)
    }

    pub fn step_size(&self) -> u64 {
        self.state.lock().step
    }
}

fn remaining_steps(nmin: i128, nmax: i128, step: u64) -> u64 {
    if nmax <= nmin || step == 0 {
        return 0;
    }
    let windows = (nmax - nmin + i128::from(step) - 1) / i128::from(step);
    u64::try_from(windows).unwrap_or(u64::MAX)
}

/// Dump every window of an integer step
pub(crate) async fn process<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    table: &Arc<DbTable>,
    step: &IntegerStep,
) -> Result<()> {
    let (need_min, need_max) = step.pending_bounds();
    if need_min || need_max {
        let min = if need_min {
            fetch_bound(ctx, conn, table, step.field(), "MIN").await?
        } else {
            None
        };
        let max = if need_max {
            fetch_bound(ctx, conn, table, step.field(), "MAX").await?
        } else {
            None
        };
        tracing::debug!(
            "{} bounds on {}: min={:?} max={:?}",
            table.qualified(),
            step.field(),
            min,
            max
        );
        step.apply_bounds(min, max);
    }

    while let Some(window) = step.next_window() {
        if ctx.is_shutting_down() {
            break;
        }
        let started = Instant::now();
        let query = ChunkQuery::with_predicate(window.predicate(step.field()));
        writer::write_chunk(ctx, conn, table, &query).await?;
        step.complete_window(started.elapsed());
    }

    Ok(())
}

async fn fetch_bound<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    table: &DbTable,
    field: &str,
    function: &str,
) -> Result<Option<i128>> {
    let mut sql = format!(
        "SELECT {}({}) FROM {}",
        function,
        quote_ident(field),
        table.qualified()
    );
    if let Some(filter) = &ctx.options.where_clause {
        sql.push_str(&format!(" WHERE {}", filter));
    }

    let result = conn.query(&sql).await?;
    result
        .scalar()
        .map(|value| {
            value
                .trim()
                .parse::<i128>()
                .with_context(|| format!("Non-integer {} on {}: '{}'", function, field, value))
        })
        .transpose()
}
