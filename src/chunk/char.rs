// ABOUTME: String-key chunking driven by server-side ordering of the key column
// ABOUTME: Steps split by registering a successor range once its boundary key is known

use super::{ChunkSizer, ChunkStep};
use crate::catalog::DbTable;
use crate::connection::DumpConnection;
use crate::context::DumpContext;
use crate::utils::{quote_ident, sql_literal};
use crate::writer::{self, ChunkQuery};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CharStatus {
    Active,
    /// A successor is probing for a boundary inside this range
    Splitting,
    Done,
}

/// Cursor state of one string range `(lower, upper]`
///
/// Bounds are the raw key bytes as the server returned them. Boundaries are
/// always found by the server (`ORDER BY ... LIMIT 1 OFFSET n`) so ranges
/// follow the column collation; the client only compares keys for equality.
#[derive(Debug)]
pub struct CharStep {
    field: String,
    sizer: ChunkSizer,
    state: Mutex<CharState>,
}

#[derive(Debug)]
struct CharState {
    /// Exclusive; `None` starts before the first key and includes NULLs
    lower: Option<Vec<u8>>,
    /// Inclusive; `None` after probing means the column has no values
    upper: Option<Vec<u8>>,
    check_max: bool,
    in_flight: Option<Vec<u8>>,
    generation: u64,
    status: CharStatus,
    unsplittable: bool,
    step: u64,
    /// Set on a successor until it is registered in its table's list
    previous: Option<Arc<ChunkStep>>,
    ticket: Option<SplitTicket>,
}

/// What a successor saw of its predecessor when the split began
#[derive(Debug, Clone)]
struct SplitTicket {
    base: Option<Vec<u8>>,
    upper: Vec<u8>,
    generation: u64,
}

/// Bounds a worker needs to locate the next window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CharSnapshot {
    Done,
    /// The key column holds nothing but NULLs
    NullsOnly,
    Range {
        lower: Option<Vec<u8>>,
        upper: Vec<u8>,
        step: u64,
    },
}

/// Window claimed for one chunk file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CharWindow {
    pub lower: Option<Vec<u8>>,
    pub upper: Vec<u8>,
}

impl CharWindow {
    /// WHERE clause fragment selecting exactly this window
    pub fn predicate(&self, field: &str) -> String {
        let column = quote_ident(field);
        match &self.lower {
            None => format!(
                "({} IS NULL OR {} <= {})",
                column,
                column,
                sql_literal(&self.upper)
            ),
            Some(lower) => format!(
                "({} > {} AND {} <= {})",
                column,
                sql_literal(lower),
                column,
                sql_literal(&self.upper)
            ),
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum CharClaim {
    Window(CharWindow),
    /// The range shrank under a concurrent split; locate the window again
    Retry,
    Finished,
}

/// Where a pending successor searches for its split boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSearch {
    pub base: Option<Vec<u8>>,
    pub upper: Vec<u8>,
    pub offset: u64,
}

impl CharStep {
    /// A step over the whole table, its upper bound read lazily
    pub fn new(field: &str, sizer: ChunkSizer) -> Self {
        Self {
            field: field.to_string(),
            sizer,
            state: Mutex::new(CharState {
                lower: None,
                upper: None,
                check_max: true,
                in_flight: None,
                generation: 0,
                status: CharStatus::Active,
                unsplittable: false,
                step: sizer.initial(),
                previous: None,
                ticket: None,
            }),
        }
    }

    /// A step over known bounds, mostly for tests
    pub fn with_bounds(
        field: &str,
        sizer: ChunkSizer,
        lower: Option<Vec<u8>>,
        upper: Option<Vec<u8>>,
    ) -> Self {
        let step = Self::new(field, sizer);
        {
            let mut state = step.state.lock();
            state.lower = lower;
            state.upper = upper;
            state.check_max = false;
        }
        step
    }

    pub fn field(&self) -> &str {
        &self.field
    }

    pub fn needs_max(&self) -> bool {
        self.state.lock().check_max
    }

    pub fn apply_max(&self, max: Option<Vec<u8>>) {
        let mut state = self.state.lock();
        if state.check_max {
            state.upper = max;
            state.check_max = false;
        }
    }

    /// Bounds for locating the next window
    pub fn snapshot(&self) -> CharSnapshot {
        let mut state = self.state.lock();
        if state.status == CharStatus::Done {
            return CharSnapshot::Done;
        }
        let exhausted = match (&state.lower, &state.upper) {
            (None, None) => return CharSnapshot::NullsOnly,
            (Some(lower), Some(upper)) => lower == upper,
            (None, Some(_)) => false,
            (Some(_), None) => true,
        };
        match state.upper.clone() {
            Some(upper) if !exhausted => CharSnapshot::Range {
                lower: state.lower.clone(),
                upper,
                step: state.step,
            },
            _ => {
                state.status = CharStatus::Done;
                CharSnapshot::Done
            }
        }
    }

    /// Claim `(lower, cursor]` if the upper bound is still the one the
    /// cursor was located against
    pub fn claim_window(&self, expected_upper: &[u8], cursor: Vec<u8>) -> CharClaim {
        let mut state = self.state.lock();
        if state.status == CharStatus::Done {
            return CharClaim::Finished;
        }
        if state.upper.as_deref() != Some(expected_upper) {
            return CharClaim::Retry;
        }
        state.in_flight = Some(cursor.clone());
        state.generation += 1;
        CharClaim::Window(CharWindow {
            lower: state.lower.clone(),
            upper: cursor,
        })
    }

    /// Advance past the claimed window
    pub fn complete_window(&self, elapsed: Duration) {
        let mut state = self.state.lock();
        let Some(cursor) = state.in_flight.take() else {
            return;
        };
        state.step = self.sizer.resize(state.step, elapsed);
        if state.upper.as_ref() == Some(&cursor) {
            state.status = CharStatus::Done;
        }
        state.lower = Some(cursor);
    }

    /// Mark a nulls-only step finished
    pub fn finish(&self) {
        self.state.lock().status = CharStatus::Done;
    }

    /// Start a split of this step, returning the unregistered successor
    ///
    /// `me` must be the `Arc` holding this step. The caller holds the table's
    /// chunk list lock.
    pub(crate) fn begin_split(&self, me: &Arc<ChunkStep>) -> Option<CharStep> {
        let mut state = self.state.lock();
        if !splittable(&state) {
            return None;
        }
        let upper = state.upper.clone()?;
        let base = state.in_flight.clone().or_else(|| state.lower.clone());

        state.status = CharStatus::Splitting;
        let successor = CharStep::with_bounds(&self.field, self.sizer, None, Some(upper.clone()));
        {
            let mut next = successor.state.lock();
            next.step = state.step;
            next.previous = Some(me.clone());
            next.ticket = Some(SplitTicket {
                base,
                upper,
                generation: state.generation,
            });
        }
        Some(successor)
    }

    /// For a pending successor, where the split boundary has to be searched
    pub fn split_search(&self) -> Option<SplitSearch> {
        let state = self.state.lock();
        state.ticket.as_ref().map(|ticket| SplitSearch {
            base: ticket.base.clone(),
            upper: ticket.upper.clone(),
            offset: state.step.saturating_mul(2).saturating_sub(1),
        })
    }
}

fn splittable(state: &CharState) -> bool {
    if state.status != CharStatus::Active
        || state.unsplittable
        || state.check_max
        || state.ticket.is_some()
    {
        return false;
    }
    match (&state.upper, state.in_flight.as_ref().or(state.lower.as_ref())) {
        (Some(upper), Some(base)) => upper != base,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

/// Publish a successor found by `begin_split`
///
/// `chunks` is the owning table's locked chunk list. The split takes effect
/// only if the predecessor has not claimed another window or shrunk since the
/// split began. Returns whether the successor was registered.
pub(crate) fn register_split(
    chunks: &mut Vec<Arc<ChunkStep>>,
    successor: &Arc<ChunkStep>,
    key: Option<Vec<u8>>,
) -> bool {
    let ChunkStep::Char(next) = &**successor else {
        return false;
    };
    let (previous, ticket) = {
        let mut state = next.state.lock();
        (state.previous.take(), state.ticket.take())
    };
    let (Some(previous), Some(ticket)) = (previous, ticket) else {
        return false;
    };
    let ChunkStep::Char(prev) = &*previous else {
        return false;
    };

    let mut prev_state = prev.state.lock();
    let mut next_state = next.state.lock();

    if prev_state.status == CharStatus::Done {
        return false;
    }
    prev_state.status = CharStatus::Active;

    if prev_state.generation != ticket.generation
        || prev_state.upper.as_deref() != Some(ticket.upper.as_slice())
    {
        return false;
    }

    match key {
        Some(key) if key != ticket.upper => {
            tracing::debug!(
                "Split char range on {} at {}",
                prev.field,
                sql_literal(&key)
            );
            next_state.lower = Some(key.clone());
            next_state.upper = Some(ticket.upper);
            prev_state.upper = Some(key);
            drop(next_state);
            chunks.push(successor.clone());
            true
        }
        _ => {
            prev_state.unsplittable = true;
            false
        }
    }
}

/// Dump every window of a char step
///
/// Returns whether the step was part of its table's list and is now spent.
/// A successor whose split did not take effect returns `false`.
pub(crate) async fn process<C: DumpConnection>(
    ctx: &Arc<DumpContext>,
    conn: &mut C,
    table: &Arc<DbTable>,
    handle: &Arc<ChunkStep>,
    step: &CharStep,
) -> Result<bool> {
    if let Some(search) = step.split_search() {
        let key = nth_key(
            ctx,
            conn,
            table,
            step.field(),
            search.base.as_deref(),
            &search.upper,
            search.offset,
        )
        .await?;
        if !table.with_chunks(|chunks| register_split(chunks, handle, key)) {
            return Ok(false);
        }
    }

    if step.needs_max() {
        let sql = format!(
            "SELECT MAX({}) FROM {}{}",
            quote_ident(step.field()),
            table.qualified(),
            where_suffix(ctx, " WHERE ")
        );
        let max = conn.query(&sql).await?.rows.into_iter().next().and_then(|row| {
            row.into_iter().next().flatten()
        });
        step.apply_max(max);
    }

    loop {
        if ctx.is_shutting_down() {
            break;
        }
        match step.snapshot() {
            CharSnapshot::Done => break,
            CharSnapshot::NullsOnly => {
                let predicate = format!("{} IS NULL", quote_ident(step.field()));
                writer::write_chunk(ctx, conn, table, &ChunkQuery::with_predicate(predicate))
                    .await?;
                step.finish();
                break;
            }
            CharSnapshot::Range {
                lower,
                upper,
                step: rows,
            } => {
                let cursor = nth_key(
                    ctx,
                    conn,
                    table,
                    step.field(),
                    lower.as_deref(),
                    &upper,
                    rows.saturating_sub(1),
                )
                .await?
                .unwrap_or_else(|| upper.clone());

                match step.claim_window(&upper, cursor) {
                    CharClaim::Retry => continue,
                    CharClaim::Finished => break,
                    CharClaim::Window(window) => {
                        let started = Instant::now();
                        let query = ChunkQuery::with_predicate(window.predicate(step.field()));
                        writer::write_chunk(ctx, conn, table, &query).await?;
                        step.complete_window(started.elapsed());
                    }
                }
            }
        }
    }

    Ok(true)
}

/// Key `offset` rows above `lower` (exclusive) and not beyond `upper`
async fn nth_key<C: DumpConnection>(
    ctx: &DumpContext,
    conn: &mut C,
    table: &DbTable,
    field: &str,
    lower: Option<&[u8]>,
    upper: &[u8],
    offset: u64,
) -> Result<Option<Vec<u8>>> {
    let column = quote_ident(field);
    let mut conditions = Vec::with_capacity(3);
    if let Some(lower) = lower {
        conditions.push(format!("{} > {}", column, sql_literal(lower)));
    }
    conditions.push(format!("{} <= {}", column, sql_literal(upper)));
    if let Some(filter) = &ctx.options.where_clause {
        conditions.push(format!("({})", filter));
    }

    let sql = format!(
        "SELECT {} FROM {} WHERE {} ORDER BY {} LIMIT 1 OFFSET {}",
        column,
        table.qualified(),
        conditions.join(" AND "),
        column,
        offset
    );
    let result = conn.query(&sql).await?;
    Ok(result
        .rows
        .into_iter()
        .next()
        .and_then(|row| row.into_iter().next().flatten()))
}

fn where_suffix(ctx: &DumpContext, prefix: &str) -> String {
    ctx.options
        .where_clause
        .as_ref()
        .map(|filter| format!("{}{}", prefix, filter))
        .unwrap_or_default()
}
