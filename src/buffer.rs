//! Per-table change buffering between the replication dispatcher and the
//! batch controller.
//!
//! One producer task appends decoded changes; the flush routine drains whole
//! buffers through an atomic snapshot-and-reset. Tables under reload divert
//! their changes into delta buffers governed by the configured delta
//! strategy.

use std::collections::HashMap;

use tokio::sync::Mutex;

use crate::config::DeltaStrategy;
use crate::lsn::Lsn;
use crate::model::{Change, DdlEvent, RelationColumns, TableId};

/// Pseudo-table owning DDL that could not be attributed to a real table.
pub fn global_ddl_table() -> TableId {
    TableId::new("_mirror", "global")
}

/// A drained batch for one table and one column set. `changes` may be empty
/// when only DDL accumulated.
#[derive(Debug, Clone)]
pub struct TableBatch {
    pub table: TableId,
    /// Pinned header order. Empty for DDL-only batches.
    pub columns: Vec<String>,
    pub changes: Vec<Change>,
    pub ddl: Vec<DdlEvent>,
    pub end_lsn: Lsn,
}

impl TableBatch {
    pub fn is_ddl_only(&self) -> bool {
        self.changes.is_empty()
    }
}

/// Deltas observed for a table while its reload was in flight.
#[derive(Debug, Clone)]
pub struct DeltaReport {
    pub table: TableId,
    pub count: u64,
    pub first_lsn: Lsn,
    pub last_lsn: Lsn,
    /// Retained rows; populated only under the `apply` strategy.
    pub changes: Vec<Change>,
    pub columns: Vec<String>,
}

/// Changes within one pinned column set. A Relation drift starts a new
/// segment so no CSV output mixes column sets.
#[derive(Default)]
struct Segment {
    columns: Vec<String>,
    changes: Vec<Change>,
}

#[derive(Default)]
struct TableBuffer {
    segments: Vec<Segment>,
    ddl: Vec<DdlEvent>,
    rows: u64,
    bytes: u64,
    max_lsn: Lsn,
}

impl TableBuffer {
    fn is_empty(&self) -> bool {
        self.rows == 0 && self.ddl.is_empty()
    }

    fn current_segment(&mut self, columns: &[String]) -> &mut Segment {
        let start_new = match self.segments.last() {
            None => true,
            Some(seg) => {
                !seg.changes.is_empty() && !seg.columns.is_empty() && seg.columns != columns
            }
        };
        if start_new {
            self.segments.push(Segment::default());
        }
        let seg = self.segments.last_mut().expect("segment just ensured");
        if seg.columns.is_empty() {
            seg.columns = columns.to_vec();
        }
        seg
    }
}

#[derive(Default)]
struct DeltaBuffer {
    count: u64,
    first_lsn: Lsn,
    last_lsn: Lsn,
    changes: Vec<Change>,
    columns: Vec<String>,
}

#[derive(Default)]
struct Inner {
    tables: HashMap<TableId, TableBuffer>,
    deltas: HashMap<TableId, DeltaBuffer>,
    global_ddl: Vec<DdlEvent>,
}

/// Shared buffer with size and row accounting.
pub struct ChangeBuffer {
    strategy: DeltaStrategy,
    inner: Mutex<Inner>,
}

impl ChangeBuffer {
    pub fn new(strategy: DeltaStrategy) -> Self {
        Self {
            strategy,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Record a pinned column set; an in-place drift closes the current
    /// segment.
    pub async fn push_relation(&self, rel: &RelationColumns) {
        let mut inner = self.inner.lock().await;
        let buffer = inner.tables.entry(rel.table.clone()).or_default();
        buffer.current_segment(&rel.columns);
    }

    /// Append one change to its table buffer.
    pub async fn push_change(&self, change: Change) {
        let mut inner = self.inner.lock().await;
        let size = estimate_size(&change);
        let columns = change.column_names();
        let buffer = inner.tables.entry(change.table.clone()).or_default();
        buffer.rows += 1;
        buffer.bytes += size;
        buffer.max_lsn = buffer.max_lsn.max(change.lsn);
        let seg = buffer.current_segment(&columns);
        seg.changes.push(change);
    }

    /// Divert a change for a reloading table into its delta buffer.
    pub async fn push_delta(&self, change: Change) {
        let mut inner = self.inner.lock().await;
        let delta = inner.deltas.entry(change.table.clone()).or_default();
        if delta.count == 0 {
            delta.first_lsn = change.lsn;
        }
        delta.count += 1;
        delta.last_lsn = delta.last_lsn.max(change.lsn);
        if delta.columns.is_empty() {
            delta.columns = change.column_names();
        }
        if self.strategy == DeltaStrategy::Apply {
            delta.changes.push(change);
        }
    }

    /// Route a captured DDL event to its table buffer or the global bucket.
    pub async fn push_ddl(&self, event: DdlEvent) {
        let mut inner = self.inner.lock().await;
        match event.table.clone() {
            Some(table) => {
                inner.tables.entry(table).or_default().ddl.push(event);
            }
            None => inner.global_ddl.push(event),
        }
    }

    /// True when any single table buffer breaches a bound.
    pub async fn over_threshold(&self, max_bytes: u64, max_rows: u64) -> bool {
        let inner = self.inner.lock().await;
        inner
            .tables
            .values()
            .any(|b| b.bytes > max_bytes || b.rows > max_rows)
    }

    /// Atomically snapshot every non-empty buffer and reset. One batch per
    /// (table, column set) segment; table DDL rides with the first segment;
    /// unattributed DDL becomes a batch for the global pseudo-table.
    pub async fn snapshot_all(&self) -> Vec<TableBatch> {
        let mut inner = self.inner.lock().await;
        let tables = std::mem::take(&mut inner.tables);
        let global_ddl = std::mem::take(&mut inner.global_ddl);
        drop(inner);

        let mut out = Vec::new();
        for (table, buffer) in tables {
            out.extend(drain_table(table, buffer));
        }
        if !global_ddl.is_empty() {
            let end_lsn = global_ddl.iter().map(|d| d.lsn).max().unwrap_or(Lsn::ZERO);
            out.push(TableBatch {
                table: global_ddl_table(),
                columns: Vec::new(),
                changes: Vec::new(),
                ddl: global_ddl,
                end_lsn,
            });
        }
        // Deterministic flush order helps the logs and the tests.
        out.sort_by(|a, b| a.table.cmp(&b.table).then(a.end_lsn.cmp(&b.end_lsn)));
        out
    }

    /// Put a drained batch back, ahead of anything buffered since. Used
    /// when a write failed and the next cycle must retry; within one flush
    /// cycle no new changes can interleave, so ordering is preserved.
    pub async fn restore(&self, batch: TableBatch) {
        let mut inner = self.inner.lock().await;
        let buffer = inner.tables.entry(batch.table.clone()).or_default();
        buffer.rows += batch.changes.len() as u64;
        buffer.bytes += batch.changes.iter().map(estimate_size).sum::<u64>();
        buffer.max_lsn = buffer.max_lsn.max(batch.end_lsn);
        if !batch.changes.is_empty() {
            buffer.segments.insert(
                0,
                Segment {
                    columns: batch.columns,
                    changes: batch.changes,
                },
            );
        }
        let mut ddl = batch.ddl;
        ddl.append(&mut buffer.ddl);
        buffer.ddl = ddl;
    }

    /// Snapshot-and-reset a single table, for the forced flush preceding a
    /// reload export.
    pub async fn snapshot_table(&self, table: &TableId) -> Vec<TableBatch> {
        let mut inner = self.inner.lock().await;
        match inner.tables.remove(table) {
            Some(buffer) => drain_table(table.clone(), buffer),
            None => Vec::new(),
        }
    }

    /// Lowest LSN of retained delta rows, if any. The confirmed position
    /// must not pass it: retained deltas live only in memory until their
    /// reload ends, and a crash must re-deliver them.
    pub async fn delta_floor(&self) -> Option<Lsn> {
        let inner = self.inner.lock().await;
        inner
            .deltas
            .values()
            .filter(|d| !d.changes.is_empty())
            .map(|d| d.first_lsn)
            .min()
    }

    /// Drain the delta buffer accumulated during a reload.
    pub async fn take_delta(&self, table: &TableId) -> Option<DeltaReport> {
        let mut inner = self.inner.lock().await;
        let delta = inner.deltas.remove(table)?;
        Some(DeltaReport {
            table: table.clone(),
            count: delta.count,
            first_lsn: delta.first_lsn,
            last_lsn: delta.last_lsn,
            changes: delta.changes,
            columns: delta.columns,
        })
    }
}

fn drain_table(table: TableId, buffer: TableBuffer) -> Vec<TableBatch> {
    let mut ddl = Some(buffer.ddl);
    let mut out = Vec::new();
    for seg in buffer.segments {
        if seg.changes.is_empty() {
            continue;
        }
        let end_lsn = seg
            .changes
            .iter()
            .map(|c| c.lsn)
            .max()
            .unwrap_or(buffer.max_lsn);
        out.push(TableBatch {
            table: table.clone(),
            columns: seg.columns,
            changes: seg.changes,
            ddl: ddl.take().unwrap_or_default(),
            end_lsn,
        });
    }
    // DDL with no accompanying rows still flushes as its own batch.
    if let Some(ddl) = ddl.filter(|d| !d.is_empty()) {
        let end_lsn = ddl.iter().map(|d| d.lsn).max().unwrap_or(Lsn::ZERO);
        out.push(TableBatch {
            table,
            columns: Vec::new(),
            changes: Vec::new(),
            ddl,
            end_lsn,
        });
    }
    out
}

/// Serialized size estimate for threshold accounting.
fn estimate_size(change: &Change) -> u64 {
    let row_size = |row: &crate::model::RowValues| -> u64 {
        row.iter()
            .map(|(_, v)| v.as_ref().map(|s| s.len() as u64 + 1).unwrap_or(1))
            .sum()
    };
    let mut size = 32;
    if let Some(row) = &change.new_row {
        size += row_size(row);
    }
    if let Some(row) = &change.old_row {
        size += row_size(row);
    }
    size
}
