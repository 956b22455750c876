//! Batch controller: drives flush cycles from the change buffer to the file
//! store and the registry, then computes the position safe to confirm.
//!
//! One cycle: snapshot-and-reset every non-empty buffer, materialize each
//! snapshot as a batch directory, register it, and only then report the new
//! confirmable LSN. Registration conflicts mean the work already happened in
//! a previous life of the process; the fresh directory is removed and the
//! batch skipped.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::buffer::{ChangeBuffer, TableBatch};
use crate::config::BatchControlConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::lsn::Lsn;
use crate::model::TableId;
use crate::output::BatchSink;
use crate::registry::{FileRecord, FileType, Registry};

/// Write one batch and register it.
///
/// Returns None when the registry already knows this work (re-delivery
/// after a crash); the newly written directory is removed in that case.
pub async fn flush_batch(
    sink: &dyn BatchSink,
    registry: &dyn Registry,
    batch: &TableBatch,
) -> MirrorResult<Option<FileRecord>> {
    let (written, file_type) = if batch.is_ddl_only() {
        (sink.write_ddl(&batch.table, &batch.ddl).await?, FileType::Ddl)
    } else {
        (sink.write_streaming(batch).await?, FileType::Streaming)
    };

    let record = FileRecord {
        id: 0,
        table: batch.table.clone(),
        batch_timestamp: written.batch_timestamp,
        file_path: written.file_path.to_string_lossy().into_owned(),
        file_type,
        end_lsn: batch.end_lsn,
        row_count: written.row_count,
        has_ddl: written.has_ddl,
        sha256: (!written.sha256.is_empty()).then(|| written.sha256.clone()),
        created_at: Utc::now(),
    };

    match registry.register(&record).await {
        Ok(()) => {
            debug!(
                "Registered {} batch for {} at {} ({} rows)",
                file_type.as_str(),
                batch.table,
                batch.end_lsn,
                record.row_count
            );
            Ok(Some(record))
        }
        Err(e @ (MirrorError::NonMonotonicLsn { .. } | MirrorError::RegistryConflict(_))) => {
            warn!(
                "Batch for {} at {} already covered by the registry ({e}); dropping {}",
                batch.table,
                batch.end_lsn,
                written.directory.display()
            );
            if let Err(e) = std::fs::remove_dir_all(&written.directory) {
                warn!(
                    "Failed to remove superseded batch dir {}: {e}",
                    written.directory.display()
                );
            }
            Ok(None)
        }
        Err(e) => Err(e),
    }
}

/// Outcome of one flush cycle.
#[derive(Debug, Clone, Copy)]
pub struct CycleStats {
    pub batches: usize,
    pub rows: u64,
    /// Position the replication client may confirm.
    pub flush_lsn: Lsn,
}

/// Consecutive Io-failed cycles tolerated before escalating to Fatal.
const IO_FAILURE_LIMIT: u32 = 5;

pub struct BatchController {
    buffer: Arc<ChangeBuffer>,
    sink: Arc<dyn BatchSink>,
    registry: Arc<dyn Registry>,
    cfg: BatchControlConfig,
    io_failures: std::sync::atomic::AtomicU32,
}

impl BatchController {
    pub fn new(
        buffer: Arc<ChangeBuffer>,
        sink: Arc<dyn BatchSink>,
        registry: Arc<dyn Registry>,
        cfg: BatchControlConfig,
    ) -> Self {
        Self {
            buffer,
            sink,
            registry,
            cfg,
            io_failures: std::sync::atomic::AtomicU32::new(0),
        }
    }

    /// Whether a size- or row-triggered flush is due.
    pub async fn over_threshold(&self) -> bool {
        self.buffer
            .over_threshold(self.cfg.max_batch_size_bytes, self.cfg.max_batch_rows)
            .await
    }

    /// Run one flush cycle. `safe_checkpoint` is the last commit boundary
    /// the replication client delivered and `cycle_start` the position
    /// confirmed when the cycle began. The confirmable position is the
    /// minimum over all known tables: tables flushed this cycle contribute
    /// their registered end position, tables with no buffered activity the
    /// greater of their registered progress and `cycle_start`. Retained
    /// reload deltas cap the position further because they exist only in
    /// memory.
    pub async fn run_cycle(
        &self,
        safe_checkpoint: Lsn,
        cycle_start: Lsn,
    ) -> MirrorResult<CycleStats> {
        let batches = self.buffer.snapshot_all().await;
        let mut stats = CycleStats {
            batches: 0,
            rows: 0,
            flush_lsn: safe_checkpoint,
        };

        let mut cycle_min: Option<Lsn> = None;
        let mut covered: HashSet<TableId> = HashSet::new();
        let mut batches = batches.into_iter();
        for batch in batches.by_ref() {
            match flush_batch(self.sink.as_ref(), self.registry.as_ref(), &batch).await {
                Ok(record) => {
                    // A skipped batch (None) was registered by a previous
                    // life of the process; its position still counts as
                    // covered.
                    if let Some(record) = record {
                        stats.batches += 1;
                        stats.rows += record.row_count;
                    }
                    if !batch.is_ddl_only() {
                        covered.insert(batch.table.clone());
                        cycle_min =
                            Some(cycle_min.map_or(batch.end_lsn, |m| m.min(batch.end_lsn)));
                    }
                    self.io_failures.store(0, std::sync::atomic::Ordering::Relaxed);
                }
                Err(MirrorError::Io { path, source }) => {
                    // Abort the cycle: put this batch and everything not
                    // yet flushed back so the next cycle retries, and hold
                    // the confirm position below the unwritten data.
                    warn!("Batch write failed at {}: {source}; will retry", path.display());
                    let mut unflushed = vec![batch];
                    unflushed.extend(batches.by_ref());
                    // Restore back-to-front so front-insertion keeps the
                    // original segment order per table.
                    for rest in unflushed.into_iter().rev() {
                        stats.flush_lsn = stats.flush_lsn.min(rest.end_lsn.prev());
                        self.buffer.restore(rest).await;
                    }
                    let failures = 1 + self
                        .io_failures
                        .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if failures >= IO_FAILURE_LIMIT {
                        return Err(MirrorError::Fatal(format!(
                            "{failures} consecutive flush cycles failed on file I/O"
                        )));
                    }
                    break;
                }
                Err(e) => return Err(e),
            }
        }
        if let Some(min) = cycle_min {
            stats.flush_lsn = stats.flush_lsn.min(min);
        }

        // Idle tables still bound the confirmable position: the slot may
        // never pass the least registered progress of any table.
        for state in self.registry.all_table_states().await? {
            if covered.contains(&state.table) {
                continue;
            }
            stats.flush_lsn = stats
                .flush_lsn
                .min(state.last_streaming_lsn.max(cycle_start));
        }

        if let Some(floor) = self.buffer.delta_floor().await {
            stats.flush_lsn = stats.flush_lsn.min(floor.prev());
        }

        if stats.batches > 0 {
            info!(
                "Flush cycle: {} batches, {} rows, confirm up to {}",
                stats.batches, stats.rows, stats.flush_lsn
            );
        }
        Ok(stats)
    }
}
