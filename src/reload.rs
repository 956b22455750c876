//! Reload coordination.
//!
//! Tables move between streaming and full-reload export through in-WAL
//! markers. Because the markers travel the same replication stream as the
//! row changes, every part of the system observes them at the same LSN; that
//! position is the only synchronization primitive the reload protocol needs.
//!
//! State machine per table:
//!
//! ```text
//! Streaming ──START marker──► Reloading ──END marker──► Streaming
//!                               │
//!                               └─(failure/timeout)──► retry, then Streaming
//! PendingReload ──START──► Reloading ──END──► Streaming   (initial export)
//! ```
//!
//! Mismatched or duplicate markers are logged and ignored; they never change
//! state. An Active operation past the configured timeout is failed and
//! retried with a fresh export id up to the retry bound, then abandoned.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::batch::flush_batch;
use crate::buffer::{ChangeBuffer, TableBatch};
use crate::config::{DeltaStrategy, ReloadConfig};
use crate::error::{MirrorError, MirrorResult};
use crate::export::ExportJob;
use crate::lsn::Lsn;
use crate::model::{DdlEvent, MarkerAction, ReloadMarker, TableId};
use crate::output::BatchSink;
use crate::registry::{FileType, Registry, ReloadStatus, TableMode};

#[derive(Default)]
struct Inner {
    /// In-memory mirror of TableState.mode, refreshed on every transition.
    modes: HashMap<TableId, TableMode>,
    /// END markers waiting for their export to land in the registry.
    pending_ends: HashMap<Uuid, ReloadMarker>,
    /// Snapshot id carried by the active reload's START marker, kept for
    /// export retries within the snapshot holder's lifetime.
    snapshots: HashMap<TableId, String>,
    retries: HashMap<TableId, u32>,
}

pub struct ReloadCoordinator {
    registry: Arc<dyn Registry>,
    buffer: Arc<ChangeBuffer>,
    sink: Arc<dyn BatchSink>,
    export_tx: mpsc::Sender<ExportJob>,
    cfg: ReloadConfig,
    inner: Mutex<Inner>,
}

impl ReloadCoordinator {
    pub fn new(
        registry: Arc<dyn Registry>,
        buffer: Arc<ChangeBuffer>,
        sink: Arc<dyn BatchSink>,
        export_tx: mpsc::Sender<ExportJob>,
        cfg: ReloadConfig,
    ) -> Self {
        Self {
            registry,
            buffer,
            sink,
            export_tx,
            cfg,
            inner: Mutex::new(Inner::default()),
        }
    }

    /// Reload the mode mirror from the registry.
    pub async fn refresh_modes(&self) -> MirrorResult<()> {
        let states = self.registry.all_table_states().await?;
        let mut inner = self.inner.lock().await;
        inner.modes = states.into_iter().map(|s| (s.table.clone(), s.mode)).collect();
        Ok(())
    }

    /// Whether the table is a known target.
    pub async fn known(&self, table: &TableId) -> bool {
        self.inner.lock().await.modes.contains_key(table)
    }

    /// Whether changes for the table must divert into the delta buffer.
    pub async fn is_reloading(&self, table: &TableId) -> bool {
        matches!(
            self.inner.lock().await.modes.get(table),
            Some(TableMode::Reloading)
        )
    }

    async fn mode_of(&self, table: &TableId) -> Option<TableMode> {
        self.inner.lock().await.modes.get(table).copied()
    }

    async fn set_mode(&self, table: &TableId, mode: TableMode) {
        self.inner.lock().await.modes.insert(table.clone(), mode);
    }

    /// Inspect a captured DDL event for a reload marker. Returns true when
    /// the event was a marker (well-formed or not) and must not enter the
    /// DDL output stream.
    pub async fn observe_ddl(&self, event: &DdlEvent) -> MirrorResult<bool> {
        let marker =
            match ReloadMarker::parse(&event.command_text, &self.cfg.marker_prefix, event.lsn) {
                Ok(None) => return Ok(false),
                Ok(Some(marker)) => marker,
                Err(MirrorError::MarkerMalformed(reason)) => {
                    warn!("Ignoring malformed reload marker at {}: {reason}", event.lsn);
                    return Ok(true);
                }
                Err(e) => return Err(e),
            };

        match marker.action {
            MarkerAction::ExportStart => self.handle_start(marker).await?,
            MarkerAction::ExportEnd => self.handle_end(marker).await?,
        }
        Ok(true)
    }

    /// Floor for the confirmed LSN: pending END markers must stay in WAL
    /// until their reload completes, so a crash re-delivers them.
    pub async fn confirm_floor(&self) -> Option<Lsn> {
        self.inner
            .lock()
            .await
            .pending_ends
            .values()
            .map(|m| m.lsn.prev())
            .min()
    }

    async fn handle_start(&self, marker: ReloadMarker) -> MirrorResult<()> {
        match self.mode_of(&marker.table).await {
            None => {
                warn!(
                    "Ignoring START marker {} for unknown table {}",
                    marker.export_id, marker.table
                );
                return Ok(());
            }
            Some(TableMode::Reloading) => {
                warn!(
                    "Ignoring START marker {} for {}: reload already in progress",
                    marker.export_id, marker.table
                );
                return Ok(());
            }
            Some(_) => {}
        }

        // Final streaming batch for the table: everything committed strictly
        // before the marker.
        for batch in self.buffer.snapshot_table(&marker.table).await {
            flush_batch(self.sink.as_ref(), self.registry.as_ref(), &batch).await?;
        }

        match self
            .registry
            .mark_reload_start(&marker.table, marker.export_id, marker.lsn)
            .await
        {
            Ok(()) => {}
            Err(MirrorError::ReloadAlreadyActive(_)) => {
                warn!(
                    "Ignoring START marker {}: operation already active for {}",
                    marker.export_id, marker.table
                );
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.set_mode(&marker.table, TableMode::Reloading).await;
        {
            let mut inner = self.inner.lock().await;
            match &marker.snapshot_id {
                Some(id) => {
                    inner.snapshots.insert(marker.table.clone(), id.clone());
                }
                None => {
                    inner.snapshots.remove(&marker.table);
                }
            }
        }
        info!(
            "Reload started for {} (export {}, anchor {})",
            marker.table, marker.export_id, marker.lsn
        );

        self.dispatch(ExportJob {
            table: marker.table,
            export_id: marker.export_id,
            anchor_lsn: marker.lsn,
            snapshot_id: marker.snapshot_id,
        })
        .await;
        Ok(())
    }

    async fn handle_end(&self, marker: ReloadMarker) -> MirrorResult<()> {
        let Some(op) = self.registry.reload_operation(marker.export_id).await? else {
            warn!(
                "Ignoring END marker for unknown operation {}",
                marker.export_id
            );
            return Ok(());
        };
        if op.status != ReloadStatus::Active || op.table != marker.table {
            warn!(
                "Ignoring END marker for {}: operation is {:?} on {}",
                marker.export_id, op.status, op.table
            );
            return Ok(());
        }

        // The reload is complete only once the export's batch directory is
        // registered at the START anchor.
        if self
            .registry
            .find_file(&op.table, FileType::FullReload, op.start_marker_lsn)
            .await?
            .is_some()
        {
            self.complete(marker).await
        } else {
            info!(
                "END marker for {} arrived before its export registered; holding",
                marker.export_id
            );
            self.inner
                .lock()
                .await
                .pending_ends
                .insert(marker.export_id, marker);
            Ok(())
        }
    }

    async fn complete(&self, marker: ReloadMarker) -> MirrorResult<()> {
        self.registry
            .mark_reload_end(marker.export_id, marker.lsn)
            .await?;
        self.apply_delta_policy(&marker.table, marker.lsn).await?;
        self.set_mode(&marker.table, TableMode::Streaming).await;
        let mut inner = self.inner.lock().await;
        inner.retries.remove(&marker.table);
        inner.snapshots.remove(&marker.table);
        drop(inner);
        info!(
            "Reload completed for {} (export {}, end {})",
            marker.table, marker.export_id, marker.lsn
        );
        Ok(())
    }

    async fn apply_delta_policy(&self, table: &TableId, end_lsn: Lsn) -> MirrorResult<()> {
        let Some(report) = self.buffer.take_delta(table).await else {
            return Ok(());
        };
        match self.cfg.delta_strategy {
            DeltaStrategy::Discard => {
                info!(
                    "Discarded {} delta rows for {} in ({}, {}]",
                    report.count, table, report.first_lsn, report.last_lsn
                );
            }
            DeltaStrategy::Validate => {
                // The reload snapshot already contains the delta rows; the
                // count is surfaced for monitoring to reconcile against the
                // source's change statistics for the window.
                info!(
                    "Validated reload of {}: {} concurrent changes in ({}, {}]",
                    table, report.count, report.first_lsn, report.last_lsn
                );
            }
            DeltaStrategy::Apply => {
                if report.count == 0 {
                    return Ok(());
                }
                let batch = TableBatch {
                    table: table.clone(),
                    columns: report.columns,
                    changes: report.changes,
                    ddl: Vec::new(),
                    end_lsn,
                };
                flush_batch(self.sink.as_ref(), self.registry.as_ref(), &batch).await?;
                info!(
                    "Applied {} delta rows for {} at {}",
                    report.count, table, end_lsn
                );
            }
        }
        Ok(())
    }

    /// Periodic maintenance, run once per batch cycle: settle END markers
    /// whose exports have since registered, expire Active operations past
    /// the deadline, and retry or abandon failed exports.
    pub async fn poll(&self) -> MirrorResult<()> {
        // Pending END markers.
        let pending: Vec<ReloadMarker> = {
            let mut inner = self.inner.lock().await;
            inner.pending_ends.drain().map(|(_, m)| m).collect()
        };
        for marker in pending {
            let Some(op) = self.registry.reload_operation(marker.export_id).await? else {
                continue;
            };
            match op.status {
                ReloadStatus::Active => {
                    if self
                        .registry
                        .find_file(&op.table, FileType::FullReload, op.start_marker_lsn)
                        .await?
                        .is_some()
                    {
                        self.complete(marker).await?;
                    } else {
                        self.inner
                            .lock()
                            .await
                            .pending_ends
                            .insert(marker.export_id, marker);
                    }
                }
                // A failed export never completes this marker.
                _ => {}
            }
        }

        // Timeouts and failures.
        for state in self.registry.all_table_states().await? {
            if state.mode != TableMode::Reloading {
                continue;
            }
            let Some(export_id) = state.reload_export_id else {
                continue;
            };
            let Some(op) = self.registry.reload_operation(export_id).await? else {
                continue;
            };
            match op.status {
                ReloadStatus::Active => {
                    let age = Utc::now() - op.created_at;
                    if age.to_std().unwrap_or_default() > self.cfg.operation_timeout {
                        warn!(
                            "Reload {} for {} exceeded {}s; failing",
                            export_id,
                            op.table,
                            self.cfg.operation_timeout.as_secs()
                        );
                        self.registry.failed_reload(export_id, false).await?;
                        self.retry_or_abandon(&op.table, op.start_marker_lsn).await?;
                    }
                }
                ReloadStatus::Failed => {
                    self.retry_or_abandon(&op.table, op.start_marker_lsn).await?;
                }
                ReloadStatus::Completed => {}
            }
        }
        Ok(())
    }

    async fn retry_or_abandon(&self, table: &TableId, start_lsn: Lsn) -> MirrorResult<()> {
        let (attempts, snapshot_id) = {
            let mut inner = self.inner.lock().await;
            let n = inner.retries.entry(table.clone()).or_insert(0);
            *n += 1;
            (*n, inner.snapshots.get(table).cloned())
        };
        if attempts <= self.cfg.max_retries {
            let export_id = Uuid::new_v4();
            info!(
                "Retrying reload of {} from {} (attempt {attempts}, export {export_id})",
                table, start_lsn
            );
            self.registry
                .mark_reload_start(table, export_id, start_lsn)
                .await?;
            self.dispatch(ExportJob {
                table: table.clone(),
                export_id,
                anchor_lsn: start_lsn,
                snapshot_id,
            })
            .await;
        } else {
            warn!(
                "Abandoning reload of {} after {} attempts; resuming streaming",
                table,
                attempts - 1
            );
            self.registry
                .set_table_mode(table, TableMode::Streaming)
                .await?;
            self.set_mode(table, TableMode::Streaming).await;
            // Drop whatever deltas accumulated; the table streams onward.
            let _ = self.buffer.take_delta(table).await;
            let mut inner = self.inner.lock().await;
            inner.retries.remove(table);
            inner.snapshots.remove(table);
        }
        Ok(())
    }

    async fn dispatch(&self, job: ExportJob) {
        if self.export_tx.send(job).await.is_err() {
            warn!("Export pool is gone; job dropped (shutdown in progress?)");
        }
    }
}
