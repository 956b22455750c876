//! Startup reconciliation: fresh-init provisioning and crash recovery.
//!
//! Recovery brings the registry and the filesystem back into agreement
//! before streaming resumes. Every action here is idempotent: running it
//! against an already-consistent state changes nothing.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use flate2::read::GzDecoder;
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{MirrorError, MirrorResult};
use crate::export::ExportJob;
use crate::lsn::Lsn;
use crate::model::TableId;
use crate::output::{hash_file, FULL_RELOAD_FILE, STREAMING_FILE, TMP_PREFIX};
use crate::registry::{FileRecord, FileType, Registry};

/// Outcome of the filesystem/registry reconciliation pass.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileStats {
    pub tmp_removed: u32,
    pub orphans_registered: u32,
    pub orphans_removed: u32,
}

/// Install the DDL capture table and event trigger. Idempotent.
pub async fn install_ddl_capture(
    client: &tokio_postgres::Client,
    ddl_history: &TableId,
) -> MirrorResult<()> {
    let table = ddl_history.qualified();
    let ddl = format!(
        r#"
CREATE TABLE IF NOT EXISTS {table} (
    id              BIGSERIAL PRIMARY KEY,
    captured_at     TIMESTAMPTZ NOT NULL DEFAULT now(),
    object_type     TEXT,
    object_identity TEXT,
    command_text    TEXT NOT NULL,
    tag             TEXT NOT NULL
);

CREATE OR REPLACE FUNCTION public.data_mirror_capture_ddl() RETURNS event_trigger
LANGUAGE plpgsql AS $fn$
DECLARE
    r RECORD;
BEGIN
    FOR r IN SELECT * FROM pg_event_trigger_ddl_commands() LOOP
        INSERT INTO {table} (object_type, object_identity, command_text, tag)
        VALUES (r.object_type, r.object_identity, current_query(), r.command_tag);
    END LOOP;
END
$fn$;

DROP EVENT TRIGGER IF EXISTS data_mirror_capture_ddl;
CREATE EVENT TRIGGER data_mirror_capture_ddl
    ON ddl_command_end EXECUTE FUNCTION public.data_mirror_capture_ddl();
"#
    );
    client.batch_execute(&ddl).await?;
    info!("DDL capture trigger installed (history table {ddl_history})");
    Ok(())
}

/// Remove abandoned staging directories. They only exist when a writer died
/// between creation and rename.
pub fn sweep_tmp_dirs(base: &Path) -> MirrorResult<u32> {
    let mut removed = 0;
    let entries = match std::fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(MirrorError::io(base, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| MirrorError::io(base, e))?;
        let name = entry.file_name();
        if name.to_string_lossy().starts_with(TMP_PREFIX) {
            let path = entry.path();
            std::fs::remove_dir_all(&path).map_err(|e| MirrorError::io(&path, e))?;
            info!("Removed stale staging dir {}", path.display());
            removed += 1;
        }
    }
    Ok(removed)
}

/// Reconcile on-disk batch directories against the registry.
///
/// Unregistered streaming directories older than the grace period are
/// re-registered when their contents are still recomputable and monotonic,
/// and removed otherwise. Directories younger than the grace period are
/// left alone; a live writer may still own them.
pub async fn reconcile_files(
    base: &Path,
    registry: &dyn Registry,
    grace: Duration,
) -> MirrorResult<ReconcileStats> {
    let mut stats = ReconcileStats {
        tmp_removed: sweep_tmp_dirs(base)?,
        ..Default::default()
    };

    let entries = match std::fs::read_dir(base) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(stats),
        Err(e) => return Err(MirrorError::io(base, e)),
    };
    for entry in entries {
        let entry = entry.map_err(|e| MirrorError::io(base, e))?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if !entry.path().is_dir() || !name.contains('.') || name.starts_with(TMP_PREFIX) {
            continue;
        }
        let table = TableId::parse(&name);
        let table_dir = entry.path();
        let batch_dirs =
            std::fs::read_dir(&table_dir).map_err(|e| MirrorError::io(&table_dir, e))?;
        for batch in batch_dirs {
            let batch = batch.map_err(|e| MirrorError::io(&table_dir, e))?;
            let dir = batch.path();
            if !dir.is_dir() {
                continue;
            }
            reconcile_batch_dir(&dir, &table, registry, grace, &mut stats).await?;
        }
    }
    Ok(stats)
}

async fn reconcile_batch_dir(
    dir: &Path,
    table: &TableId,
    registry: &dyn Registry,
    grace: Duration,
    stats: &mut ReconcileStats,
) -> MirrorResult<()> {
    let streaming = dir.join(STREAMING_FILE);
    let full_reload = dir.join(FULL_RELOAD_FILE);
    let data_file = if streaming.exists() {
        streaming.clone()
    } else if full_reload.exists() {
        full_reload
    } else {
        // No data file at all: an incomplete directory.
        if is_older_than(dir, grace)? {
            std::fs::remove_dir_all(dir).map_err(|e| MirrorError::io(dir, e))?;
            warn!("Removed incomplete batch dir {}", dir.display());
            stats.orphans_removed += 1;
        }
        return Ok(());
    };

    if registry
        .file_by_path(&data_file.to_string_lossy())
        .await?
        .is_some()
    {
        return Ok(());
    }
    if !is_older_than(dir, grace)? {
        return Ok(());
    }

    // Unregistered and stable. Streaming batches carry enough information
    // to rebuild their record; everything else is removed.
    if data_file == streaming {
        match read_streaming_summary(&streaming) {
            Ok((rows, Some(end_lsn))) => {
                let record = FileRecord {
                    id: 0,
                    table: table.clone(),
                    batch_timestamp: modified_at(dir)?,
                    file_path: streaming.to_string_lossy().into_owned(),
                    file_type: FileType::Streaming,
                    end_lsn,
                    row_count: rows,
                    has_ddl: dir.join(crate::output::DDL_FILE).exists(),
                    sha256: Some(hash_file(&streaming)?),
                    created_at: Utc::now(),
                };
                match registry.register(&record).await {
                    Ok(()) => {
                        info!(
                            "Re-registered orphan batch {} at {end_lsn}",
                            dir.display()
                        );
                        stats.orphans_registered += 1;
                        return Ok(());
                    }
                    Err(MirrorError::NonMonotonicLsn { .. })
                    | Err(MirrorError::RegistryConflict(_)) => {}
                    Err(e) => return Err(e),
                }
            }
            Ok((_, None)) => {}
            Err(e) => warn!("Unreadable orphan {}: {e}", dir.display()),
        }
    }

    std::fs::remove_dir_all(dir).map_err(|e| MirrorError::io(dir, e))?;
    warn!("Removed unregistered batch dir {}", dir.display());
    stats.orphans_removed += 1;
    Ok(())
}

/// Repair Active reload operations after a restart.
///
/// An operation whose export landed intact stays Active: its END marker is
/// still in WAL (the confirm floor guarantees it) and completes the reload
/// in-band. An operation with no export, or a missing directory, is failed
/// and re-dispatched with a fresh export id from the same anchor. A
/// registered export whose file is gone or corrupt is an invariant
/// violation.
pub async fn repair_active_reloads(
    registry: &dyn Registry,
) -> MirrorResult<Vec<ExportJob>> {
    let mut jobs = Vec::new();
    for op in registry.active_reloads().await? {
        let registered = registry
            .find_file(&op.table, FileType::FullReload, op.start_marker_lsn)
            .await?;
        match registered {
            Some(record) => {
                let path = PathBuf::from(&record.file_path);
                let intact = path.exists()
                    && match &record.sha256 {
                        Some(expected) => &hash_file(&path)? == expected,
                        None => true,
                    };
                if intact {
                    info!(
                        "Reload {} for {} already exported; awaiting END marker",
                        op.export_id, op.table
                    );
                } else {
                    return Err(MirrorError::Fatal(format!(
                        "registered export {} is missing or corrupt",
                        record.file_path
                    )));
                }
            }
            None => {
                warn!(
                    "Reload {} for {} has no export; retrying from {}",
                    op.export_id, op.table, op.start_marker_lsn
                );
                registry.failed_reload(op.export_id, false).await?;
                let export_id = Uuid::new_v4();
                registry
                    .mark_reload_start(&op.table, export_id, op.start_marker_lsn)
                    .await?;
                // The snapshot holder died with the previous process; the
                // retried export runs unpinned and says so in its logs.
                jobs.push(ExportJob {
                    table: op.table,
                    export_id,
                    anchor_lsn: op.start_marker_lsn,
                    snapshot_id: None,
                });
            }
        }
    }
    Ok(jobs)
}

/// Compute the resume position and enforce the confirm invariant: the
/// slot's confirmed position must never be past the least registered
/// progress of any streaming table.
pub async fn resume_position(
    registry: &dyn Registry,
    slot_confirmed: Lsn,
) -> MirrorResult<Lsn> {
    let states = registry.all_table_states().await?;
    let min_progress = states
        .iter()
        .filter(|s| !s.last_streaming_lsn.is_zero())
        .map(|s| s.last_streaming_lsn)
        .min();
    let Some(min_progress) = min_progress else {
        return Ok(slot_confirmed);
    };
    if slot_confirmed > min_progress {
        return Err(MirrorError::Fatal(format!(
            "slot confirmed {slot_confirmed} is past least table progress {min_progress}"
        )));
    }
    // The slot replays from its confirmed position; anything between it and
    // the table progress is filtered by registry monotonicity.
    Ok(slot_confirmed)
}

/// Drop registry records older than the retention window and their
/// directories.
pub async fn cleanup_registry(registry: &dyn Registry, days: u32) -> MirrorResult<u64> {
    let cutoff = Utc::now() - chrono::Duration::days(days as i64);
    let removed = registry.cleanup_older_than(cutoff).await?;
    let mut dirs = 0;
    for record in &removed {
        if let Some(dir) = Path::new(&record.file_path).parent() {
            if dir.exists() {
                if let Err(e) = std::fs::remove_dir_all(dir) {
                    warn!("Failed to remove expired batch dir {}: {e}", dir.display());
                    continue;
                }
                dirs += 1;
            }
        }
    }
    if !removed.is_empty() {
        info!(
            "Retention: dropped {} records, {} directories",
            removed.len(),
            dirs
        );
    }
    Ok(dirs)
}

fn modified_at(path: &Path) -> MirrorResult<DateTime<Utc>> {
    let meta = std::fs::metadata(path).map_err(|e| MirrorError::io(path, e))?;
    let modified = meta.modified().map_err(|e| MirrorError::io(path, e))?;
    Ok(modified.into())
}

fn is_older_than(path: &Path, grace: Duration) -> MirrorResult<bool> {
    let meta = std::fs::metadata(path).map_err(|e| MirrorError::io(path, e))?;
    let modified = meta.modified().map_err(|e| MirrorError::io(path, e))?;
    Ok(modified.elapsed().map(|age| age >= grace).unwrap_or(false))
}

/// Row count and highest `_lsn` of a streaming CSV, recomputed for orphan
/// re-registration.
fn read_streaming_summary(path: &Path) -> MirrorResult<(u64, Option<Lsn>)> {
    let file = std::fs::File::open(path).map_err(|e| MirrorError::io(path, e))?;
    let mut reader = csv::Reader::from_reader(GzDecoder::new(file));
    let mut rows = 0u64;
    let mut max_lsn = None;
    for record in reader.records() {
        let record =
            record.map_err(|e| MirrorError::io(path, std::io::Error::other(e)))?;
        // Old-image companion rows are not counted.
        if record.get(0) != Some("O") {
            rows += 1;
        }
        if let Some(raw) = record.get(1) {
            let lsn: Lsn = raw.parse()?;
            max_lsn = Some(max_lsn.map_or(lsn, |m: Lsn| m.max(lsn)));
        }
    }
    Ok((rows, max_lsn))
}
