//! Export worker pool: full-table snapshot exports.
//!
//! Each worker opens its own connection, starts a repeatable-read read-only
//! transaction anchored at the reload marker, introspects the catalog inside
//! that snapshot, and streams the table into the full-reload writer. On
//! success the batch is registered with `end_lsn = anchor_lsn` and the END
//! marker is planted in the WAL so the coordinator (and any restarted
//! process) observes completion in-band.
//!
//! Concurrency is semaphore-bounded; extra jobs queue in the channel.
//! Callers dispatching several jobs at once submit them smallest-first so
//! tables become streamable quickly.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures_util::{pin_mut, TryStreamExt};
use tokio::sync::{broadcast, mpsc, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use tokio_postgres::types::Type;
use tokio_postgres::{IsolationLevel, Row};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::connect::connect_source;
use crate::error::{MirrorError, MirrorResult};
use crate::lsn::Lsn;
use crate::model::{MarkerAction, ReloadMarker, TableId};
use crate::output::{BatchSink, ExportRow};
use crate::registry::{FileRecord, FileType, Registry};
use crate::schema::{table_size_estimate, TableSchema};

/// One snapshot export request.
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub table: TableId,
    pub export_id: Uuid,
    /// The START marker's LSN; the registered record's end position.
    pub anchor_lsn: Lsn,
    /// Snapshot exported alongside the START marker. The worker imports it
    /// so the reload is pinned to the anchor; without one the export sees
    /// worker-start state instead.
    pub snapshot_id: Option<String>,
}

#[derive(Clone)]
pub struct ExportPoolConfig {
    pub dsn: String,
    pub marker_prefix: String,
    pub max_workers: usize,
    /// Overall deadline for one export job.
    pub job_timeout: Duration,
}

/// Spawn the pool dispatcher. Jobs arrive on the returned sender; dropping
/// every sender (or a shutdown signal) drains in-flight work and stops.
pub fn spawn_pool(
    config: ExportPoolConfig,
    sink: Arc<dyn BatchSink>,
    registry: Arc<dyn Registry>,
    mut shutdown: broadcast::Receiver<()>,
) -> (mpsc::Sender<ExportJob>, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<ExportJob>(64);
    let handle = tokio::spawn(async move {
        let semaphore = Arc::new(Semaphore::new(config.max_workers));
        let mut workers = JoinSet::new();
        loop {
            tokio::select! {
                job = rx.recv() => {
                    let Some(job) = job else { break };
                    let permit = semaphore
                        .clone()
                        .acquire_owned()
                        .await
                        .expect("export semaphore closed");
                    let config = config.clone();
                    let sink = sink.clone();
                    let registry = registry.clone();
                    workers.spawn(async move {
                        let _permit = permit;
                        run_job(&config, sink, registry, job).await;
                    });
                }
                _ = shutdown.recv() => {
                    info!("Export pool: shutdown requested, draining workers");
                    break;
                }
                Some(_) = workers.join_next(), if !workers.is_empty() => {}
            }
        }
        while workers.join_next().await.is_some() {}
    });
    (tx, handle)
}

/// Plant a START marker with a freshly exported snapshot.
///
/// An exported snapshot is importable only while the exporting transaction
/// stays open, and the marker only reaches the WAL when its own transaction
/// commits — so the snapshot is held on a dedicated connection while the
/// marker is published through `publisher`. The holder rolls back after
/// `hold`; a worker importing later fails `SnapshotUnavailable` and the
/// reload retries.
pub async fn plant_start_marker(
    publisher: &tokio_postgres::Client,
    dsn: &str,
    marker_prefix: &str,
    table: &TableId,
    hold: Duration,
) -> MirrorResult<Uuid> {
    let holder = connect_source(dsn)
        .await
        .map_err(|e| MirrorError::SnapshotUnavailable(e.to_string()))?;
    holder
        .batch_execute("BEGIN ISOLATION LEVEL REPEATABLE READ READ ONLY")
        .await?;
    let snapshot_id: String = holder
        .query_one("SELECT pg_export_snapshot()", &[])
        .await?
        .get(0);

    let export_id = Uuid::new_v4();
    let marker = ReloadMarker {
        action: MarkerAction::ExportStart,
        export_id,
        table: table.clone(),
        timestamp: Utc::now(),
        rows_exported: None,
        snapshot_id: Some(snapshot_id.clone()),
        lsn: Lsn::ZERO,
    };
    publisher
        .execute(marker.to_sql(marker_prefix).as_str(), &[])
        .await?;
    info!("Planted START marker for {table} (export {export_id}, snapshot {snapshot_id})");

    tokio::spawn(async move {
        tokio::time::sleep(hold).await;
        if let Err(e) = holder.batch_execute("ROLLBACK").await {
            debug!("Snapshot holder {snapshot_id} already closed: {e}");
        }
    });
    Ok(export_id)
}

/// Order tables smallest-first by their current relation size so the pool
/// produces ready-to-stream tables quickly.
pub async fn smallest_first(
    client: &tokio_postgres::Client,
    tables: Vec<TableId>,
) -> Vec<TableId> {
    let mut sized: Vec<(i64, TableId)> = Vec::with_capacity(tables.len());
    for table in tables {
        let size = table_size_estimate(client, &table).await.unwrap_or(i64::MAX);
        sized.push((size, table));
    }
    sized.sort_by(|a, b| a.0.cmp(&b.0).then(a.1.cmp(&b.1)));
    sized.into_iter().map(|(_, t)| t).collect()
}

async fn run_job(
    config: &ExportPoolConfig,
    sink: Arc<dyn BatchSink>,
    registry: Arc<dyn Registry>,
    job: ExportJob,
) {
    info!(
        "Export starting: {} (export {}, anchor {})",
        job.table, job.export_id, job.anchor_lsn
    );
    match run_export(config, sink, registry.as_ref(), &job).await {
        Ok(rows) => {
            info!(
                "Export finished: {} ({rows} rows, export {})",
                job.table, job.export_id
            );
        }
        Err(e) => {
            error!("Export failed for {} ({}): {e}", job.table, job.export_id);
            if let Err(e) = registry.failed_reload(job.export_id, false).await {
                error!("Failed to mark reload {} failed: {e}", job.export_id);
            }
        }
    }
}

async fn run_export(
    config: &ExportPoolConfig,
    sink: Arc<dyn BatchSink>,
    registry: &dyn Registry,
    job: &ExportJob,
) -> MirrorResult<u64> {
    let mut client = connect_source(&config.dsn)
        .await
        .map_err(|e| MirrorError::SnapshotUnavailable(e.to_string()))?;

    let tx = client
        .build_transaction()
        .isolation_level(IsolationLevel::RepeatableRead)
        .read_only(true)
        .start()
        .await?;

    // Bind to the snapshot exported with the START marker; the import must
    // run before any other statement in this transaction.
    match &job.snapshot_id {
        Some(id) => {
            tx.batch_execute(&format!(
                "SET TRANSACTION SNAPSHOT '{}'",
                id.replace('\'', "''")
            ))
            .await
            .map_err(|e| {
                MirrorError::SnapshotUnavailable(format!("cannot import snapshot {id}: {e}"))
            })?;
            debug!("Export {} pinned to snapshot {id}", job.export_id);
        }
        None => {
            warn!(
                "Export {} for {} carries no snapshot; exporting worker-start state",
                job.export_id, job.table
            );
        }
    }

    let schema = TableSchema::introspect(&tx, &job.table)
        .await
        .map_err(|e| MirrorError::SnapshotUnavailable(e.to_string()))?;

    // The writer runs as its own task so a timeout or stream error cannot
    // cancel it mid-file; closing the channel lets it finish cleanly, and
    // the partial directory is removed below.
    let (row_tx, row_rx) = mpsc::channel::<ExportRow>(1024);
    let write_sink = sink.clone();
    let write_table = job.table.clone();
    let write_schema = schema.clone();
    let writer = tokio::spawn(async move {
        write_sink
            .write_full_reload(write_table, write_schema, row_rx)
            .await
    });

    // The deadline covers the long phase (the table scan). When it fires,
    // dropping the scan future closes the row channel; the writer finishes
    // its file cleanly and the partial directory is removed below.
    let streamed: MirrorResult<u64> = match tokio::time::timeout(config.job_timeout, async {
        let query = format!("SELECT * FROM {}", job.table.qualified());
        let stream = tx.query_raw(&query, std::iter::empty::<i32>()).await?;
        pin_mut!(stream);
        let mut rows = 0u64;
        while let Some(row) = stream.try_next().await? {
            let record = row_to_text(&row)?;
            if row_tx.send(record).await.is_err() {
                return Err(MirrorError::Io {
                    path: std::path::PathBuf::new(),
                    source: std::io::Error::other("full reload writer stopped early"),
                });
            }
            rows += 1;
        }
        drop(row_tx);
        Ok(rows)
    })
    .await
    {
        Ok(result) => result,
        Err(_) => Err(MirrorError::Timeout(format!(
            "export of {} exceeded {}s",
            job.table,
            config.job_timeout.as_secs()
        ))),
    };

    let written = writer
        .await
        .map_err(|e| MirrorError::Fatal(format!("export writer panicked: {e}")))??;

    let rows = match streamed {
        Ok(rows) => rows,
        Err(e) => {
            // The writer committed a partial directory; remove it.
            let _ = std::fs::remove_dir_all(&written.directory);
            return Err(e);
        }
    };
    tx.commit().await?;

    let record = FileRecord {
        id: 0,
        table: job.table.clone(),
        batch_timestamp: written.batch_timestamp,
        file_path: written.file_path.to_string_lossy().into_owned(),
        file_type: FileType::FullReload,
        end_lsn: job.anchor_lsn,
        row_count: written.row_count,
        has_ddl: false,
        sha256: Some(written.sha256.clone()),
        created_at: Utc::now(),
    };
    match registry.register(&record).await {
        Ok(()) => {}
        Err(MirrorError::NonMonotonicLsn { .. } | MirrorError::RegistryConflict(_)) => {
            // A previous attempt already registered this export; keep the
            // old directory, drop the new one.
            if registry
                .find_file(&job.table, FileType::FullReload, job.anchor_lsn)
                .await?
                .is_some()
            {
                warn!(
                    "Export for {} at {} was already registered; dropping duplicate",
                    job.table, job.anchor_lsn
                );
                let _ = std::fs::remove_dir_all(&written.directory);
            } else {
                return Err(MirrorError::RegistryConflict(format!(
                    "cannot register full reload for {} at {}",
                    job.table, job.anchor_lsn
                )));
            }
        }
        Err(e) => {
            let _ = std::fs::remove_dir_all(&written.directory);
            return Err(e);
        }
    }

    // Plant the END marker; it carries the row count and synchronizes every
    // observer at its WAL position.
    let marker = ReloadMarker {
        action: MarkerAction::ExportEnd,
        export_id: job.export_id,
        table: job.table.clone(),
        timestamp: Utc::now(),
        rows_exported: Some(rows),
        snapshot_id: None,
        lsn: Lsn::ZERO,
    };
    client
        .execute(marker.to_sql(&config.marker_prefix).as_str(), &[])
        .await?;

    Ok(rows)
}

/// Render one source row to CSV text fields, in column order.
fn row_to_text(row: &Row) -> MirrorResult<ExportRow> {
    let mut out = Vec::with_capacity(row.columns().len());
    for (i, column) in row.columns().iter().enumerate() {
        out.push(render_column(row, i, column.type_())?);
    }
    Ok(out)
}

fn render_column(row: &Row, i: usize, pg_type: &Type) -> MirrorResult<Option<String>> {
    let value = match *pg_type {
        Type::BOOL => row.try_get::<_, Option<bool>>(i)?.map(|v| v.to_string()),
        Type::INT2 => row.try_get::<_, Option<i16>>(i)?.map(|v| v.to_string()),
        Type::INT4 => row.try_get::<_, Option<i32>>(i)?.map(|v| v.to_string()),
        Type::INT8 => row.try_get::<_, Option<i64>>(i)?.map(|v| v.to_string()),
        Type::FLOAT4 => row.try_get::<_, Option<f32>>(i)?.map(|v| v.to_string()),
        Type::FLOAT8 => row.try_get::<_, Option<f64>>(i)?.map(|v| v.to_string()),
        Type::NUMERIC => row
            .try_get::<_, Option<rust_decimal::Decimal>>(i)?
            .map(|v| v.to_string()),
        Type::TEXT | Type::VARCHAR | Type::BPCHAR | Type::NAME => {
            row.try_get::<_, Option<String>>(i)?
        }
        Type::TIMESTAMP => row
            .try_get::<_, Option<chrono::NaiveDateTime>>(i)?
            .map(|v| v.format("%Y-%m-%d %H:%M:%S%.f").to_string()),
        Type::TIMESTAMPTZ => row
            .try_get::<_, Option<chrono::DateTime<chrono::Utc>>>(i)?
            .map(|v| v.to_rfc3339()),
        Type::DATE => row
            .try_get::<_, Option<chrono::NaiveDate>>(i)?
            .map(|v| v.to_string()),
        Type::TIME => row
            .try_get::<_, Option<chrono::NaiveTime>>(i)?
            .map(|v| v.to_string()),
        Type::UUID => row.try_get::<_, Option<Uuid>>(i)?.map(|v| v.to_string()),
        Type::JSON | Type::JSONB => row
            .try_get::<_, Option<serde_json::Value>>(i)?
            .map(|v| v.to_string()),
        Type::BYTEA => row
            .try_get::<_, Option<Vec<u8>>>(i)?
            .map(|v| format!("\\x{}", hex::encode(v))),
        Type::TEXT_ARRAY | Type::VARCHAR_ARRAY => row
            .try_get::<_, Option<Vec<String>>>(i)?
            .map(|v| format!("{{{}}}", v.join(","))),
        Type::INT4_ARRAY => row.try_get::<_, Option<Vec<i32>>>(i)?.map(|v| {
            format!(
                "{{{}}}",
                v.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",")
            )
        }),
        Type::INT8_ARRAY => row.try_get::<_, Option<Vec<i64>>>(i)?.map(|v| {
            format!(
                "{{{}}}",
                v.iter().map(|n| n.to_string()).collect::<Vec<_>>().join(",")
            )
        }),
        _ => {
            // Unknown types fall back to their text form when the driver
            // can produce one.
            match row.try_get::<_, Option<String>>(i) {
                Ok(v) => v,
                Err(_) => {
                    return Err(MirrorError::Decode(format!(
                        "unsupported column type {pg_type} in export"
                    )))
                }
            }
        }
    };
    Ok(value)
}
