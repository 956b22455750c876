//! Egress service lifecycle: boot, the streaming loop, graceful shutdown,
//! and the `status` read-only surface.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};
use tracing::{error, info, warn};

use crate::batch::BatchController;
use crate::buffer::ChangeBuffer;
use crate::config::Config;
use crate::connect::connect_source;
use crate::error::MirrorError;
use crate::export::{plant_start_marker, smallest_first, spawn_pool, ExportJob, ExportPoolConfig};
use crate::lsn::Lsn;
use crate::model::{Change, ChangeKind, DdlEvent, Message, TableId};
use crate::output::GzipCsvSink;
use crate::recovery;
use crate::registry::{PostgresRegistry, Registry, ReloadStatus};
use crate::reload::ReloadCoordinator;
use crate::replication::{slot_exists, ReplicationClient};
use crate::schema::discover_tables;

/// Unregistered directories younger than this are left untouched by the
/// recovery sweep; a live writer may still own them.
const ORPHAN_GRACE: Duration = Duration::from_secs(3600);

/// Cadence of replication polls between flush cycles.
const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run the egress service until a termination signal arrives.
pub async fn run_egress(config: Config) -> Result<()> {
    let mut shutdown = setup_shutdown_handler();

    // Control-plane connection: slot probe, provisioning, markers.
    let control = connect_source(&config.connection.dsn).await?;
    let fresh = !slot_exists(&control, &config.replication.slot_name).await?;
    if fresh {
        info!("No replication slot; running fresh initialization");
    } else {
        info!("Replication slot exists; resuming");
    }

    let registry_client = connect_source(&config.connection.dsn).await?;
    let registry: Arc<dyn Registry> = Arc::new(PostgresRegistry::new(
        registry_client,
        config.registry.schema.clone(),
    ));
    registry.ensure_schema().await?;

    let replication_pg = connect_source(&config.connection.dsn).await?;
    let exclude_tables = vec![format!("{}.*", config.registry.schema)];
    let mut replication = ReplicationClient::open(
        replication_pg,
        &config.replication.slot_name,
        fresh,
        &exclude_tables,
    )
    .await?;

    let buffer = Arc::new(ChangeBuffer::new(config.reload_coordination.delta_strategy));
    let sink = Arc::new(GzipCsvSink::new(&config.output));
    let controller = BatchController::new(
        buffer.clone(),
        sink.clone(),
        registry.clone(),
        config.batch_control.clone(),
    );

    let (export_tx, pool_handle) = spawn_pool(
        ExportPoolConfig {
            dsn: config.connection.dsn.clone(),
            marker_prefix: config.reload_coordination.marker_prefix.clone(),
            max_workers: config.workers.max_export_workers,
            job_timeout: config.reload_coordination.operation_timeout,
        },
        sink.clone(),
        registry.clone(),
        shutdown.resubscribe(),
    );

    let coordinator = ReloadCoordinator::new(
        registry.clone(),
        buffer.clone(),
        sink.clone(),
        export_tx.clone(),
        config.reload_coordination.clone(),
    );

    if fresh {
        fresh_init(&config, &control, registry.as_ref()).await?;
    } else {
        resume(&config, registry.as_ref(), &replication, &export_tx).await?;
    }

    if let Some(days) = config.registry.cleanup_after_days {
        recovery::cleanup_registry(registry.as_ref(), days).await?;
    }

    coordinator.refresh_modes().await?;

    // Streaming loop. The poll tick drives ingestion and threshold flushes;
    // the flush tick drives the interval cadence; a shutdown signal drains
    // and exits.
    let mut flush_tick = tokio::time::interval(config.batch_control.interval);
    flush_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut poll_tick = tokio::time::interval(POLL_INTERVAL);
    let mut last_commit = replication.confirmed();
    let ddl_history = config.replication.ddl_history();

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!("Shutdown signal received");
                break;
            }
            _ = poll_tick.tick() => {
                match replication.poll().await {
                    Ok(messages) => {
                        dispatch(&messages, &ddl_history, &buffer, &coordinator, &mut last_commit)
                            .await?;
                        if controller.over_threshold().await {
                            run_cycle(&controller, &coordinator, &mut replication, last_commit)
                                .await?;
                        }
                    }
                    Err(MirrorError::Transport(e)) => {
                        warn!("Replication transport error: {e}; reconnecting");
                        match reconnect(&config).await {
                            Ok(mut client) => {
                                // Already-buffered transactions must not be
                                // delivered twice.
                                client.fast_forward(replication.delivered_upto());
                                replication = client;
                            }
                            Err(e) => warn!("Reconnect failed ({e}); retrying next poll"),
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
            _ = flush_tick.tick() => {
                run_cycle(&controller, &coordinator, &mut replication, last_commit).await?;
            }
        }
    }

    // Drain: one final flush, confirm, then tear down back-to-front.
    run_cycle(&controller, &coordinator, &mut replication, last_commit).await?;
    drop(export_tx);
    if let Err(e) = pool_handle.await {
        warn!("Export pool terminated abnormally: {e}");
    }
    info!("Clean shutdown at {}", replication.confirmed());
    Ok(())
}

/// One flush cycle: coordinator maintenance, batch flush, confirm.
async fn run_cycle(
    controller: &BatchController,
    coordinator: &ReloadCoordinator,
    replication: &mut ReplicationClient,
    last_commit: Lsn,
) -> Result<()> {
    coordinator.poll().await?;
    let stats = controller
        .run_cycle(last_commit, replication.confirmed())
        .await?;
    let mut flush = stats.flush_lsn;
    if let Some(floor) = coordinator.confirm_floor().await {
        flush = flush.min(floor);
    }
    match replication.confirm(flush).await {
        Ok(()) => {}
        // Registration is durable; confirming again next cycle is safe.
        Err(MirrorError::Transport(e)) => warn!("Confirm failed ({e}); retrying next cycle"),
        Err(e) => return Err(e.into()),
    }
    Ok(())
}

/// Route one poll's worth of messages into the buffer and the coordinator.
async fn dispatch(
    messages: &[Message],
    ddl_history: &TableId,
    buffer: &ChangeBuffer,
    coordinator: &ReloadCoordinator,
    last_commit: &mut Lsn,
) -> Result<()> {
    for message in messages {
        match message {
            Message::Begin { .. } => {}
            Message::Commit { end_lsn, .. } => *last_commit = (*last_commit).max(*end_lsn),
            Message::Relation(rel) => {
                if coordinator.known(&rel.table).await {
                    buffer.push_relation(rel).await;
                }
            }
            Message::Insert(change) | Message::Update(change) | Message::Delete(change) => {
                if change.table == *ddl_history {
                    if let Some(event) = DdlEvent::from_change(change) {
                        let was_marker = coordinator.observe_ddl(&event).await?;
                        if !was_marker {
                            buffer.push_ddl(event).await;
                        }
                    }
                } else {
                    route_change(buffer, coordinator, change.clone()).await;
                }
            }
            Message::Truncate { tables, lsn } => {
                for table in tables {
                    let change = Change {
                        table: table.clone(),
                        kind: ChangeKind::Truncate,
                        lsn: *lsn,
                        commit_time: Utc::now(),
                        new_row: None,
                        old_row: None,
                    };
                    route_change(buffer, coordinator, change).await;
                }
            }
        }
    }
    Ok(())
}

async fn route_change(buffer: &ChangeBuffer, coordinator: &ReloadCoordinator, change: Change) {
    if !coordinator.known(&change.table).await {
        return;
    }
    if coordinator.is_reloading(&change.table).await {
        buffer.push_delta(change).await;
    } else {
        buffer.push_change(change).await;
    }
}

/// Provision a brand-new deployment: capture trigger, target discovery,
/// PendingReload rows, and one START marker per table. The markers flow
/// through the WAL, so the normal coordinator path drives every initial
/// export.
async fn fresh_init(
    config: &Config,
    control: &tokio_postgres::Client,
    registry: &dyn Registry,
) -> Result<()> {
    recovery::install_ddl_capture(control, &config.replication.ddl_history()).await?;

    let tables = discover_tables(
        control,
        &config.tables,
        &config.registry.schema,
        &config.replication.ddl_history(),
    )
    .await?;
    info!("Discovered {} target tables", tables.len());

    for table in &tables {
        if registry.insert_pending_table(table).await? {
            info!("Tracking new table {table} (pending reload)");
        }
    }

    for table in smallest_first(control, tables).await {
        plant_start_marker(
            control,
            &config.connection.dsn,
            &config.reload_coordination.marker_prefix,
            &table,
            config.reload_coordination.operation_timeout,
        )
        .await
        .with_context(|| format!("Failed to plant initial export marker for {table}"))?;
    }
    Ok(())
}

/// Crash recovery before the stream resumes.
async fn resume(
    config: &Config,
    registry: &dyn Registry,
    replication: &ReplicationClient,
    export_tx: &mpsc::Sender<ExportJob>,
) -> Result<()> {
    let stats =
        recovery::reconcile_files(&config.output.base_path, registry, ORPHAN_GRACE).await?;
    if stats != Default::default() {
        info!(
            "Reconciled filesystem: {} tmp removed, {} orphans registered, {} orphans removed",
            stats.tmp_removed, stats.orphans_registered, stats.orphans_removed
        );
    }

    for job in recovery::repair_active_reloads(registry).await? {
        if export_tx.send(job).await.is_err() {
            error!("Export pool unavailable during recovery");
        }
    }

    let resume_lsn = recovery::resume_position(registry, replication.confirmed()).await?;
    info!("Resuming replication from {resume_lsn}");
    Ok(())
}

async fn reconnect(config: &Config) -> Result<ReplicationClient, MirrorError> {
    let pg = connect_source(&config.connection.dsn)
        .await
        .map_err(|e| MirrorError::SnapshotUnavailable(e.to_string()))?;
    let exclude_tables = vec![format!("{}.*", config.registry.schema)];
    ReplicationClient::open(pg, &config.replication.slot_name, false, &exclude_tables).await
}

/// Print the per-table registry state and exit.
pub async fn run_status(config: Config) -> Result<()> {
    let client = connect_source(&config.connection.dsn).await?;
    let registry = PostgresRegistry::new(client, config.registry.schema.clone());

    let states = registry.all_table_states().await?;
    if states.is_empty() {
        println!("No tables tracked; has the egress service initialized?");
        return Ok(());
    }

    println!(
        "{:<40} {:<16} {:<16} {:>8}",
        "TABLE", "MODE", "LAST LSN", "FILES"
    );
    for state in &states {
        let files = registry.file_count(&state.table).await?;
        println!(
            "{:<40} {:<16} {:<16} {:>8}",
            state.table.to_string(),
            state.mode.as_str(),
            state.last_streaming_lsn.to_string(),
            files
        );
    }

    // Active operations, plus failed ones still holding a table in
    // Reloading (awaiting retry or an operator).
    let mut ops = registry.active_reloads().await?;
    for state in &states {
        if let Some(export_id) = state.reload_export_id {
            if !ops.iter().any(|op| op.export_id == export_id) {
                if let Some(op) = registry.reload_operation(export_id).await? {
                    ops.push(op);
                }
            }
        }
    }
    for op in ops {
        println!(
            "reload {}: {} since {} (start {}, status {})",
            op.export_id,
            op.table,
            op.created_at.to_rfc3339(),
            op.start_marker_lsn,
            match op.status {
                ReloadStatus::Active => "active",
                ReloadStatus::Completed => "completed",
                ReloadStatus::Failed => "failed",
            }
        );
    }
    Ok(())
}

/// Broadcast channel fed by SIGINT/SIGTERM.
fn setup_shutdown_handler() -> broadcast::Receiver<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);

    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("Failed to install SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("Received interrupt signal"),
                _ = term.recv() => info!("Received terminate signal"),
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("Received interrupt signal");
        }
        let _ = shutdown_tx.send(());
    });

    shutdown_rx
}
