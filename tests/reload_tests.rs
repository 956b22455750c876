//! Reload coordination scenarios against the in-memory registry: marker
//! sequencing, delta policies, duplicate markers, and END-before-export
//! ordering.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use data_mirror::buffer::ChangeBuffer;
use data_mirror::config::{CompressionConfig, DeltaStrategy, OutputConfig, ReloadConfig};
use data_mirror::lsn::Lsn;
use data_mirror::model::{
    Change, ChangeKind, DdlEvent, MarkerAction, ReloadMarker, TableId,
};
use data_mirror::output::GzipCsvSink;
use data_mirror::registry::{
    FileRecord, FileType, MemoryRegistry, Registry, ReloadStatus, TableMode,
};
use data_mirror::reload::ReloadCoordinator;
use tempfile::TempDir;
use tokio::sync::mpsc;
use uuid::Uuid;

const PREFIX: &str = "MIRROR::";

struct Fixture {
    registry: Arc<MemoryRegistry>,
    buffer: Arc<ChangeBuffer>,
    coordinator: ReloadCoordinator,
    jobs: mpsc::Receiver<data_mirror::export::ExportJob>,
    _dir: TempDir,
}

async fn fixture(strategy: DeltaStrategy) -> Fixture {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(MemoryRegistry::new());
    let buffer = Arc::new(ChangeBuffer::new(strategy));
    let sink = Arc::new(GzipCsvSink::new(&OutputConfig {
        base_path: dir.path().to_path_buf(),
        compression: CompressionConfig::default(),
        timestamp_format: "%Y-%m-%dT%H-%M-%S%.6f".to_string(),
        emit_old_image: false,
    }));
    let (tx, jobs) = mpsc::channel(8);
    let coordinator = ReloadCoordinator::new(
        registry.clone(),
        buffer.clone(),
        sink,
        tx,
        ReloadConfig {
            marker_prefix: PREFIX.to_string(),
            delta_strategy: strategy,
            operation_timeout: Duration::from_secs(3600),
            max_retries: 1,
        },
    );

    let users = TableId::parse("public.users");
    registry.insert_pending_table(&users).await.unwrap();
    registry
        .set_table_mode(&users, TableMode::Streaming)
        .await
        .unwrap();
    coordinator.refresh_modes().await.unwrap();

    Fixture {
        registry,
        buffer,
        coordinator,
        jobs,
        _dir: dir,
    }
}

fn users() -> TableId {
    TableId::parse("public.users")
}

fn change(lsn: &str, id: u32) -> Change {
    Change {
        table: users(),
        kind: ChangeKind::Insert,
        lsn: lsn.parse().unwrap(),
        commit_time: Utc::now(),
        new_row: Some(vec![("id".into(), Some(id.to_string()))]),
        old_row: None,
    }
}

fn marker_event(action: MarkerAction, export_id: Uuid, at: &str) -> DdlEvent {
    marker_event_with_snapshot(action, export_id, at, None)
}

fn marker_event_with_snapshot(
    action: MarkerAction,
    export_id: Uuid,
    at: &str,
    snapshot_id: Option<&str>,
) -> DdlEvent {
    let marker = ReloadMarker {
        action,
        export_id,
        table: users(),
        timestamp: Utc::now(),
        rows_exported: None,
        snapshot_id: snapshot_id.map(String::from),
        lsn: Lsn::ZERO,
    };
    DdlEvent {
        captured_at: Utc::now(),
        object_type: "table".into(),
        table: Some(users()),
        command_text: marker.to_sql(PREFIX),
        tag: "COMMENT".into(),
        lsn: at.parse().unwrap(),
    }
}

fn full_reload_record(anchor: &str, path: &str) -> FileRecord {
    FileRecord {
        id: 0,
        table: users(),
        batch_timestamp: Utc::now(),
        file_path: path.to_string(),
        file_type: FileType::FullReload,
        end_lsn: anchor.parse().unwrap(),
        row_count: 3,
        has_ddl: false,
        sha256: None,
        created_at: Utc::now(),
    }
}

#[tokio::test]
async fn test_reload_with_discard_policy() {
    let mut fx = fixture(DeltaStrategy::Discard).await;

    // Streaming activity before the reload.
    fx.buffer.push_change(change("0/50", 1)).await;

    // START at L1 = 0/100.
    let export_id = Uuid::new_v4();
    let was_marker = fx
        .coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportStart, export_id, "0/100"))
        .await
        .unwrap();
    assert!(was_marker);

    // Final streaming batch flushed with end_lsn < L1.
    let files = fx.registry.files().await;
    assert_eq!(files.len(), 1);
    assert_eq!(files[0].file_type, FileType::Streaming);
    assert!(files[0].end_lsn < "0/100".parse().unwrap());

    // The table now diverts to deltas and the export job is dispatched.
    assert!(fx.coordinator.is_reloading(&users()).await);
    let job = fx.jobs.recv().await.unwrap();
    assert_eq!(job.export_id, export_id);
    assert_eq!(job.anchor_lsn, "0/100".parse().unwrap());

    // Concurrent writes during the reload.
    for i in 0..10 {
        fx.buffer.push_delta(change(&format!("0/1{i:02}"), i)).await;
    }

    // The export registers at the anchor, then END arrives at L2.
    fx.registry
        .register(&full_reload_record("0/100", "/data/users/full"))
        .await
        .unwrap();
    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportEnd, export_id, "0/200"))
        .await
        .unwrap();

    let op = fx
        .registry
        .reload_operation(export_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op.status, ReloadStatus::Completed);
    assert_eq!(op.end_marker_lsn, Some("0/200".parse().unwrap()));
    assert!(!fx.coordinator.is_reloading(&users()).await);

    // Discard policy: no streaming record lands in (L1, L2].
    let l1: Lsn = "0/100".parse().unwrap();
    let l2: Lsn = "0/200".parse().unwrap();
    for f in fx.registry.files().await {
        if f.file_type == FileType::Streaming {
            assert!(f.end_lsn < l1 || f.end_lsn > l2);
        }
    }
}

#[tokio::test]
async fn test_reload_with_apply_policy_writes_delta_batch() {
    let mut fx = fixture(DeltaStrategy::Apply).await;

    let export_id = Uuid::new_v4();
    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportStart, export_id, "0/100"))
        .await
        .unwrap();
    let _ = fx.jobs.recv().await.unwrap();

    fx.buffer.push_delta(change("0/120", 7)).await;
    fx.buffer.push_delta(change("0/130", 8)).await;

    fx.registry
        .register(&full_reload_record("0/100", "/data/users/full"))
        .await
        .unwrap();
    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportEnd, export_id, "0/200"))
        .await
        .unwrap();

    // The delta batch registers as streaming with end_lsn = END marker LSN.
    let files = fx.registry.files().await;
    let delta = files
        .iter()
        .find(|f| f.file_type == FileType::Streaming)
        .unwrap();
    assert_eq!(delta.end_lsn, "0/200".parse().unwrap());
    assert_eq!(delta.row_count, 2);
}

#[tokio::test]
async fn test_start_marker_snapshot_reaches_the_export_job() {
    let mut fx = fixture(DeltaStrategy::Discard).await;

    let export_id = Uuid::new_v4();
    fx.coordinator
        .observe_ddl(&marker_event_with_snapshot(
            MarkerAction::ExportStart,
            export_id,
            "0/100",
            Some("00000003-000001A3-1"),
        ))
        .await
        .unwrap();

    let job = fx.jobs.recv().await.unwrap();
    assert_eq!(job.snapshot_id.as_deref(), Some("00000003-000001A3-1"));

    // The snapshot is reused when the export is retried.
    fx.registry.failed_reload(export_id, false).await.unwrap();
    fx.coordinator.poll().await.unwrap();
    let retry = fx.jobs.recv().await.unwrap();
    assert_ne!(retry.export_id, export_id);
    assert_eq!(retry.snapshot_id.as_deref(), Some("00000003-000001A3-1"));
}

#[tokio::test]
async fn test_duplicate_end_marker_is_ignored() {
    let mut fx = fixture(DeltaStrategy::Discard).await;

    let export_id = Uuid::new_v4();
    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportStart, export_id, "0/100"))
        .await
        .unwrap();
    let _ = fx.jobs.recv().await.unwrap();
    fx.registry
        .register(&full_reload_record("0/100", "/data/users/full"))
        .await
        .unwrap();

    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportEnd, export_id, "0/200"))
        .await
        .unwrap();
    let ops_after_first = fx.registry.operations().await;

    // Second END for the same export id: logged and ignored.
    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportEnd, export_id, "0/300"))
        .await
        .unwrap();
    let ops_after_second = fx.registry.operations().await;
    assert_eq!(ops_after_first.len(), ops_after_second.len());
    assert_eq!(
        ops_after_second[0].end_marker_lsn,
        Some("0/200".parse().unwrap())
    );
}

#[tokio::test]
async fn test_duplicate_start_marker_is_ignored() {
    let mut fx = fixture(DeltaStrategy::Discard).await;

    let export_id = Uuid::new_v4();
    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportStart, export_id, "0/100"))
        .await
        .unwrap();
    let _ = fx.jobs.recv().await.unwrap();

    // A second START while Reloading changes nothing and dispatches no job.
    fx.coordinator
        .observe_ddl(&marker_event(
            MarkerAction::ExportStart,
            Uuid::new_v4(),
            "0/150",
        ))
        .await
        .unwrap();
    assert_eq!(fx.registry.operations().await.len(), 1);
    assert!(fx.jobs.try_recv().is_err());
}

#[tokio::test]
async fn test_end_marker_waits_for_export_registration() {
    let mut fx = fixture(DeltaStrategy::Discard).await;

    let export_id = Uuid::new_v4();
    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportStart, export_id, "0/100"))
        .await
        .unwrap();
    let _ = fx.jobs.recv().await.unwrap();

    // END arrives before the export has registered: held, not completed.
    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportEnd, export_id, "0/200"))
        .await
        .unwrap();
    let op = fx
        .registry
        .reload_operation(export_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op.status, ReloadStatus::Active);

    // The held END caps the confirmable position below the marker.
    let floor = fx.coordinator.confirm_floor().await.unwrap();
    assert!(floor < "0/200".parse().unwrap());

    // Once the export lands, the next maintenance pass completes the
    // reload.
    fx.registry
        .register(&full_reload_record("0/100", "/data/users/full"))
        .await
        .unwrap();
    fx.coordinator.poll().await.unwrap();

    let op = fx
        .registry
        .reload_operation(export_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(op.status, ReloadStatus::Completed);
    assert!(fx.coordinator.confirm_floor().await.is_none());
}

#[tokio::test]
async fn test_malformed_marker_changes_nothing() {
    let fx = fixture(DeltaStrategy::Discard).await;
    let event = DdlEvent {
        captured_at: Utc::now(),
        object_type: "table".into(),
        table: Some(users()),
        command_text: format!("COMMENT ON TABLE public.users IS '{PREFIX}{{broken'"),
        tag: "COMMENT".into(),
        lsn: "0/100".parse().unwrap(),
    };
    // Treated as a marker (suppressed from DDL output) but no state change.
    assert!(fx.coordinator.observe_ddl(&event).await.unwrap());
    assert!(fx.registry.operations().await.is_empty());
    assert_eq!(
        fx.registry
            .table_state(&users())
            .await
            .unwrap()
            .unwrap()
            .mode,
        TableMode::Streaming
    );
}

#[tokio::test]
async fn test_failed_export_retries_then_abandons() {
    let mut fx = fixture(DeltaStrategy::Discard).await;

    let export_id = Uuid::new_v4();
    fx.coordinator
        .observe_ddl(&marker_event(MarkerAction::ExportStart, export_id, "0/100"))
        .await
        .unwrap();
    let _ = fx.jobs.recv().await.unwrap();

    // The worker reports failure (kept Reloading for retry).
    fx.registry.failed_reload(export_id, false).await.unwrap();

    // First maintenance pass: retry with a fresh export id, same anchor.
    fx.coordinator.poll().await.unwrap();
    let retry = fx.jobs.recv().await.unwrap();
    assert_ne!(retry.export_id, export_id);
    assert_eq!(retry.anchor_lsn, "0/100".parse().unwrap());

    // That retry fails too; max_retries = 1, so the table is abandoned back
    // to streaming.
    fx.registry
        .failed_reload(retry.export_id, false)
        .await
        .unwrap();
    fx.coordinator.poll().await.unwrap();

    let state = fx.registry.table_state(&users()).await.unwrap().unwrap();
    assert_eq!(state.mode, TableMode::Streaming);
    assert!(!fx.coordinator.is_reloading(&users()).await);
}
