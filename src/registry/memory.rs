//! In-memory registry with the same transactional semantics as the
//! PostgreSQL store. Backs unit tests and the recovery scenarios.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{MirrorError, MirrorResult};
use crate::lsn::Lsn;
use crate::model::TableId;

use super::{FileRecord, FileType, Registry, ReloadOperation, ReloadStatus, TableMode, TableState};

#[derive(Default)]
struct MemState {
    files: Vec<FileRecord>,
    next_id: i64,
    states: HashMap<TableId, TableState>,
    reloads: Vec<ReloadOperation>,
}

#[derive(Default)]
pub struct MemoryRegistry {
    state: Mutex<MemState>,
}

impl MemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// All registered files, insertion order. Test helper.
    pub async fn files(&self) -> Vec<FileRecord> {
        self.state.lock().await.files.clone()
    }

    /// All reload operations, insertion order. Test helper.
    pub async fn operations(&self) -> Vec<ReloadOperation> {
        self.state.lock().await.reloads.clone()
    }
}

fn resume_streaming(state: &mut MemState, table: &TableId) {
    if let Some(ts) = state.states.get_mut(table) {
        ts.mode = TableMode::Streaming;
        ts.reload_export_id = None;
        ts.reload_start_lsn = None;
        ts.updated_at = Utc::now();
    }
}

#[async_trait]
impl Registry for MemoryRegistry {
    async fn ensure_schema(&self) -> MirrorResult<()> {
        Ok(())
    }

    async fn register(&self, record: &FileRecord) -> MirrorResult<()> {
        let mut state = self.state.lock().await;

        if state.files.iter().any(|f| f.file_path == record.file_path) {
            return Err(MirrorError::RegistryConflict(format!(
                "file already registered: {}",
                record.file_path
            )));
        }

        if record.file_type.is_data() {
            let last = state
                .files
                .iter()
                .filter(|f| f.table == record.table && f.file_type.is_data())
                .map(|f| f.end_lsn)
                .max();
            if let Some(last) = last {
                if record.end_lsn <= last {
                    return Err(MirrorError::NonMonotonicLsn {
                        table: record.table.to_string(),
                        attempted: record.end_lsn.to_string(),
                        last: last.to_string(),
                    });
                }
            }
            if let Some(ts) = state.states.get_mut(&record.table) {
                ts.last_streaming_lsn = ts.last_streaming_lsn.max(record.end_lsn);
                ts.updated_at = Utc::now();
            }
        }

        state.next_id += 1;
        let mut stored = record.clone();
        stored.id = state.next_id;
        state.files.push(stored);
        Ok(())
    }

    async fn mark_reload_start(
        &self,
        table: &TableId,
        export_id: Uuid,
        start_lsn: Lsn,
    ) -> MirrorResult<()> {
        let mut state = self.state.lock().await;
        if state
            .reloads
            .iter()
            .any(|op| op.table == *table && op.status == ReloadStatus::Active)
        {
            return Err(MirrorError::ReloadAlreadyActive(table.to_string()));
        }
        state.reloads.push(ReloadOperation {
            export_id,
            table: table.clone(),
            start_marker_lsn: start_lsn,
            end_marker_lsn: None,
            status: ReloadStatus::Active,
            created_at: Utc::now(),
        });
        if let Some(ts) = state.states.get_mut(table) {
            ts.mode = TableMode::Reloading;
            ts.reload_export_id = Some(export_id);
            ts.reload_start_lsn = Some(start_lsn);
            ts.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn mark_reload_end(&self, export_id: Uuid, end_lsn: Lsn) -> MirrorResult<()> {
        let mut state = self.state.lock().await;
        let Some(op) = state
            .reloads
            .iter_mut()
            .find(|op| op.export_id == export_id && op.status == ReloadStatus::Active)
        else {
            return Err(MirrorError::RegistryConflict(format!(
                "no active reload operation {export_id}"
            )));
        };
        op.status = ReloadStatus::Completed;
        op.end_marker_lsn = Some(end_lsn);
        let table = op.table.clone();
        resume_streaming(&mut state, &table);
        Ok(())
    }

    async fn failed_reload(&self, export_id: Uuid, abandon: bool) -> MirrorResult<()> {
        let mut state = self.state.lock().await;
        let Some(op) = state
            .reloads
            .iter_mut()
            .find(|op| op.export_id == export_id && op.status == ReloadStatus::Active)
        else {
            return Ok(());
        };
        op.status = ReloadStatus::Failed;
        let table = op.table.clone();
        if abandon {
            resume_streaming(&mut state, &table);
        }
        Ok(())
    }

    async fn insert_pending_table(&self, table: &TableId) -> MirrorResult<bool> {
        let mut state = self.state.lock().await;
        if state.states.contains_key(table) {
            return Ok(false);
        }
        state.states.insert(
            table.clone(),
            TableState {
                table: table.clone(),
                mode: TableMode::PendingReload,
                last_streaming_lsn: Lsn::ZERO,
                reload_export_id: None,
                reload_start_lsn: None,
                updated_at: Utc::now(),
            },
        );
        Ok(true)
    }

    async fn set_table_mode(&self, table: &TableId, mode: TableMode) -> MirrorResult<()> {
        let mut state = self.state.lock().await;
        if mode == TableMode::Streaming {
            resume_streaming(&mut state, table);
        } else if let Some(ts) = state.states.get_mut(table) {
            ts.mode = mode;
            ts.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn table_state(&self, table: &TableId) -> MirrorResult<Option<TableState>> {
        Ok(self.state.lock().await.states.get(table).cloned())
    }

    async fn all_table_states(&self) -> MirrorResult<Vec<TableState>> {
        let state = self.state.lock().await;
        let mut states: Vec<_> = state.states.values().cloned().collect();
        states.sort_by(|a, b| a.table.cmp(&b.table));
        Ok(states)
    }

    async fn active_reloads(&self) -> MirrorResult<Vec<ReloadOperation>> {
        Ok(self
            .state
            .lock()
            .await
            .reloads
            .iter()
            .filter(|op| op.status == ReloadStatus::Active)
            .cloned()
            .collect())
    }

    async fn reload_operation(&self, export_id: Uuid) -> MirrorResult<Option<ReloadOperation>> {
        Ok(self
            .state
            .lock()
            .await
            .reloads
            .iter()
            .find(|op| op.export_id == export_id)
            .cloned())
    }

    async fn latest_file(&self, table: &TableId) -> MirrorResult<Option<FileRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .files
            .iter()
            .filter(|f| f.table == *table && f.file_type.is_data())
            .max_by_key(|f| f.end_lsn)
            .cloned())
    }

    async fn find_file(
        &self,
        table: &TableId,
        file_type: FileType,
        end_lsn: Lsn,
    ) -> MirrorResult<Option<FileRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .files
            .iter()
            .find(|f| f.table == *table && f.file_type == file_type && f.end_lsn == end_lsn)
            .cloned())
    }

    async fn file_by_path(&self, path: &str) -> MirrorResult<Option<FileRecord>> {
        Ok(self
            .state
            .lock()
            .await
            .files
            .iter()
            .find(|f| f.file_path == path)
            .cloned())
    }

    async fn file_count(&self, table: &TableId) -> MirrorResult<u64> {
        Ok(self
            .state
            .lock()
            .await
            .files
            .iter()
            .filter(|f| f.table == *table)
            .count() as u64)
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> MirrorResult<Vec<FileRecord>> {
        let mut state = self.state.lock().await;
        let (old, keep): (Vec<_>, Vec<_>) = state
            .files
            .drain(..)
            .partition(|f| f.created_at < cutoff);
        state.files = keep;
        Ok(old)
    }
}
