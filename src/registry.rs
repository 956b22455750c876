//! Transactional index of produced files, per-table mode, and reload
//! operations.
//!
//! The registry is the sole writer of its three tables. It lives in a
//! dedicated schema on the source database, excluded from the publication so
//! its own writes never echo back through the slot. The `Registry` trait
//! decouples everything above it from the storage: `PostgresRegistry` is the
//! real store, `MemoryRegistry` backs the tests and the recovery unit
//! scenarios.

pub mod memory;
pub mod postgres;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::MirrorResult;
use crate::lsn::Lsn;
use crate::model::TableId;

pub use memory::MemoryRegistry;
pub use postgres::PostgresRegistry;

/// Kind of a registered file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Streaming,
    FullReload,
    Ddl,
}

impl FileType {
    pub fn as_str(self) -> &'static str {
        match self {
            FileType::Streaming => "streaming",
            FileType::FullReload => "full_reload",
            FileType::Ddl => "ddl",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "streaming" => Some(FileType::Streaming),
            "full_reload" => Some(FileType::FullReload),
            "ddl" => Some(FileType::Ddl),
            _ => None,
        }
    }

    /// Whether records of this type participate in the per-table end_lsn
    /// monotonicity chain.
    pub fn is_data(self) -> bool {
        !matches!(self, FileType::Ddl)
    }
}

/// Per-table streaming mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableMode {
    PendingReload,
    Streaming,
    Reloading,
}

impl TableMode {
    pub fn as_str(self) -> &'static str {
        match self {
            TableMode::PendingReload => "pending_reload",
            TableMode::Streaming => "streaming",
            TableMode::Reloading => "reloading",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending_reload" => Some(TableMode::PendingReload),
            "streaming" => Some(TableMode::Streaming),
            "reloading" => Some(TableMode::Reloading),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadStatus {
    Active,
    Completed,
    Failed,
}

impl ReloadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ReloadStatus::Active => "active",
            ReloadStatus::Completed => "completed",
            ReloadStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(ReloadStatus::Active),
            "completed" => Some(ReloadStatus::Completed),
            "failed" => Some(ReloadStatus::Failed),
            _ => None,
        }
    }
}

/// One produced file. `id` is assigned by the store on insert.
#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub table: TableId,
    pub batch_timestamp: DateTime<Utc>,
    pub file_path: String,
    pub file_type: FileType,
    pub end_lsn: Lsn,
    pub row_count: u64,
    pub has_ddl: bool,
    pub sha256: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Durable per-table state, mirrored in memory by the reload coordinator.
#[derive(Debug, Clone)]
pub struct TableState {
    pub table: TableId,
    pub mode: TableMode,
    pub last_streaming_lsn: Lsn,
    pub reload_export_id: Option<Uuid>,
    pub reload_start_lsn: Option<Lsn>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct ReloadOperation {
    pub export_id: Uuid,
    pub table: TableId,
    pub start_marker_lsn: Lsn,
    pub end_marker_lsn: Option<Lsn>,
    pub status: ReloadStatus,
    pub created_at: DateTime<Utc>,
}

/// Store operations; each implementation runs every mutation as a single
/// transaction.
#[async_trait]
pub trait Registry: Send + Sync {
    /// Idempotently create the registry schema and tables.
    async fn ensure_schema(&self) -> MirrorResult<()>;

    /// Insert a file record. For data records the per-table `end_lsn` chain
    /// must move strictly forward (`NonMonotonicLsn` otherwise) and the
    /// table's `last_streaming_lsn` advances with it.
    async fn register(&self, record: &FileRecord) -> MirrorResult<()>;

    /// Open a reload: insert the Active operation and flip the table to
    /// Reloading. `ReloadAlreadyActive` if an Active operation exists.
    async fn mark_reload_start(
        &self,
        table: &TableId,
        export_id: Uuid,
        start_lsn: Lsn,
    ) -> MirrorResult<()>;

    /// Complete a reload: operation Completed, table back to Streaming.
    async fn mark_reload_end(&self, export_id: Uuid, end_lsn: Lsn) -> MirrorResult<()>;

    /// Fail a reload. With `abandon` the table returns to Streaming;
    /// otherwise it stays Reloading so recovery may retry.
    async fn failed_reload(&self, export_id: Uuid, abandon: bool) -> MirrorResult<()>;

    /// Insert a PendingReload row unless the table is already known.
    /// Returns true when the row was created.
    async fn insert_pending_table(&self, table: &TableId) -> MirrorResult<bool>;

    /// Force a table's mode; Streaming clears any reload bookkeeping.
    async fn set_table_mode(&self, table: &TableId, mode: TableMode) -> MirrorResult<()>;

    async fn table_state(&self, table: &TableId) -> MirrorResult<Option<TableState>>;

    async fn all_table_states(&self) -> MirrorResult<Vec<TableState>>;

    async fn active_reloads(&self) -> MirrorResult<Vec<ReloadOperation>>;

    async fn reload_operation(&self, export_id: Uuid) -> MirrorResult<Option<ReloadOperation>>;

    /// Latest data record (streaming or full reload) for a table.
    async fn latest_file(&self, table: &TableId) -> MirrorResult<Option<FileRecord>>;

    /// Find a data record by table, type, and exact end position. Used to
    /// match a reload export against its START marker.
    async fn find_file(
        &self,
        table: &TableId,
        file_type: FileType,
        end_lsn: Lsn,
    ) -> MirrorResult<Option<FileRecord>>;

    /// Look a record up by its file path. Recovery uses this to decide
    /// whether an on-disk directory is registered.
    async fn file_by_path(&self, path: &str) -> MirrorResult<Option<FileRecord>>;

    /// Number of registered files for a table.
    async fn file_count(&self, table: &TableId) -> MirrorResult<u64>;

    /// Delete records older than the cutoff and return them so the caller
    /// can remove their directories.
    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> MirrorResult<Vec<FileRecord>>;
}
