//! PostgreSQL-backed registry.
//!
//! All mutations run in explicit transactions on a dedicated connection.
//! Uniqueness is double-enforced: application checks give precise errors,
//! database constraints (primary keys, the partial one-active-reload index,
//! the unique file path) hold the line under concurrency.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use tokio_postgres::error::SqlState;
use tokio_postgres::{Client, Row, Transaction};
use tracing::info;
use uuid::Uuid;

use crate::error::{MirrorError, MirrorResult};
use crate::lsn::Lsn;
use crate::model::TableId;

use super::{FileRecord, FileType, Registry, ReloadOperation, ReloadStatus, TableMode, TableState};

pub struct PostgresRegistry {
    client: Mutex<Client>,
    schema: String,
}

impl PostgresRegistry {
    /// The connection must not be shared with the replication client; the
    /// registry schema is excluded from the publication instead.
    pub fn new(client: Client, schema: impl Into<String>) -> Self {
        Self {
            client: Mutex::new(client),
            schema: schema.into(),
        }
    }

    /// `end_lsn` columns are BIGINT, which holds positions up to segment
    /// 0x7FFFFFFF. A position past that would wrap negative and corrupt
    /// the `ORDER BY end_lsn` comparisons, so it is rejected instead.
    fn lsn_param(lsn: Lsn) -> MirrorResult<i64> {
        i64::try_from(lsn.as_u64()).map_err(|_| {
            MirrorError::Fatal(format!("lsn {lsn} exceeds the registry's BIGINT range"))
        })
    }

    fn lsn_col(raw: i64) -> Lsn {
        Lsn::from_u64(raw as u64)
    }

    fn file_record(row: &Row) -> MirrorResult<FileRecord> {
        let file_type: String = row.get("file_type");
        Ok(FileRecord {
            id: row.get("id"),
            table: TableId::parse(row.get("table_name")),
            batch_timestamp: row.get("batch_timestamp"),
            file_path: row.get("file_path"),
            file_type: FileType::parse(&file_type)
                .ok_or_else(|| MirrorError::Fatal(format!("unknown file_type '{file_type}'")))?,
            end_lsn: Self::lsn_col(row.get("end_lsn")),
            row_count: row.get::<_, i64>("row_count") as u64,
            has_ddl: row.get("has_ddl"),
            sha256: row.get("sha256"),
            created_at: row.get("created_at"),
        })
    }

    fn table_state(row: &Row) -> MirrorResult<TableState> {
        let mode: String = row.get("mode");
        Ok(TableState {
            table: TableId::parse(row.get("table_name")),
            mode: TableMode::parse(&mode)
                .ok_or_else(|| MirrorError::Fatal(format!("unknown table mode '{mode}'")))?,
            last_streaming_lsn: Self::lsn_col(row.get("last_streaming_lsn")),
            reload_export_id: row.get("reload_export_id"),
            reload_start_lsn: row
                .get::<_, Option<i64>>("reload_start_lsn")
                .map(Self::lsn_col),
            updated_at: row.get("updated_at"),
        })
    }

    fn reload_operation(row: &Row) -> MirrorResult<ReloadOperation> {
        let status: String = row.get("status");
        Ok(ReloadOperation {
            export_id: row.get("export_id"),
            table: TableId::parse(row.get("table_name")),
            start_marker_lsn: Self::lsn_col(row.get("start_marker_lsn")),
            end_marker_lsn: row
                .get::<_, Option<i64>>("end_marker_lsn")
                .map(Self::lsn_col),
            status: ReloadStatus::parse(&status)
                .ok_or_else(|| MirrorError::Fatal(format!("unknown reload status '{status}'")))?,
            created_at: row.get("created_at"),
        })
    }
}

async fn resume_streaming(
    tx: &Transaction<'_>,
    schema: &str,
    table_name: &str,
) -> MirrorResult<()> {
    tx.execute(
        &format!(
            "UPDATE {schema}.table_state \
             SET mode = 'streaming', reload_export_id = NULL, reload_start_lsn = NULL, \
                 updated_at = now() \
             WHERE table_name = $1"
        ),
        &[&table_name],
    )
    .await?;
    Ok(())
}

#[async_trait]
impl Registry for PostgresRegistry {
    async fn ensure_schema(&self) -> MirrorResult<()> {
        let s = &self.schema;
        let ddl = format!(
            r#"
CREATE SCHEMA IF NOT EXISTS {s};

CREATE TABLE IF NOT EXISTS {s}.file_log (
    id              BIGSERIAL PRIMARY KEY,
    table_name      TEXT NOT NULL,
    batch_timestamp TIMESTAMPTZ NOT NULL,
    file_path       TEXT NOT NULL UNIQUE,
    file_type       TEXT NOT NULL CHECK (file_type IN ('streaming', 'full_reload', 'ddl')),
    end_lsn         BIGINT NOT NULL,
    row_count       BIGINT NOT NULL DEFAULT 0,
    has_ddl         BOOLEAN NOT NULL DEFAULT false,
    sha256          TEXT,
    created_at      TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE INDEX IF NOT EXISTS file_log_table_lsn_idx
    ON {s}.file_log (table_name, end_lsn DESC);

CREATE TABLE IF NOT EXISTS {s}.table_state (
    table_name         TEXT PRIMARY KEY,
    mode               TEXT NOT NULL CHECK (mode IN ('pending_reload', 'streaming', 'reloading')),
    last_streaming_lsn BIGINT NOT NULL DEFAULT 0,
    reload_export_id   UUID,
    reload_start_lsn   BIGINT,
    updated_at         TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE TABLE IF NOT EXISTS {s}.reload_operations (
    export_id        UUID PRIMARY KEY,
    table_name       TEXT NOT NULL,
    start_marker_lsn BIGINT NOT NULL,
    end_marker_lsn   BIGINT,
    status           TEXT NOT NULL CHECK (status IN ('active', 'completed', 'failed')),
    created_at       TIMESTAMPTZ NOT NULL DEFAULT now()
);

CREATE UNIQUE INDEX IF NOT EXISTS reload_operations_one_active_idx
    ON {s}.reload_operations (table_name) WHERE status = 'active';
"#
        );
        let client = self.client.lock().await;
        client.batch_execute(&ddl).await?;
        info!("Registry schema '{s}' ready");
        Ok(())
    }

    async fn register(&self, record: &FileRecord) -> MirrorResult<()> {
        let s = &self.schema;
        let table_name = record.table.to_string();
        let end_lsn = Self::lsn_param(record.end_lsn)?;
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        if record.file_type.is_data() {
            let last = tx
                .query_opt(
                    &format!(
                        "SELECT end_lsn FROM {s}.file_log \
                         WHERE table_name = $1 AND file_type IN ('streaming', 'full_reload') \
                         ORDER BY end_lsn DESC LIMIT 1 FOR UPDATE"
                    ),
                    &[&table_name],
                )
                .await?;
            if let Some(row) = last {
                let last_lsn = Self::lsn_col(row.get(0));
                if record.end_lsn <= last_lsn {
                    return Err(MirrorError::NonMonotonicLsn {
                        table: table_name,
                        attempted: record.end_lsn.to_string(),
                        last: last_lsn.to_string(),
                    });
                }
            }
        }

        let inserted = tx
            .execute(
                &format!(
                    "INSERT INTO {s}.file_log \
                     (table_name, batch_timestamp, file_path, file_type, end_lsn, \
                      row_count, has_ddl, sha256, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                     ON CONFLICT (file_path) DO NOTHING"
                ),
                &[
                    &table_name,
                    &record.batch_timestamp,
                    &record.file_path,
                    &record.file_type.as_str(),
                    &end_lsn,
                    &(record.row_count as i64),
                    &record.has_ddl,
                    &record.sha256,
                    &record.created_at,
                ],
            )
            .await?;
        if inserted == 0 {
            return Err(MirrorError::RegistryConflict(format!(
                "file already registered: {}",
                record.file_path
            )));
        }

        if record.file_type.is_data() {
            tx.execute(
                &format!(
                    "UPDATE {s}.table_state \
                     SET last_streaming_lsn = GREATEST(last_streaming_lsn, $2), \
                         updated_at = now() \
                     WHERE table_name = $1"
                ),
                &[&table_name, &end_lsn],
            )
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }

    async fn mark_reload_start(
        &self,
        table: &TableId,
        export_id: Uuid,
        start_lsn: Lsn,
    ) -> MirrorResult<()> {
        let s = &self.schema;
        let table_name = table.to_string();
        let start_lsn = Self::lsn_param(start_lsn)?;
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let result = tx
            .execute(
                &format!(
                    "INSERT INTO {s}.reload_operations \
                     (export_id, table_name, start_marker_lsn, status) \
                     VALUES ($1, $2, $3, 'active')"
                ),
                &[&export_id, &table_name, &start_lsn],
            )
            .await;
        if let Err(e) = result {
            if e.code() == Some(&SqlState::UNIQUE_VIOLATION) {
                return Err(MirrorError::ReloadAlreadyActive(table_name));
            }
            return Err(e.into());
        }

        tx.execute(
            &format!(
                "UPDATE {s}.table_state \
                 SET mode = 'reloading', reload_export_id = $2, reload_start_lsn = $3, \
                     updated_at = now() \
                 WHERE table_name = $1"
            ),
            &[&table_name, &export_id, &start_lsn],
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn mark_reload_end(&self, export_id: Uuid, end_lsn: Lsn) -> MirrorResult<()> {
        let s = &self.schema;
        let end_lsn = Self::lsn_param(end_lsn)?;
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                &format!(
                    "UPDATE {s}.reload_operations \
                     SET status = 'completed', end_marker_lsn = $2 \
                     WHERE export_id = $1 AND status = 'active' \
                     RETURNING table_name"
                ),
                &[&export_id, &end_lsn],
            )
            .await?;
        let Some(row) = row else {
            return Err(MirrorError::RegistryConflict(format!(
                "no active reload operation {export_id}"
            )));
        };
        let table_name: String = row.get(0);
        resume_streaming(&tx, s, &table_name).await?;

        tx.commit().await?;
        Ok(())
    }

    async fn failed_reload(&self, export_id: Uuid, abandon: bool) -> MirrorResult<()> {
        let s = &self.schema;
        let mut client = self.client.lock().await;
        let tx = client.transaction().await?;

        let row = tx
            .query_opt(
                &format!(
                    "UPDATE {s}.reload_operations SET status = 'failed' \
                     WHERE export_id = $1 AND status = 'active' \
                     RETURNING table_name"
                ),
                &[&export_id],
            )
            .await?;
        if let Some(row) = row {
            if abandon {
                let table_name: String = row.get(0);
                resume_streaming(&tx, s, &table_name).await?;
            }
        }

        tx.commit().await?;
        Ok(())
    }

    async fn insert_pending_table(&self, table: &TableId) -> MirrorResult<bool> {
        let s = &self.schema;
        let client = self.client.lock().await;
        let inserted = client
            .execute(
                &format!(
                    "INSERT INTO {s}.table_state (table_name, mode) \
                     VALUES ($1, 'pending_reload') ON CONFLICT (table_name) DO NOTHING"
                ),
                &[&table.to_string()],
            )
            .await?;
        Ok(inserted == 1)
    }

    async fn set_table_mode(&self, table: &TableId, mode: TableMode) -> MirrorResult<()> {
        let s = &self.schema;
        let client = self.client.lock().await;
        if mode == TableMode::Streaming {
            client
                .execute(
                    &format!(
                        "UPDATE {s}.table_state \
                         SET mode = 'streaming', reload_export_id = NULL, \
                             reload_start_lsn = NULL, updated_at = now() \
                         WHERE table_name = $1"
                    ),
                    &[&table.to_string()],
                )
                .await?;
        } else {
            client
                .execute(
                    &format!(
                        "UPDATE {s}.table_state SET mode = $2, updated_at = now() \
                         WHERE table_name = $1"
                    ),
                    &[&table.to_string(), &mode.as_str()],
                )
                .await?;
        }
        Ok(())
    }

    async fn table_state(&self, table: &TableId) -> MirrorResult<Option<TableState>> {
        let s = &self.schema;
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT * FROM {s}.table_state WHERE table_name = $1"),
                &[&table.to_string()],
            )
            .await?;
        row.as_ref().map(Self::table_state).transpose()
    }

    async fn all_table_states(&self) -> MirrorResult<Vec<TableState>> {
        let s = &self.schema;
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!("SELECT * FROM {s}.table_state ORDER BY table_name"),
                &[],
            )
            .await?;
        rows.iter().map(Self::table_state).collect()
    }

    async fn active_reloads(&self) -> MirrorResult<Vec<ReloadOperation>> {
        let s = &self.schema;
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!(
                    "SELECT * FROM {s}.reload_operations WHERE status = 'active' \
                     ORDER BY created_at"
                ),
                &[],
            )
            .await?;
        rows.iter().map(Self::reload_operation).collect()
    }

    async fn reload_operation(&self, export_id: Uuid) -> MirrorResult<Option<ReloadOperation>> {
        let s = &self.schema;
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT * FROM {s}.reload_operations WHERE export_id = $1"),
                &[&export_id],
            )
            .await?;
        row.as_ref().map(Self::reload_operation).transpose()
    }

    async fn latest_file(&self, table: &TableId) -> MirrorResult<Option<FileRecord>> {
        let s = &self.schema;
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT * FROM {s}.file_log \
                     WHERE table_name = $1 AND file_type IN ('streaming', 'full_reload') \
                     ORDER BY end_lsn DESC LIMIT 1"
                ),
                &[&table.to_string()],
            )
            .await?;
        row.as_ref().map(Self::file_record).transpose()
    }

    async fn find_file(
        &self,
        table: &TableId,
        file_type: FileType,
        end_lsn: Lsn,
    ) -> MirrorResult<Option<FileRecord>> {
        let s = &self.schema;
        let end_lsn = Self::lsn_param(end_lsn)?;
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!(
                    "SELECT * FROM {s}.file_log \
                     WHERE table_name = $1 AND file_type = $2 AND end_lsn = $3"
                ),
                &[&table.to_string(), &file_type.as_str(), &end_lsn],
            )
            .await?;
        row.as_ref().map(Self::file_record).transpose()
    }

    async fn file_by_path(&self, path: &str) -> MirrorResult<Option<FileRecord>> {
        let s = &self.schema;
        let client = self.client.lock().await;
        let row = client
            .query_opt(
                &format!("SELECT * FROM {s}.file_log WHERE file_path = $1"),
                &[&path],
            )
            .await?;
        row.as_ref().map(Self::file_record).transpose()
    }

    async fn file_count(&self, table: &TableId) -> MirrorResult<u64> {
        let s = &self.schema;
        let client = self.client.lock().await;
        let row = client
            .query_one(
                &format!("SELECT count(*) FROM {s}.file_log WHERE table_name = $1"),
                &[&table.to_string()],
            )
            .await?;
        Ok(row.get::<_, i64>(0) as u64)
    }

    async fn cleanup_older_than(&self, cutoff: DateTime<Utc>) -> MirrorResult<Vec<FileRecord>> {
        let s = &self.schema;
        let client = self.client.lock().await;
        let rows = client
            .query(
                &format!("DELETE FROM {s}.file_log WHERE created_at < $1 RETURNING *"),
                &[&cutoff],
            )
            .await?;
        rows.iter().map(Self::file_record).collect()
    }
}
