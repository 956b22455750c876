//! Gzip-compressed CSV batch writer.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::Receiver;
use tracing::debug;
use uuid::Uuid;

use crate::buffer::TableBatch;
use crate::config::OutputConfig;
use crate::error::{MirrorError, MirrorResult};
use crate::model::{ChangeKind, DdlEvent, RowValues, TableId};
use crate::schema::TableSchema;

use super::{
    render_ddl, BatchSink, ExportRow, WrittenFile, DDL_FILE, FULL_RELOAD_FILE, SCHEMA_FILE,
    STREAMING_FILE, TMP_PREFIX,
};

/// `_op` code for the optional old-image companion row of an update.
const OLD_IMAGE_OP: &str = "O";

/// Writes batch directories as gzip CSV with atomic rename commit.
pub struct GzipCsvSink {
    base: PathBuf,
    timestamp_format: String,
    streaming_level: Compression,
    emit_old_image: bool,
}

impl GzipCsvSink {
    pub fn new(output: &OutputConfig) -> Self {
        Self {
            base: output.base_path.clone(),
            timestamp_format: output.timestamp_format.clone(),
            streaming_level: Compression::new(output.compression.level.min(9)),
            emit_old_image: output.emit_old_image,
        }
    }

    fn stage_dir(&self) -> PathBuf {
        self.base.join(format!("{}{}", TMP_PREFIX, Uuid::new_v4()))
    }

    /// Rename the staged directory into `<base>/<schema>.<table>/<ts>/`.
    /// A timestamp collision gets a monotonic `-N` suffix so directory names
    /// keep sorting in commit order.
    fn commit(&self, tmp: &Path, table: &TableId, ts: DateTime<Utc>) -> MirrorResult<PathBuf> {
        let parent = self.base.join(format!("{}.{}", table.schema, table.name));
        std::fs::create_dir_all(&parent).map_err(|e| MirrorError::io(&parent, e))?;

        let stamp = ts.format(&self.timestamp_format).to_string();
        let mut target = parent.join(&stamp);
        let mut suffix = 2u32;
        while target.exists() {
            target = parent.join(format!("{stamp}-{suffix}"));
            suffix += 1;
        }
        std::fs::rename(tmp, &target).map_err(|e| MirrorError::io(&target, e))?;
        // Make the rename durable before the registry hears about it.
        if let Ok(dir) = File::open(&parent) {
            let _ = dir.sync_all();
        }
        debug!("Committed batch directory {}", target.display());
        Ok(target)
    }

    fn cleanup(&self, tmp: &Path) {
        if let Err(e) = std::fs::remove_dir_all(tmp) {
            tracing::warn!("Failed to remove staging dir {}: {e}", tmp.display());
        }
    }
}

#[async_trait]
impl BatchSink for GzipCsvSink {
    async fn write_streaming(&self, batch: &TableBatch) -> MirrorResult<WrittenFile> {
        let tmp = self.stage_dir();
        let result = write_streaming_staged(&tmp, batch, self.streaming_level, self.emit_old_image);
        let (row_count, sha256) = match result {
            Ok(v) => v,
            Err(e) => {
                self.cleanup(&tmp);
                return Err(e);
            }
        };

        let ts = Utc::now();
        let directory = self.commit(&tmp, &batch.table, ts)?;
        Ok(WrittenFile {
            file_path: directory.join(STREAMING_FILE),
            directory,
            batch_timestamp: ts,
            row_count,
            sha256,
            has_ddl: !batch.ddl.is_empty(),
        })
    }

    async fn write_full_reload(
        &self,
        table: TableId,
        schema: TableSchema,
        mut rows: Receiver<ExportRow>,
    ) -> MirrorResult<WrittenFile> {
        let tmp = self.stage_dir();
        let path = tmp.join(FULL_RELOAD_FILE);
        let staged = async {
            std::fs::create_dir_all(&tmp).map_err(|e| MirrorError::io(&tmp, e))?;
            // Full reloads are written once and read many times; spend the
            // cycles on best compression.
            let mut writer = CsvGzWriter::create(&path, Compression::best())?;
            writer.write_record(schema.column_names().iter().map(String::as_str))?;

            let mut row_count = 0u64;
            while let Some(row) = rows.recv().await {
                writer.write_record(row.iter().map(|v| v.as_deref().unwrap_or("")))?;
                row_count += 1;
            }
            let sha256 = writer.finish()?;

            let mut described = schema.clone();
            described.row_count = row_count;
            let yaml = described
                .to_yaml()
                .map_err(|e| MirrorError::Fatal(format!("schema descriptor: {e}")))?;
            let schema_path = tmp.join(SCHEMA_FILE);
            std::fs::write(&schema_path, yaml).map_err(|e| MirrorError::io(&schema_path, e))?;
            Ok::<_, MirrorError>((row_count, sha256))
        }
        .await;

        let (row_count, sha256) = match staged {
            Ok(v) => v,
            Err(e) => {
                self.cleanup(&tmp);
                return Err(e);
            }
        };

        let ts = Utc::now();
        let directory = self.commit(&tmp, &table, ts)?;
        Ok(WrittenFile {
            file_path: directory.join(FULL_RELOAD_FILE),
            directory,
            batch_timestamp: ts,
            row_count,
            sha256,
            has_ddl: false,
        })
    }

    async fn write_ddl(&self, table: &TableId, events: &[DdlEvent]) -> MirrorResult<WrittenFile> {
        let tmp = self.stage_dir();
        let staged = (|| {
            std::fs::create_dir_all(&tmp).map_err(|e| MirrorError::io(&tmp, e))?;
            let path = tmp.join(DDL_FILE);
            std::fs::write(&path, render_ddl(events)).map_err(|e| MirrorError::io(&path, e))?;
            Ok::<_, MirrorError>(())
        })();
        if let Err(e) = staged {
            self.cleanup(&tmp);
            return Err(e);
        }

        let ts = Utc::now();
        let directory = self.commit(&tmp, table, ts)?;
        Ok(WrittenFile {
            file_path: directory.join(DDL_FILE),
            directory,
            batch_timestamp: ts,
            row_count: 0,
            sha256: String::new(),
            has_ddl: true,
        })
    }
}

fn write_streaming_staged(
    tmp: &Path,
    batch: &TableBatch,
    level: Compression,
    emit_old_image: bool,
) -> MirrorResult<(u64, String)> {
    std::fs::create_dir_all(tmp).map_err(|e| MirrorError::io(tmp, e))?;
    let path = tmp.join(STREAMING_FILE);
    let mut writer = CsvGzWriter::create(&path, level)?;

    let mut header: Vec<&str> = vec!["_op", "_lsn", "_commit_time"];
    header.extend(batch.columns.iter().map(String::as_str));
    writer.write_record(header.iter().copied())?;

    let mut row_count = 0u64;
    for change in &batch.changes {
        // Deletes carry the old image; everything else the new one.
        let image = match change.kind {
            ChangeKind::Delete => change.old_row.as_ref(),
            _ => change.new_row.as_ref(),
        };
        writer.write_change_row(change.kind.code(), change, image, &batch.columns)?;
        row_count += 1;

        if emit_old_image && change.kind == ChangeKind::Update {
            if let Some(old) = change.old_row.as_ref() {
                writer.write_change_row(OLD_IMAGE_OP, change, Some(old), &batch.columns)?;
            }
        }
    }
    let sha256 = writer.finish()?;

    if !batch.ddl.is_empty() {
        let ddl_path = tmp.join(DDL_FILE);
        std::fs::write(&ddl_path, render_ddl(&batch.ddl))
            .map_err(|e| MirrorError::io(&ddl_path, e))?;
    }
    Ok((row_count, sha256))
}

/// CSV writer stacked on gzip, hashing the compressed bytes as they pass
/// through so the content hash costs no second read.
struct CsvGzWriter {
    path: PathBuf,
    csv: csv::Writer<GzEncoder<HashingWriter<BufWriter<File>>>>,
}

impl CsvGzWriter {
    fn create(path: &Path, level: Compression) -> MirrorResult<Self> {
        let file = File::create(path).map_err(|e| MirrorError::io(path, e))?;
        let hashing = HashingWriter::new(BufWriter::new(file));
        let encoder = GzEncoder::new(hashing, level);
        Ok(Self {
            path: path.to_path_buf(),
            csv: csv::Writer::from_writer(encoder),
        })
    }

    fn write_record<'a>(&mut self, fields: impl Iterator<Item = &'a str>) -> MirrorResult<()> {
        self.csv
            .write_record(fields)
            .map_err(|e| MirrorError::io(&self.path, std::io::Error::other(e)))
    }

    fn write_change_row(
        &mut self,
        op: &str,
        change: &crate::model::Change,
        image: Option<&RowValues>,
        columns: &[String],
    ) -> MirrorResult<()> {
        let mut record: Vec<String> = Vec::with_capacity(columns.len() + 3);
        record.push(op.to_string());
        record.push(change.lsn.to_string());
        record.push(change.commit_time.to_rfc3339());
        for column in columns {
            let value = image
                .and_then(|row| row.iter().find(|(name, _)| name == column))
                .and_then(|(_, v)| v.clone())
                .unwrap_or_default();
            record.push(value);
        }
        self.write_record(record.iter().map(String::as_str))
    }

    /// Flush the whole stack, fsync, and return the content hash.
    fn finish(self) -> MirrorResult<String> {
        let path = self.path;
        let io = |e: std::io::Error| MirrorError::io(&path, e);
        let encoder = self
            .csv
            .into_inner()
            .map_err(|e| MirrorError::io(&path, std::io::Error::other(e)))?;
        let hashing = encoder.finish().map_err(io)?;
        let (buffered, sha256) = hashing.finalize();
        let file = buffered
            .into_inner()
            .map_err(|e| MirrorError::io(&path, e.into_error()))?;
        file.sync_all().map_err(io)?;
        Ok(sha256)
    }
}

struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    fn finalize(self) -> (W, String) {
        (self.inner, hex::encode(self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CompressionConfig;
    use crate::model::Change;
    use crate::output::hash_file;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    fn sink(dir: &TempDir) -> GzipCsvSink {
        GzipCsvSink::new(&OutputConfig {
            base_path: dir.path().to_path_buf(),
            compression: CompressionConfig::default(),
            timestamp_format: "%Y-%m-%dT%H-%M-%S".to_string(),
            emit_old_image: false,
        })
    }

    fn insert(lsn: &str, id: &str, name: Option<&str>) -> Change {
        Change {
            table: TableId::parse("public.users"),
            kind: ChangeKind::Insert,
            lsn: lsn.parse().unwrap(),
            commit_time: "2024-03-01T10:00:00Z".parse().unwrap(),
            new_row: Some(vec![
                ("id".into(), Some(id.to_string())),
                ("name".into(), name.map(String::from)),
            ]),
            old_row: None,
        }
    }

    fn read_csv_gz(path: &Path) -> Vec<Vec<String>> {
        let file = std::fs::File::open(path).unwrap();
        let mut reader = csv::ReaderBuilder::new()
            .has_headers(false)
            .from_reader(GzDecoder::new(file));
        reader
            .records()
            .map(|r| r.unwrap().iter().map(String::from).collect())
            .collect()
    }

    #[tokio::test]
    async fn test_streaming_batch_layout() {
        let dir = TempDir::new().unwrap();
        let batch = TableBatch {
            table: TableId::parse("public.users"),
            columns: vec!["id".into(), "name".into()],
            changes: vec![insert("0/10", "1", Some("Alice")), insert("0/20", "2", None)],
            ddl: Vec::new(),
            end_lsn: "0/20".parse().unwrap(),
        };
        let written = sink(&dir).write_streaming(&batch).await.unwrap();

        assert_eq!(written.row_count, 2);
        assert!(written.directory.starts_with(dir.path().join("public.users")));
        assert!(written.file_path.ends_with(STREAMING_FILE));
        assert!(!written.has_ddl);

        let rows = read_csv_gz(&written.file_path);
        assert_eq!(rows[0], vec!["_op", "_lsn", "_commit_time", "id", "name"]);
        assert_eq!(rows[1][0], "I");
        assert_eq!(rows[1][1], "0/10");
        assert_eq!(rows[1][3], "1");
        assert_eq!(rows[1][4], "Alice");
        // NULL renders as the empty field.
        assert_eq!(rows[2][4], "");

        // Content hash covers the compressed bytes.
        assert_eq!(hash_file(&written.file_path).unwrap(), written.sha256);

        // No staging directory survives.
        assert!(!std::fs::read_dir(dir.path())
            .unwrap()
            .any(|e| e.unwrap().file_name().to_string_lossy().starts_with(TMP_PREFIX)));
    }

    #[tokio::test]
    async fn test_delete_emits_old_image() {
        let dir = TempDir::new().unwrap();
        let delete = Change {
            table: TableId::parse("public.users"),
            kind: ChangeKind::Delete,
            lsn: "0/30".parse().unwrap(),
            commit_time: "2024-03-01T10:00:00Z".parse().unwrap(),
            new_row: None,
            old_row: Some(vec![("id".into(), Some("1".into()))]),
        };
        let batch = TableBatch {
            table: TableId::parse("public.users"),
            columns: vec!["id".into(), "name".into()],
            changes: vec![delete],
            ddl: Vec::new(),
            end_lsn: "0/30".parse().unwrap(),
        };
        let written = sink(&dir).write_streaming(&batch).await.unwrap();
        let rows = read_csv_gz(&written.file_path);
        assert_eq!(rows[1][0], "D");
        assert_eq!(rows[1][3], "1");
        // Identity subset: missing columns stay empty.
        assert_eq!(rows[1][4], "");
    }

    #[tokio::test]
    async fn test_ddl_sidecar() {
        let dir = TempDir::new().unwrap();
        let batch = TableBatch {
            table: TableId::parse("public.users"),
            columns: vec!["id".into()],
            changes: vec![insert("0/10", "1", None)],
            ddl: vec![DdlEvent {
                captured_at: "2024-03-01T10:00:00Z".parse().unwrap(),
                object_type: "table".into(),
                table: Some(TableId::parse("public.users")),
                command_text: "ALTER TABLE public.users ADD COLUMN x int".into(),
                tag: "ALTER TABLE".into(),
                lsn: "0/10".parse().unwrap(),
            }],
            end_lsn: "0/10".parse().unwrap(),
        };
        let written = sink(&dir).write_streaming(&batch).await.unwrap();
        assert!(written.has_ddl);
        let ddl = std::fs::read_to_string(written.directory.join(DDL_FILE)).unwrap();
        assert!(ddl.starts_with("# 2024-03-01T10:00:00+00:00 ALTER TABLE\n"));
        assert!(ddl.contains("ADD COLUMN x int"));
    }

    #[tokio::test]
    async fn test_full_reload_with_descriptor() {
        let dir = TempDir::new().unwrap();
        let schema = TableSchema {
            schema: "public".into(),
            table: "users".into(),
            columns: vec![
                crate::schema::ColumnInfo {
                    name: "id".into(),
                    data_type: "integer".into(),
                    nullable: false,
                    default: None,
                    length: None,
                    is_primary_key: true,
                },
                crate::schema::ColumnInfo {
                    name: "name".into(),
                    data_type: "text".into(),
                    nullable: true,
                    default: None,
                    length: None,
                    is_primary_key: false,
                },
            ],
            indexes: Vec::new(),
            constraints: Vec::new(),
            row_count: 0,
            exported_at: Utc::now(),
        };

        let (tx, rx) = tokio::sync::mpsc::channel(8);
        tx.send(vec![Some("1".to_string()), Some("Alice".to_string())])
            .await
            .unwrap();
        tx.send(vec![Some("2".to_string()), None]).await.unwrap();
        drop(tx);

        let written = sink(&dir)
            .write_full_reload(TableId::parse("public.users"), schema, rx)
            .await
            .unwrap();
        assert_eq!(written.row_count, 2);
        assert!(written.file_path.ends_with(FULL_RELOAD_FILE));

        let rows = read_csv_gz(&written.file_path);
        assert_eq!(rows[0], vec!["id", "name"]);
        assert_eq!(rows.len(), 3);

        let yaml = std::fs::read_to_string(written.directory.join(SCHEMA_FILE)).unwrap();
        let described: TableSchema = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(described.row_count, 2);
    }

    #[tokio::test]
    async fn test_timestamp_collision_gets_suffix() {
        let dir = TempDir::new().unwrap();
        let mut config = OutputConfig {
            base_path: dir.path().to_path_buf(),
            compression: CompressionConfig::default(),
            timestamp_format: "%Y-%m-%dT%H-%M-%S".to_string(),
            emit_old_image: false,
        };
        // Freeze the directory name so both writes collide.
        config.timestamp_format = "constant".to_string();
        let sink = GzipCsvSink::new(&config);

        let batch = TableBatch {
            table: TableId::parse("public.users"),
            columns: vec!["id".into()],
            changes: vec![insert("0/10", "1", None)],
            ddl: Vec::new(),
            end_lsn: "0/10".parse().unwrap(),
        };
        let first = sink.write_streaming(&batch).await.unwrap();
        let second = sink.write_streaming(&batch).await.unwrap();
        assert!(first.directory.ends_with("constant"));
        assert!(second.directory.ends_with("constant-2"));
    }
}
