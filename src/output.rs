//! Batch file output.
//!
//! A `BatchSink` materializes batch directories on the file store. The
//! shipped implementation writes RFC 4180 CSV through gzip; the trait keeps
//! the door open for other row formats and codecs.
//!
//! Atomicity: everything is written into a sibling `.tmp-<uuid>` directory,
//! synced, then renamed to the canonical batch directory. The rename is the
//! commit point; registration happens only after it succeeds, and recovery
//! sweeps any `.tmp-*` leftovers.

pub mod csv;

use std::io::Read;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc::Receiver;

use crate::buffer::TableBatch;
use crate::error::{MirrorError, MirrorResult};
use crate::model::{DdlEvent, TableId};
use crate::schema::TableSchema;

pub use csv::GzipCsvSink;

/// File names inside a batch directory.
pub const STREAMING_FILE: &str = "streaming.csv.gz";
pub const FULL_RELOAD_FILE: &str = "full_reload.csv.gz";
pub const SCHEMA_FILE: &str = "schema.yml";
pub const DDL_FILE: &str = "ddl.txt";

/// Prefix of staging directories; anything matching is fair game for the
/// recovery sweep.
pub const TMP_PREFIX: &str = ".tmp-";

/// A committed batch directory, ready for registration.
#[derive(Debug, Clone)]
pub struct WrittenFile {
    /// The canonical batch directory.
    pub directory: PathBuf,
    /// The data file inside it (or the ddl file for DDL-only batches).
    pub file_path: PathBuf,
    pub batch_timestamp: DateTime<Utc>,
    pub row_count: u64,
    /// Hex SHA-256 of the compressed data file; empty for DDL-only batches.
    pub sha256: String,
    pub has_ddl: bool,
}

/// One row of a full reload export, in schema column order.
pub type ExportRow = Vec<Option<String>>;

/// Capability set of a batch writer.
#[async_trait]
pub trait BatchSink: Send + Sync {
    /// Write a streaming batch (and its DDL sidecar, when present).
    async fn write_streaming(&self, batch: &TableBatch) -> MirrorResult<WrittenFile>;

    /// Write a full reload: the table snapshot plus its schema descriptor.
    /// Rows arrive in export order; the writer counts them and stamps the
    /// count into the descriptor. Owned arguments so the write can run as
    /// its own task, decoupled from the producer's cancellation.
    async fn write_full_reload(
        &self,
        table: TableId,
        schema: TableSchema,
        rows: Receiver<ExportRow>,
    ) -> MirrorResult<WrittenFile>;

    /// Write a DDL-only batch directory.
    async fn write_ddl(&self, table: &TableId, events: &[DdlEvent]) -> MirrorResult<WrittenFile>;
}

/// Recompute the SHA-256 of a file, for recovery integrity checks.
pub fn hash_file(path: &Path) -> MirrorResult<String> {
    let mut file = std::fs::File::open(path).map_err(|e| MirrorError::io(path, e))?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).map_err(|e| MirrorError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Render the `ddl.txt` payload: one block per event, preceded by a comment
/// line with its captured timestamp and command tag.
pub fn render_ddl(events: &[DdlEvent]) -> String {
    let mut out = String::new();
    for event in events {
        out.push_str(&format!(
            "# {} {}\n{}\n\n",
            event.captured_at.to_rfc3339(),
            event.tag,
            event.command_text
        ));
    }
    out
}
