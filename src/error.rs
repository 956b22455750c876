//! Error kinds for the egress pipeline.
//!
//! Library modules return `MirrorError`; binaries and orchestration code wrap
//! it in `anyhow::Result` with context. The variants map one-to-one onto the
//! recovery policies: `Transport` reconnects, `Decode` and `Fatal` terminate
//! the process, registry conflicts trigger the skip-or-retry path.

use std::path::PathBuf;

/// Result alias used throughout the pipeline modules.
pub type MirrorResult<T> = std::result::Result<T, MirrorError>;

#[derive(Debug, thiserror::Error)]
pub enum MirrorError {
    /// Source connection lost or query failed at the transport level.
    #[error("transport error: {0}")]
    Transport(#[from] tokio_postgres::Error),

    /// Malformed WAL content; fatal for the affected message stream.
    #[error("failed to decode WAL message: {0}")]
    Decode(String),

    /// The replication slot does not exist and the process is not in
    /// fresh-init mode.
    #[error("replication slot '{0}' does not exist")]
    SlotMissing(String),

    /// Another process currently holds the replication slot.
    #[error("replication slot '{0}' is active in another process")]
    SlotInUse(String),

    /// Registry uniqueness or state conflict (prior partial work).
    #[error("registry conflict: {0}")]
    RegistryConflict(String),

    /// A registration would move a table's end_lsn backwards.
    #[error("non-monotonic lsn for {table}: {attempted} is not past {last}")]
    NonMonotonicLsn {
        table: String,
        attempted: String,
        last: String,
    },

    /// A second reload was requested while one is already Active.
    #[error("reload already active for table {0}")]
    ReloadAlreadyActive(String),

    /// Filesystem failure while producing a batch directory.
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The export snapshot could not be established or imported.
    #[error("snapshot unavailable: {0}")]
    SnapshotUnavailable(String),

    /// A reload marker matched the prefix but its payload is unusable.
    /// Logged and ignored; never changes coordinator state.
    #[error("malformed reload marker: {0}")]
    MarkerMalformed(String),

    /// A bounded operation exceeded its deadline.
    #[error("timed out: {0}")]
    Timeout(String),

    /// Invariant violation. The process exits so the supervisor restarts it
    /// into recovery.
    #[error("invariant violation: {0}")]
    Fatal(String),
}

impl MirrorError {
    /// Helper for wrapping filesystem errors with the offending path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        MirrorError::Io {
            path: path.into(),
            source,
        }
    }

    /// Process exit code for unrecoverable errors, per the process surface
    /// contract: 0 clean, 1 init failure, 2 slot conflict, 3 fatal I/O or
    /// invariant violation.
    pub fn exit_code(&self) -> i32 {
        match self {
            MirrorError::SlotMissing(_) | MirrorError::SlotInUse(_) => 2,
            MirrorError::Io { .. } | MirrorError::Fatal(_) | MirrorError::Decode(_) => 3,
            _ => 1,
        }
    }
}
