//! data-mirror: CDC egress from a PostgreSQL source to compressed per-table
//! CSV batches on a file store.
//!
//! The pipeline tails a logical replication slot (wal2json), buffers row
//! changes per table, and flushes bounded micro-batches as gzip CSV batch
//! directories. Full-table reloads are coordinated through in-WAL markers,
//! and a registry schema on the source database indexes every produced file
//! by LSN so a downstream consumer can read them in order.

pub mod batch;
pub mod buffer;
pub mod config;
pub mod connect;
pub mod error;
pub mod export;
pub mod lsn;
pub mod model;
pub mod output;
pub mod recovery;
pub mod registry;
pub mod reload;
pub mod replication;
pub mod schema;
pub mod service;

pub use config::Config;
pub use error::{MirrorError, MirrorResult};
pub use lsn::Lsn;
pub use model::{Change, ChangeKind, Message, ReloadMarker, TableId};
pub use registry::{FileRecord, FileType, Registry, TableMode};
