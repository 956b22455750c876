//! Core data model: tables, row changes, DDL events, reload markers, and the
//! typed WAL messages produced by the replication decoder.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::MirrorError;
use crate::lsn::Lsn;

/// Case-sensitive `(schema, name)` pair identifying a table.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableId {
    pub schema: String,
    pub name: String,
}

impl TableId {
    pub fn new(schema: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
            name: name.into(),
        }
    }

    /// Parse `schema.table`; a bare name defaults to the `public` schema.
    pub fn parse(s: &str) -> Self {
        match s.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new("public", s),
        }
    }

    /// Quoted form usable in SQL statements.
    pub fn qualified(&self) -> String {
        format!("\"{}\".\"{}\"", self.schema, self.name)
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Row operation kind. `Truncate` rows carry no column data and render as
/// `_op = T` in the streaming CSV.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
    Truncate,
}

impl ChangeKind {
    /// Single-letter code used in the `_op` CSV metadata column.
    pub fn code(self) -> &'static str {
        match self {
            ChangeKind::Insert => "I",
            ChangeKind::Update => "U",
            ChangeKind::Delete => "D",
            ChangeKind::Truncate => "T",
        }
    }
}

/// Ordered column name → textual value pairs; `None` is SQL NULL.
pub type RowValues = Vec<(String, Option<String>)>;

/// One row-level event. `lsn` is the commit LSN of the enclosing
/// transaction, stamped by the decoder when the Commit record arrives, so
/// LSNs are non-decreasing across the slot's emission order.
#[derive(Debug, Clone)]
pub struct Change {
    pub table: TableId,
    pub kind: ChangeKind,
    pub lsn: Lsn,
    pub commit_time: DateTime<Utc>,
    /// New image for Insert/Update.
    pub new_row: Option<RowValues>,
    /// Old image for Delete, and for Update when the replica identity
    /// provides one.
    pub old_row: Option<RowValues>,
}

impl Change {
    /// The image that defines this change's column set: the new image when
    /// present, otherwise the old (delete) image.
    pub fn row(&self) -> Option<&RowValues> {
        self.new_row.as_ref().or(self.old_row.as_ref())
    }

    /// Look up a column's value in the effective image.
    pub fn value(&self, column: &str) -> Option<&str> {
        self.row()
            .and_then(|row| row.iter().find(|(name, _)| name == column))
            .and_then(|(_, v)| v.as_deref())
    }

    /// Column names of the effective image, in emission order.
    pub fn column_names(&self) -> Vec<String> {
        self.row()
            .map(|row| row.iter().map(|(name, _)| name.clone()).collect())
            .unwrap_or_default()
    }
}

/// Column set for a table, pinned by the most recent schema observation.
/// Synthesized by the decoder whenever a table's column set first appears or
/// drifts, and used by the batch pipeline to split batches so no CSV mixes
/// column sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationColumns {
    pub table: TableId,
    pub columns: Vec<String>,
}

/// Typed WAL messages in commit order. Row messages are retained in a
/// transaction scratchpad by the decoder and released atomically when the
/// enclosing Commit is decoded.
#[derive(Debug, Clone)]
pub enum Message {
    Begin {
        timestamp: Option<DateTime<Utc>>,
    },
    Commit {
        end_lsn: Lsn,
        timestamp: Option<DateTime<Utc>>,
    },
    Relation(RelationColumns),
    Insert(Change),
    Update(Change),
    Delete(Change),
    Truncate {
        tables: Vec<TableId>,
        lsn: Lsn,
    },
}

/// DDL captured by the event trigger as an insert on the `ddl_history`
/// table and surfaced through the replication stream.
#[derive(Debug, Clone)]
pub struct DdlEvent {
    pub captured_at: DateTime<Utc>,
    pub object_type: String,
    /// The affected table when identifiable; None routes the event to the
    /// global DDL bucket.
    pub table: Option<TableId>,
    pub command_text: String,
    pub tag: String,
    /// Commit LSN of the capturing insert.
    pub lsn: Lsn,
}

impl DdlEvent {
    /// Interpret an insert on the DDL history table as a captured DDL event.
    /// Returns None when the insert does not carry the expected columns.
    pub fn from_change(change: &Change) -> Option<DdlEvent> {
        let command_text = change.value("command_text")?.to_string();
        let tag = change.value("tag").unwrap_or_default().to_string();
        let object_type = change.value("object_type").unwrap_or_default().to_string();
        let captured_at = change
            .value("captured_at")
            .and_then(parse_pg_timestamp)
            .unwrap_or(change.commit_time);
        let table = change
            .value("object_identity")
            .filter(|s| !s.is_empty())
            .map(TableId::parse);
        Some(DdlEvent {
            captured_at,
            object_type,
            table,
            command_text,
            tag,
            lsn: change.lsn,
        })
    }
}

/// Parse PostgreSQL's textual timestamp with offset, e.g.
/// `2024-03-01 12:30:45.123456+00`.
pub fn parse_pg_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f%#z")
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Marker action embedded in a reload comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MarkerAction {
    #[serde(rename = "EXPORT_START")]
    ExportStart,
    #[serde(rename = "EXPORT_END")]
    ExportEnd,
}

/// In-band reload synchronization marker, carried as the body of a
/// `COMMENT ON TABLE` statement: the configured prefix followed by a JSON
/// payload. The marker's WAL position is the sole synchronization primitive
/// between streaming and reload exports.
#[derive(Debug, Clone)]
pub struct ReloadMarker {
    pub action: MarkerAction,
    pub export_id: Uuid,
    pub table: TableId,
    pub timestamp: DateTime<Utc>,
    pub rows_exported: Option<u64>,
    /// Exported snapshot id on START markers; the export worker imports it
    /// so the reload sees the state at the marker, not at worker start.
    pub snapshot_id: Option<String>,
    /// LSN at which the comment appears in the WAL.
    pub lsn: Lsn,
}

#[derive(Debug, Deserialize)]
struct MarkerPayload {
    action: MarkerAction,
    export_id: Uuid,
    table: String,
    timestamp: DateTime<Utc>,
    #[serde(default)]
    rows_exported: Option<u64>,
    #[serde(default)]
    snapshot_id: Option<String>,
}

impl ReloadMarker {
    /// Scan a captured DDL command for a reload marker.
    ///
    /// Returns `Ok(None)` when the command is not a marker at all (not a
    /// COMMENT, or the body lacks the prefix), and `MarkerMalformed` when the
    /// prefix matches but the payload cannot be used.
    pub fn parse(command_text: &str, prefix: &str, lsn: Lsn) -> Result<Option<Self>, MirrorError> {
        let trimmed = command_text.trim_start();
        if !trimmed
            .get(..16)
            .is_some_and(|head| head.eq_ignore_ascii_case("comment on table"))
        {
            return Ok(None);
        }
        let Some(body) = comment_body(trimmed) else {
            return Ok(None);
        };
        let Some(payload) = body.strip_prefix(prefix) else {
            return Ok(None);
        };
        let payload: MarkerPayload = serde_json::from_str(payload)
            .map_err(|e| MirrorError::MarkerMalformed(format!("bad payload: {e}")))?;
        Ok(Some(ReloadMarker {
            action: payload.action,
            export_id: payload.export_id,
            table: TableId::parse(&payload.table),
            timestamp: payload.timestamp,
            rows_exported: payload.rows_exported,
            snapshot_id: payload.snapshot_id,
            lsn,
        }))
    }

    /// Render the marker as the COMMENT statement that plants it in the WAL.
    pub fn to_sql(&self, prefix: &str) -> String {
        let payload = serde_json::json!({
            "action": self.action,
            "export_id": self.export_id,
            "table": self.table.to_string(),
            "timestamp": self.timestamp.to_rfc3339(),
            "rows_exported": self.rows_exported,
            "snapshot_id": self.snapshot_id,
        });
        // Single quotes inside string literals double up.
        let body = format!("{prefix}{payload}").replace('\'', "''");
        format!("COMMENT ON TABLE {} IS '{}'", self.table.qualified(), body)
    }
}

/// Extract the single-quoted literal from a COMMENT statement, undoing the
/// `''` escape.
fn comment_body(command: &str) -> Option<String> {
    let start = command.find('\'')?;
    let end = command.rfind('\'')?;
    if end <= start {
        return None;
    }
    Some(command[start + 1..end].replace("''", "'"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn marker_sql(action: &str, export_id: &str) -> String {
        format!(
            "COMMENT ON TABLE \"public\".\"users\" IS 'MIRROR::{{\"action\":\"{action}\",\
             \"export_id\":\"{export_id}\",\"table\":\"public.users\",\
             \"timestamp\":\"2024-03-01T10:00:00Z\",\"rows_exported\":null}}'"
        )
    }

    #[test]
    fn test_parse_start_marker() {
        let sql = marker_sql("EXPORT_START", "1c56e5a2-0cc5-4ad2-8538-1bd655b1b60e");
        let lsn: Lsn = "0/1000".parse().unwrap();
        let marker = ReloadMarker::parse(&sql, "MIRROR::", lsn).unwrap().unwrap();
        assert_eq!(marker.action, MarkerAction::ExportStart);
        assert_eq!(marker.table, TableId::new("public", "users"));
        assert_eq!(marker.lsn, lsn);
        assert_eq!(marker.rows_exported, None);
    }

    #[test]
    fn test_parse_ignores_foreign_comments() {
        let sql = "COMMENT ON TABLE public.users IS 'ordinary documentation'";
        assert!(ReloadMarker::parse(sql, "MIRROR::", Lsn::ZERO)
            .unwrap()
            .is_none());
        let sql = "CREATE TABLE public.users (id int)";
        assert!(ReloadMarker::parse(sql, "MIRROR::", Lsn::ZERO)
            .unwrap()
            .is_none());
    }

    #[test]
    fn test_parse_malformed_payload_is_an_error() {
        let sql = "COMMENT ON TABLE public.users IS 'MIRROR::{not json'";
        let err = ReloadMarker::parse(sql, "MIRROR::", Lsn::ZERO).unwrap_err();
        assert!(matches!(err, MirrorError::MarkerMalformed(_)));
    }

    #[test]
    fn test_marker_sql_round_trip() {
        let marker = ReloadMarker {
            action: MarkerAction::ExportEnd,
            export_id: Uuid::new_v4(),
            table: TableId::new("public", "orders"),
            timestamp: Utc::now(),
            rows_exported: Some(42),
            snapshot_id: Some("00000003-000001A3-1".to_string()),
            lsn: Lsn::ZERO,
        };
        let sql = marker.to_sql("MIRROR::");
        let parsed = ReloadMarker::parse(&sql, "MIRROR::", "0/5".parse().unwrap())
            .unwrap()
            .unwrap();
        assert_eq!(parsed.action, MarkerAction::ExportEnd);
        assert_eq!(parsed.export_id, marker.export_id);
        assert_eq!(parsed.table, marker.table);
        assert_eq!(parsed.rows_exported, Some(42));
        assert_eq!(parsed.snapshot_id.as_deref(), Some("00000003-000001A3-1"));
    }

    #[test]
    fn test_marker_without_snapshot_id_still_parses() {
        let sql = marker_sql("EXPORT_START", "1c56e5a2-0cc5-4ad2-8538-1bd655b1b60e");
        let marker = ReloadMarker::parse(&sql, "MIRROR::", Lsn::ZERO)
            .unwrap()
            .unwrap();
        assert_eq!(marker.snapshot_id, None);
    }

    #[test]
    fn test_ddl_event_from_change() {
        let change = Change {
            table: TableId::new("public", "ddl_history"),
            kind: ChangeKind::Insert,
            lsn: "0/10".parse().unwrap(),
            commit_time: Utc::now(),
            new_row: Some(vec![
                ("id".into(), Some("7".into())),
                ("captured_at".into(), Some("2024-03-01 12:30:45.1+00".into())),
                ("object_type".into(), Some("table".into())),
                ("object_identity".into(), Some("public.users".into())),
                ("command_text".into(), Some("ALTER TABLE ...".into())),
                ("tag".into(), Some("ALTER TABLE".into())),
            ]),
            old_row: None,
        };
        let evt = DdlEvent::from_change(&change).unwrap();
        assert_eq!(evt.tag, "ALTER TABLE");
        assert_eq!(evt.table, Some(TableId::new("public", "users")));
        assert_eq!(evt.captured_at.timestamp(), 1709296245);
    }

    #[test]
    fn test_table_id_parse() {
        assert_eq!(TableId::parse("sales.orders"), TableId::new("sales", "orders"));
        assert_eq!(TableId::parse("orders"), TableId::new("public", "orders"));
        assert_eq!(TableId::new("public", "users").to_string(), "public.users");
    }
}
