//! Decoding of wal2json format-version 2 output into typed WAL messages.
//!
//! Each row returned by the slot peek carries its own LSN and one JSON
//! document with an `action` discriminator (`B`, `C`, `I`, `U`, `D`, `T`,
//! `M`). Row actions between a Begin and its Commit are held in a
//! transaction scratchpad and released as one atomic message sequence when
//! the Commit arrives; every released Change is stamped with the commit's
//! LSN and timestamp so positions are non-decreasing per slot.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::MirrorError;
use crate::lsn::Lsn;
use crate::model::{parse_pg_timestamp, Change, ChangeKind, Message, RelationColumns, RowValues, TableId};

/// Streaming decoder with per-slot relation tracking.
#[derive(Default)]
pub struct Decoder {
    /// Column set pinned per table by the latest observed new image.
    relations: HashMap<TableId, Vec<String>>,
    /// Row changes of the in-flight transaction.
    scratchpad: Vec<Change>,
    /// Tables truncated inside the in-flight transaction.
    truncated: Vec<TableId>,
    begin_time: Option<DateTime<Utc>>,
}

impl Decoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one `(lsn, data)` row from the slot. Returns the complete
    /// message sequence of a transaction when `data` is its Commit record,
    /// and an empty vec otherwise.
    pub fn push_line(&mut self, lsn: Lsn, data: &str) -> Result<Vec<Message>, MirrorError> {
        let value: Value = serde_json::from_str(data)
            .map_err(|e| MirrorError::Decode(format!("wal2json line is not valid JSON: {e}")))?;
        let action = value
            .get("action")
            .and_then(Value::as_str)
            .ok_or_else(|| MirrorError::Decode("wal2json line missing 'action'".to_string()))?;

        match action {
            "B" => {
                self.reset_txn();
                self.begin_time = value
                    .get("timestamp")
                    .and_then(Value::as_str)
                    .and_then(parse_pg_timestamp);
                Ok(Vec::new())
            }
            "I" | "U" | "D" => {
                let change = self.decode_row(action, &value)?;
                self.scratchpad.push(change);
                Ok(Vec::new())
            }
            "T" => {
                self.truncated.push(table_of(&value)?);
                Ok(Vec::new())
            }
            "C" => Ok(self.commit(lsn, &value)),
            // Logical decoding messages and anything newer pass through
            // undecoded.
            _ => Ok(Vec::new()),
        }
    }

    /// Drop any incomplete transaction. Called at the end of a poll window;
    /// the next peek re-delivers the partial transaction from the start.
    pub fn reset_txn(&mut self) {
        self.scratchpad.clear();
        self.truncated.clear();
        self.begin_time = None;
    }

    /// Current pinned column set for a table, if any image has been seen.
    pub fn relation(&self, table: &TableId) -> Option<&Vec<String>> {
        self.relations.get(table)
    }

    fn commit(&mut self, commit_lsn: Lsn, value: &Value) -> Vec<Message> {
        let commit_time = value
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_pg_timestamp)
            .or(self.begin_time)
            .unwrap_or_else(Utc::now);

        let mut out = Vec::with_capacity(self.scratchpad.len() + 2);
        out.push(Message::Begin {
            timestamp: self.begin_time,
        });

        for mut change in std::mem::take(&mut self.scratchpad) {
            change.lsn = commit_lsn;
            change.commit_time = commit_time;

            // Pin column order from new images; a drifted set becomes a
            // Relation message so downstream batches split cleanly.
            if let Some(new_row) = &change.new_row {
                let columns: Vec<String> = new_row.iter().map(|(n, _)| n.clone()).collect();
                if self.relations.get(&change.table) != Some(&columns) {
                    self.relations.insert(change.table.clone(), columns.clone());
                    out.push(Message::Relation(RelationColumns {
                        table: change.table.clone(),
                        columns,
                    }));
                }
            }

            out.push(match change.kind {
                ChangeKind::Insert => Message::Insert(change),
                ChangeKind::Update => Message::Update(change),
                ChangeKind::Delete => Message::Delete(change),
                ChangeKind::Truncate => unreachable!("truncate is not a row change"),
            });
        }

        if !self.truncated.is_empty() {
            out.push(Message::Truncate {
                tables: std::mem::take(&mut self.truncated),
                lsn: commit_lsn,
            });
        }

        out.push(Message::Commit {
            end_lsn: commit_lsn,
            timestamp: Some(commit_time),
        });
        self.begin_time = None;
        out
    }

    fn decode_row(&self, action: &str, value: &Value) -> Result<Change, MirrorError> {
        let table = table_of(value)?;
        let kind = match action {
            "I" => ChangeKind::Insert,
            "U" => ChangeKind::Update,
            _ => ChangeKind::Delete,
        };

        let new_row = match kind {
            ChangeKind::Insert | ChangeKind::Update => {
                Some(decode_columns(value.get("columns"), &table)?)
            }
            _ => None,
        };
        // wal2json puts the old image under "identity"; for deletes some
        // configurations use "columns" instead.
        let old_row = match kind {
            ChangeKind::Update | ChangeKind::Delete => {
                let raw = value.get("identity").or_else(|| {
                    if kind == ChangeKind::Delete {
                        value.get("columns")
                    } else {
                        None
                    }
                });
                match raw {
                    Some(_) => Some(decode_columns(raw, &table)?),
                    None => None,
                }
            }
            _ => None,
        };

        if kind == ChangeKind::Delete && old_row.is_none() {
            return Err(MirrorError::Decode(format!(
                "delete on {table} carries no identity; replica identity required"
            )));
        }

        Ok(Change {
            table,
            kind,
            // Stamped at commit.
            lsn: Lsn::ZERO,
            commit_time: Utc::now(),
            new_row,
            old_row,
        })
    }
}

fn table_of(value: &Value) -> Result<TableId, MirrorError> {
    let schema = value
        .get("schema")
        .and_then(Value::as_str)
        .unwrap_or("public");
    let table = value
        .get("table")
        .and_then(Value::as_str)
        .ok_or_else(|| MirrorError::Decode("row action missing 'table'".to_string()))?;
    Ok(TableId::new(schema, table))
}

fn decode_columns(raw: Option<&Value>, table: &TableId) -> Result<RowValues, MirrorError> {
    let array = raw
        .and_then(Value::as_array)
        .ok_or_else(|| MirrorError::Decode(format!("row action on {table} missing columns")))?;
    let mut row = Vec::with_capacity(array.len());
    for col in array {
        let name = col
            .get("name")
            .and_then(Value::as_str)
            .ok_or_else(|| MirrorError::Decode(format!("column on {table} missing 'name'")))?;
        row.push((name.to_string(), render_value(col.get("value"))));
    }
    Ok(row)
}

/// Render a wal2json column value to its CSV text form. NULL maps to None.
fn render_value(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::Null => None,
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}
