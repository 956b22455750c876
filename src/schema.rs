//! Source catalog introspection and the full-reload schema descriptor.
//!
//! `TableSchema` is serialized to `schema.yml` next to full reload files.
//! Field order is fixed by declaration order so the descriptor is
//! byte-stable for identical inputs.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_postgres::GenericClient;

use crate::config::TableFilterConfig;
use crate::model::TableId;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnInfo {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    pub default: Option<String>,
    pub length: Option<i32>,
    pub is_primary_key: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexInfo {
    pub name: String,
    pub definition: String,
    pub unique: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstraintInfo {
    pub name: String,
    pub kind: String,
    pub definition: String,
}

/// Descriptor of one table at export time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableSchema {
    pub schema: String,
    pub table: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
    pub constraints: Vec<ConstraintInfo>,
    pub row_count: u64,
    pub exported_at: DateTime<Utc>,
}

impl TableSchema {
    /// Build the descriptor from the source catalog. Run inside the export
    /// transaction so columns match the exported snapshot.
    pub async fn introspect<C: GenericClient>(client: &C, table: &TableId) -> Result<Self> {
        let pk_columns = primary_key_columns(client, table).await?;

        let rows = client
            .query(
                "SELECT column_name, data_type, is_nullable, column_default, \
                        character_maximum_length \
                 FROM information_schema.columns \
                 WHERE table_schema = $1 AND table_name = $2 \
                 ORDER BY ordinal_position",
                &[&table.schema, &table.name],
            )
            .await
            .with_context(|| format!("Failed to read columns for {table}"))?;

        let columns = rows
            .iter()
            .map(|row| {
                let name: String = row.get(0);
                let is_primary_key = pk_columns.contains(&name);
                ColumnInfo {
                    name,
                    data_type: row.get(1),
                    nullable: row.get::<_, String>(2) == "YES",
                    default: row.get(3),
                    length: row.get(4),
                    is_primary_key,
                }
            })
            .collect();

        let rows = client
            .query(
                "SELECT i.relname, pg_get_indexdef(ix.indexrelid), ix.indisunique \
                 FROM pg_index ix \
                 JOIN pg_class i ON i.oid = ix.indexrelid \
                 JOIN pg_class t ON t.oid = ix.indrelid \
                 JOIN pg_namespace n ON n.oid = t.relnamespace \
                 WHERE n.nspname = $1 AND t.relname = $2 \
                 ORDER BY i.relname",
                &[&table.schema, &table.name],
            )
            .await
            .with_context(|| format!("Failed to read indexes for {table}"))?;
        let indexes = rows
            .iter()
            .map(|row| IndexInfo {
                name: row.get(0),
                definition: row.get(1),
                unique: row.get(2),
            })
            .collect();

        let rows = client
            .query(
                "SELECT conname, contype::text, pg_get_constraintdef(oid) \
                 FROM pg_constraint \
                 WHERE conrelid = to_regclass($1) \
                 ORDER BY conname",
                &[&format!("{}.{}", table.schema, table.name)],
            )
            .await
            .with_context(|| format!("Failed to read constraints for {table}"))?;
        let constraints = rows
            .iter()
            .map(|row| ConstraintInfo {
                name: row.get(0),
                kind: constraint_kind(&row.get::<_, String>(1)),
                definition: row.get(2),
            })
            .collect();

        Ok(TableSchema {
            schema: table.schema.clone(),
            table: table.name.clone(),
            columns,
            indexes,
            constraints,
            row_count: 0,
            exported_at: Utc::now(),
        })
    }

    /// Column names in catalog order; the header of a full reload CSV.
    pub fn column_names(&self) -> Vec<String> {
        self.columns.iter().map(|c| c.name.clone()).collect()
    }

    pub fn to_yaml(&self) -> Result<String> {
        serde_yaml::to_string(self).context("Failed to serialize table schema")
    }
}

fn constraint_kind(contype: &str) -> String {
    match contype {
        "p" => "primary_key",
        "f" => "foreign_key",
        "u" => "unique",
        "c" => "check",
        "x" => "exclusion",
        other => other,
    }
    .to_string()
}

/// Get primary key columns for a table.
pub async fn primary_key_columns<C: GenericClient>(
    client: &C,
    table: &TableId,
) -> Result<Vec<String>> {
    let rows = client
        .query(
            "SELECT a.attname \
             FROM pg_index i \
             JOIN pg_attribute a ON a.attrelid = i.indrelid AND a.attnum = ANY(i.indkey) \
             WHERE i.indrelid = to_regclass($1) AND i.indisprimary \
             ORDER BY array_position(i.indkey, a.attnum)",
            &[&format!("{}.{}", table.schema, table.name)],
        )
        .await
        .with_context(|| format!("Failed to read primary key for {table}"))?;
    Ok(rows.iter().map(|row| row.get(0)).collect())
}

/// Enumerate target tables per the include/exclude schema filters and the
/// primary-key requirement. The registry schema and the DDL history table
/// are never targets.
pub async fn discover_tables<C: GenericClient>(
    client: &C,
    filter: &TableFilterConfig,
    registry_schema: &str,
    ddl_history: &TableId,
) -> Result<Vec<TableId>> {
    let rows = client
        .query(
            "SELECT table_schema, table_name FROM information_schema.tables \
             WHERE table_type = 'BASE TABLE' \
               AND table_schema = ANY($1) \
               AND NOT (table_schema = ANY($2)) \
             ORDER BY table_schema, table_name",
            &[&filter.include_schemas, &filter.exclude_schemas],
        )
        .await
        .context("Failed to enumerate candidate tables")?;

    let mut tables = Vec::new();
    for row in rows {
        let table = TableId::new(row.get::<_, String>(0), row.get::<_, String>(1));
        if table.schema == registry_schema || table == *ddl_history {
            continue;
        }
        if filter.require_primary_key && primary_key_columns(client, &table).await?.is_empty() {
            tracing::warn!("Skipping {table}: no primary key");
            continue;
        }
        tables.push(table);
    }
    Ok(tables)
}

/// Current size estimate used for smallest-first export scheduling.
pub async fn table_size_estimate<C: GenericClient>(client: &C, table: &TableId) -> Result<i64> {
    let row = client
        .query_one(
            "SELECT pg_total_relation_size(to_regclass($1))",
            &[&format!("{}.{}", table.schema, table.name)],
        )
        .await
        .with_context(|| format!("Failed to read size of {table}"))?;
    Ok(row.get::<_, Option<i64>>(0).unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_schema() -> TableSchema {
        TableSchema {
            schema: "public".into(),
            table: "users".into(),
            columns: vec![
                ColumnInfo {
                    name: "id".into(),
                    data_type: "integer".into(),
                    nullable: false,
                    default: Some("nextval('users_id_seq')".into()),
                    length: None,
                    is_primary_key: true,
                },
                ColumnInfo {
                    name: "email".into(),
                    data_type: "character varying".into(),
                    nullable: true,
                    default: None,
                    length: Some(255),
                    is_primary_key: false,
                },
            ],
            indexes: vec![IndexInfo {
                name: "users_pkey".into(),
                definition: "CREATE UNIQUE INDEX users_pkey ON public.users USING btree (id)"
                    .into(),
                unique: true,
            }],
            constraints: vec![ConstraintInfo {
                name: "users_pkey".into(),
                kind: "primary_key".into(),
                definition: "PRIMARY KEY (id)".into(),
            }],
            row_count: 3,
            exported_at: "2024-03-01T10:00:00Z".parse().unwrap(),
        }
    }

    #[test]
    fn test_yaml_descriptor_is_stable() {
        let schema = sample_schema();
        let a = schema.to_yaml().unwrap();
        let b = schema.to_yaml().unwrap();
        assert_eq!(a, b);
        // Declaration order is the serialization order.
        let table_pos = a.find("table: users").unwrap();
        let columns_pos = a.find("columns:").unwrap();
        let row_count_pos = a.find("row_count: 3").unwrap();
        assert!(table_pos < columns_pos);
        assert!(columns_pos < row_count_pos);
    }

    #[test]
    fn test_yaml_round_trip() {
        let schema = sample_schema();
        let yaml = schema.to_yaml().unwrap();
        let back: TableSchema = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back.columns, schema.columns);
        assert_eq!(back.row_count, 3);
        assert_eq!(back.column_names(), vec!["id", "email"]);
    }

    #[test]
    fn test_constraint_kind_names() {
        assert_eq!(constraint_kind("p"), "primary_key");
        assert_eq!(constraint_kind("f"), "foreign_key");
        assert_eq!(constraint_kind("z"), "z");
    }
}
