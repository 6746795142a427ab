//! Schema drift detection
//!
//! Compares the snapshot being installed with the one it replaces so that
//! reloads surface added, removed and altered tables and columns.

use crate::introspection::{ColumnDescriptor, SchemaSnapshot, TableDescriptor};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

/// Drift detection result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftReport {
    pub detected_at: DateTime<Utc>,
    pub has_drift: bool,
    pub from_version: u64,
    pub to_version: u64,
    pub old_checksum: String,
    pub new_checksum: String,
    pub changes: Vec<DriftChange>,
}

/// Individual drift change
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftChange {
    pub change_type: DriftChangeType,
    pub object_type: ObjectType,
    /// e.g. "orders" or "orders.amount"
    pub object_path: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DriftChangeType {
    Added,
    Removed,
    Modified,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ObjectType {
    Table,
    Column,
}

/// Compare two schemas and detect drift
pub fn detect_drift(old: &SchemaSnapshot, new: &SchemaSnapshot) -> DriftReport {
    let mut changes = Vec::new();

    let old_tables: BTreeMap<&str, &TableDescriptor> =
        old.tables.iter().map(|t| (t.name.as_str(), t)).collect();
    let new_tables: BTreeMap<&str, &TableDescriptor> =
        new.tables.iter().map(|t| (t.name.as_str(), t)).collect();

    for (name, table) in &new_tables {
        if !old_tables.contains_key(name) {
            changes.push(DriftChange {
                change_type: DriftChangeType::Added,
                object_type: ObjectType::Table,
                object_path: name.to_string(),
                details: Some(format!("{} columns", table.columns.len())),
            });
        }
    }

    for name in old_tables.keys() {
        if !new_tables.contains_key(name) {
            changes.push(DriftChange {
                change_type: DriftChangeType::Removed,
                object_type: ObjectType::Table,
                object_path: name.to_string(),
                details: None,
            });
        }
    }

    for (name, old_table) in &old_tables {
        if let Some(new_table) = new_tables.get(name) {
            diff_columns(name, old_table, new_table, &mut changes);
        }
    }

    DriftReport {
        detected_at: Utc::now(),
        has_drift: !changes.is_empty(),
        from_version: old.version,
        to_version: new.version,
        old_checksum: old.checksum.clone(),
        new_checksum: new.checksum.clone(),
        changes,
    }
}

fn diff_columns(
    table: &str,
    old_table: &TableDescriptor,
    new_table: &TableDescriptor,
    changes: &mut Vec<DriftChange>,
) {
    let old_cols: BTreeMap<&str, &ColumnDescriptor> =
        old_table.columns.iter().map(|c| (c.name.as_str(), c)).collect();
    let new_cols: BTreeMap<&str, &ColumnDescriptor> =
        new_table.columns.iter().map(|c| (c.name.as_str(), c)).collect();

    for (col_name, new_col) in &new_cols {
        match old_cols.get(col_name) {
            Some(old_col) => {
                if old_col.data_type != new_col.data_type || old_col.nullable != new_col.nullable {
                    changes.push(DriftChange {
                        change_type: DriftChangeType::Modified,
                        object_type: ObjectType::Column,
                        object_path: format!("{}.{}", table, col_name),
                        details: Some(format!(
                            "Type: {} -> {}, Nullable: {} -> {}",
                            old_col.data_type, new_col.data_type,
                            old_col.nullable, new_col.nullable
                        )),
                    });
                }
            }
            None => changes.push(DriftChange {
                change_type: DriftChangeType::Added,
                object_type: ObjectType::Column,
                object_path: format!("{}.{}", table, col_name),
                details: Some(new_col.data_type.clone()),
            }),
        }
    }

    for col_name in old_cols.keys() {
        if !new_cols.contains_key(col_name) {
            changes.push(DriftChange {
                change_type: DriftChangeType::Removed,
                object_type: ObjectType::Column,
                object_path: format!("{}.{}", table, col_name),
                details: None,
            });
        }
    }
}
