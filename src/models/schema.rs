//! Schema catalog response DTOs

use crate::introspection::SchemaSnapshot;
use crate::snapshot::DriftReport;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Snapshot header without the table listing
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSummary {
    pub namespace: String,
    pub version: u64,
    pub captured_at: DateTime<Utc>,
    pub checksum: String,
    pub table_count: usize,
    pub column_count: usize,
}

impl From<&SchemaSnapshot> for SchemaSummary {
    fn from(snapshot: &SchemaSnapshot) -> Self {
        Self {
            namespace: snapshot.namespace.clone(),
            version: snapshot.version,
            captured_at: snapshot.captured_at,
            checksum: snapshot.checksum.clone(),
            table_count: snapshot.tables.len(),
            column_count: snapshot.tables.iter().map(|t| t.columns.len()).sum(),
        }
    }
}

/// Result of a forced reload
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReloadResponse {
    pub schema: SchemaSummary,
    /// Absent on the first load
    #[serde(skip_serializing_if = "Option::is_none")]
    pub drift: Option<DriftReport>,
}

/// Full snapshot wrapper for `GET /api/schema`
#[derive(Debug, Serialize)]
pub struct SchemaResponse {
    pub schema: SchemaSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::fixtures::shop_snapshot;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_summary_counts() {
        let summary = SchemaSummary::from(&shop_snapshot());
        assert_eq!(summary.table_count, 2);
        assert_eq!(summary.column_count, 8);
        assert_eq!(summary.namespace, "public");
    }
}
