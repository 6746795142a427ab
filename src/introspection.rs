//! Schema Introspection Module
//!
//! Reads table and column metadata from the live database. The snapshot built
//! here is what grounds both SQL generation and SQL validation.

use crate::error::PipelineError;
use crate::pipeline::values::row_to_json;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_postgres::{Pool, Transaction};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_STATEMENT_TIMEOUT: Duration = Duration::from_secs(15);

/// Immutable view of one namespace at a point in time
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaSnapshot {
    pub namespace: String,
    /// Assigned by the catalog when the snapshot is installed
    pub version: u64,
    pub captured_at: DateTime<Utc>,
    pub tables: Vec<TableDescriptor>,
    pub foreign_keys: Vec<ForeignKey>,
    pub checksum: String,
}

impl SchemaSnapshot {
    pub fn new(
        namespace: impl Into<String>,
        tables: Vec<TableDescriptor>,
        foreign_keys: Vec<ForeignKey>,
    ) -> Self {
        let checksum = Self::compute_checksum(&tables, &foreign_keys);
        Self {
            namespace: namespace.into(),
            version: 0,
            captured_at: Utc::now(),
            tables,
            foreign_keys,
            checksum,
        }
    }

    /// Look up a table by its exact catalog name
    pub fn table(&self, name: &str) -> Option<&TableDescriptor> {
        self.tables.iter().find(|t| t.name == name)
    }

    /// Compute checksum from schema content
    pub fn compute_checksum(tables: &[TableDescriptor], foreign_keys: &[ForeignKey]) -> String {
        let mut hasher = Sha256::new();

        // Hash tables in sorted order for consistency
        let mut entries: Vec<String> = tables
            .iter()
            .flat_map(|t| {
                t.columns.iter().map(move |c| {
                    format!("{}.{}:{}:{}", t.name, c.name, c.data_type, c.nullable)
                })
            })
            .collect();
        entries.sort();

        for entry in &entries {
            hasher.update(entry.as_bytes());
        }

        let mut fks: Vec<String> = foreign_keys
            .iter()
            .map(|fk| {
                format!(
                    "FK:{}({})->{}({})",
                    fk.source_table,
                    fk.source_columns.join(","),
                    fk.referenced_table,
                    fk.referenced_columns.join(",")
                )
            })
            .collect();
        fks.sort();

        for fk in &fks {
            hasher.update(fk.as_bytes());
        }

        format!("{:x}", hasher.finalize())
    }
}

/// Table or view visible to the pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TableDescriptor {
    pub name: String,
    #[serde(default)]
    pub is_view: bool,
    pub columns: Vec<ColumnDescriptor>,
    /// Example rows in column order, only shown to the SQL model. Never
    /// serialized and not part of the checksum.
    #[serde(skip)]
    pub samples: Vec<Vec<Value>>,
}

impl TableDescriptor {
    pub fn column(&self, name: &str) -> Option<&ColumnDescriptor> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column(name).is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDescriptor {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub is_primary_key: bool,
}

/// Foreign key relationship, used as a join hint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ForeignKey {
    pub constraint_name: String,
    pub source_table: String,
    pub source_columns: Vec<String>,
    pub referenced_table: String,
    pub referenced_columns: Vec<String>,
}

/// Anything that can produce a fresh schema snapshot
#[async_trait]
pub trait SchemaSource: Send + Sync {
    async fn introspect(&self) -> Result<SchemaSnapshot, PipelineError>;
}

/// Schema introspector for PostgreSQL
pub struct PostgresIntrospector {
    pool: Pool,
    namespace: String,
    statement_timeout: Duration,
    sample_rows: usize,
}

impl PostgresIntrospector {
    pub fn new(pool: Pool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            statement_timeout: DEFAULT_STATEMENT_TIMEOUT,
            sample_rows: 0,
        }
    }

    /// Server-side limit for each catalog query
    pub fn with_statement_timeout(mut self, timeout: Duration) -> Self {
        self.statement_timeout = timeout;
        self
    }

    /// Rows per table to capture as examples for the SQL prompt; 0 disables
    pub fn with_sample_rows(mut self, rows: usize) -> Self {
        self.sample_rows = rows;
        self
    }

    /// Get all tables and views with their columns
    async fn get_tables(
        tx: &Transaction<'_>,
        namespace: &str,
    ) -> Result<Vec<TableDescriptor>, tokio_postgres::Error> {
        let query = r#"
            SELECT
                c.table_name::text AS table_name,
                t.table_type::text AS table_type,
                c.column_name::text AS column_name,
                CASE WHEN c.data_type IN ('USER-DEFINED', 'ARRAY')
                     THEN c.udt_name::text
                     ELSE c.data_type::text
                END AS data_type,
                c.is_nullable::text AS is_nullable,
                EXISTS (
                    SELECT 1 FROM information_schema.table_constraints tc
                    JOIN information_schema.key_column_usage kcu
                        ON tc.constraint_name = kcu.constraint_name
                        AND tc.table_schema = kcu.table_schema
                        AND tc.table_name = kcu.table_name
                    WHERE tc.constraint_type = 'PRIMARY KEY'
                        AND tc.table_schema = c.table_schema
                        AND tc.table_name = c.table_name
                        AND kcu.column_name = c.column_name
                ) AS is_primary_key
            FROM information_schema.columns c
            JOIN information_schema.tables t
                ON t.table_schema = c.table_schema
                AND t.table_name = c.table_name
            WHERE c.table_schema = $1
              AND t.table_type IN ('BASE TABLE', 'VIEW')
            ORDER BY c.table_name, c.ordinal_position
        "#;

        let rows = tx.query(query, &[&namespace]).await?;

        let mut tables: Vec<TableDescriptor> = Vec::new();
        for row in rows {
            let table_name: String = row.get("table_name");
            let column = ColumnDescriptor {
                name: row.get("column_name"),
                data_type: row.get("data_type"),
                nullable: row.get::<_, String>("is_nullable") == "YES",
                is_primary_key: row.get("is_primary_key"),
            };

            match tables.last_mut() {
                Some(table) if table.name == table_name => table.columns.push(column),
                _ => tables.push(TableDescriptor {
                    name: table_name,
                    is_view: row.get::<_, String>("table_type") == "VIEW",
                    columns: vec![column],
                    samples: Vec::new(),
                }),
            }
        }

        Ok(tables)
    }

    /// Get foreign keys declared inside the namespace
    async fn get_foreign_keys(
        tx: &Transaction<'_>,
        namespace: &str,
    ) -> Result<Vec<ForeignKey>, tokio_postgres::Error> {
        let query = r#"
            SELECT
                tc.constraint_name::text AS constraint_name,
                tc.table_name::text AS source_table,
                COALESCE(array_agg(DISTINCT kcu.column_name::text), ARRAY[]::text[]) AS source_columns,
                ccu.table_name::text AS referenced_table,
                COALESCE(array_agg(DISTINCT ccu.column_name::text), ARRAY[]::text[]) AS referenced_columns
            FROM information_schema.table_constraints tc
            JOIN information_schema.key_column_usage kcu
                ON tc.constraint_name = kcu.constraint_name
                AND tc.table_schema = kcu.table_schema
            JOIN information_schema.constraint_column_usage ccu
                ON tc.constraint_name = ccu.constraint_name
                AND tc.table_schema = ccu.constraint_schema
            WHERE tc.constraint_type = 'FOREIGN KEY'
                AND tc.table_schema = $1
            GROUP BY tc.constraint_name, tc.table_name, ccu.table_name
            ORDER BY tc.table_name, tc.constraint_name
        "#;

        let rows = tx.query(query, &[&namespace]).await?;

        let foreign_keys = rows
            .iter()
            .map(|row| ForeignKey {
                constraint_name: row.get("constraint_name"),
                source_table: row.get("source_table"),
                source_columns: row.try_get("source_columns").unwrap_or_default(),
                referenced_table: row.get("referenced_table"),
                referenced_columns: row.try_get("referenced_columns").unwrap_or_default(),
            })
            .collect();

        Ok(foreign_keys)
    }

    /// First rows of one table. Runs under a savepoint so a failing table
    /// leaves the surrounding transaction usable.
    async fn get_samples(
        tx: &mut Transaction<'_>,
        namespace: &str,
        table: &str,
        limit: usize,
    ) -> Result<Vec<Vec<Value>>, tokio_postgres::Error> {
        let savepoint = tx.savepoint("table_sample").await?;
        let query = format!(
            "SELECT * FROM {}.{} LIMIT {}",
            quote_ident(namespace),
            quote_ident(table),
            limit
        );
        let rows = savepoint.query(query.as_str(), &[]).await;
        savepoint.rollback().await?;

        Ok(rows?.iter().map(row_to_json).collect())
    }
}

fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn unavailable(context: &'static str) -> impl Fn(tokio_postgres::Error) -> PipelineError {
    move |e| PipelineError::SchemaUnavailable(format!("{}: {}", context, e))
}

#[async_trait]
impl SchemaSource for PostgresIntrospector {
    async fn introspect(&self) -> Result<SchemaSnapshot, PipelineError> {
        let mut client = self
            .pool
            .get()
            .await
            .map_err(|e| PipelineError::SchemaUnavailable(format!("connection pool: {}", e)))?;

        let mut tx = client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(unavailable("transaction"))?;

        tx.batch_execute(&format!(
            "SET LOCAL statement_timeout = {}",
            self.statement_timeout.as_millis().max(1)
        ))
        .await
        .map_err(unavailable("statement timeout"))?;

        let mut tables = Self::get_tables(&tx, &self.namespace)
            .await
            .map_err(unavailable("column introspection"))?;

        let foreign_keys = Self::get_foreign_keys(&tx, &self.namespace)
            .await
            .map_err(unavailable("foreign key introspection"))?;

        if self.sample_rows > 0 {
            for table in &mut tables {
                match Self::get_samples(&mut tx, &self.namespace, &table.name, self.sample_rows).await {
                    Ok(rows) => table.samples = rows,
                    Err(e) => warn!(table = %table.name, "Skipping sample rows: {}", e),
                }
            }
        }

        if let Err(e) = tx.rollback().await {
            warn!("Rollback after introspection failed: {}", e);
        }

        debug!(
            namespace = %self.namespace,
            "Introspected schema with {} tables, {} FKs",
            tables.len(),
            foreign_keys.len()
        );

        Ok(SchemaSnapshot::new(self.namespace.clone(), tables, foreign_keys))
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::create_pool;
    use crate::db::testing::silent_peer;
    use crate::snapshot::SchemaCatalog;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_checksum_consistency() {
        let a = shop_snapshot();
        let b = shop_snapshot();
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_checksum_ignores_table_order() {
        let a = shop_snapshot();
        let mut tables = a.tables.clone();
        tables.reverse();
        let b = SchemaSnapshot::new("public", tables, a.foreign_keys.clone());
        assert_eq!(a.checksum, b.checksum);
    }

    #[test]
    fn test_checksum_tracks_type_change() {
        let a = shop_snapshot();
        let mut tables = a.tables.clone();
        tables[1].columns[2].data_type = "double precision".to_string();
        let b = SchemaSnapshot::new("public", tables, a.foreign_keys.clone());
        assert_ne!(a.checksum, b.checksum);
    }

    #[test]
    fn test_lookup() {
        let snapshot = shop_snapshot();
        let orders = snapshot.table("orders").unwrap();
        assert!(orders.has_column("customer_id"));
        assert!(!orders.has_column("Customer_Id"));
        assert!(snapshot.table("payments").is_none());
    }

    #[test]
    fn test_samples_stay_out_of_json_and_checksum() {
        let plain = shop_snapshot();
        let mut tables = plain.tables.clone();
        tables[0].samples = vec![vec![json!(1), json!("Ana"), json!("EG")]];
        let sampled = SchemaSnapshot::new("public", tables, plain.foreign_keys.clone());

        assert_eq!(plain.checksum, sampled.checksum);
        let value = serde_json::to_value(&sampled).unwrap();
        assert!(value["tables"][0].get("samples").is_none());
        assert!(!value.to_string().contains("Ana"));
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("orders"), "\"orders\"");
        assert_eq!(quote_ident("odd\"name"), "\"odd\"\"name\"");
    }

    async fn silent_catalog(connect_timeout: Duration, load_timeout: Duration) -> SchemaCatalog {
        let config = DatabaseConfig {
            host: "127.0.0.1".to_string(),
            port: silent_peer().await,
            connect_timeout,
            ..DatabaseConfig::default()
        };
        let source = PostgresIntrospector::new(create_pool(&config).unwrap(), "public");
        SchemaCatalog::new(Arc::new(source), Duration::from_secs(60)).with_load_timeout(load_timeout)
    }

    #[tokio::test]
    async fn test_silent_database_trips_load_deadline() {
        let catalog = silent_catalog(Duration::from_secs(30), Duration::from_millis(300)).await;

        let result = tokio::time::timeout(Duration::from_secs(5), catalog.load())
            .await
            .expect("schema load must not wait on a silent server");

        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::SchemaUnavailable(_)));
        assert!(err.to_string().contains("timed out"));
    }

    #[tokio::test]
    async fn test_silent_database_trips_pool_timeout() {
        let catalog = silent_catalog(Duration::from_millis(200), Duration::from_secs(30)).await;

        let result = tokio::time::timeout(Duration::from_secs(5), catalog.load())
            .await
            .expect("pool checkout must not wait on a silent server");

        let err = result.unwrap_err();
        assert!(matches!(err, PipelineError::SchemaUnavailable(_)));
        assert!(err.to_string().contains("connection pool"));
    }

    #[test]
    fn test_column_type_serializes_as_type() {
        let json = serde_json::to_value(column("amount", "numeric")).unwrap();
        assert_eq!(json["type"], "numeric");
        assert_eq!(json["isPrimaryKey"], false);
    }
}
