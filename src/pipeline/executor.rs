//! Query Executor
//!
//! Runs a single validated statement inside a read-only transaction with both
//! a server-side `statement_timeout` and a client-side deadline. The
//! transaction is always rolled back; dropping it on an early return or a
//! cancelled future does the same.

use crate::error::PipelineError;
use crate::pipeline::types::QueryResult;
use crate::pipeline::validator::ValidatedSql;
use crate::pipeline::values::row_to_json;
use async_trait::async_trait;
use deadpool_postgres::Pool;
use std::time::{Duration, Instant};
use tokio_postgres::error::SqlState;
use tracing::{debug, error, warn};

#[async_trait]
pub trait QueryExecutor: Send + Sync {
    async fn execute(&self, sql: &ValidatedSql, timeout: Duration) -> Result<QueryResult, PipelineError>;
}

pub struct PostgresExecutor {
    pool: Pool,
    max_rows: u64,
}

impl PostgresExecutor {
    pub fn new(pool: Pool, max_rows: u64) -> Self {
        Self {
            pool,
            max_rows: max_rows.max(1),
        }
    }

    async fn fetch(
        &self,
        sql: &ValidatedSql,
        timeout: Duration,
    ) -> Result<(Vec<String>, Vec<tokio_postgres::Row>), PipelineError> {
        let mut client = self.pool.get().await.map_err(|e| {
            error!("Failed to acquire database connection: {}", e);
            PipelineError::QueryExecutionError(format!("pool: {}", e))
        })?;

        let tx = client
            .build_transaction()
            .read_only(true)
            .start()
            .await
            .map_err(|e| db_error(e, timeout))?;

        tx.batch_execute(&format!("SET LOCAL statement_timeout = {}", timeout.as_millis().max(1)))
            .await
            .map_err(|e| db_error(e, timeout))?;

        let statement = tx.prepare(sql.as_str()).await.map_err(|e| db_error(e, timeout))?;
        let columns = statement
            .columns()
            .iter()
            .map(|c| c.name().to_string())
            .collect();

        let rows = tx.query(&statement, &[]).await.map_err(|e| db_error(e, timeout))?;

        if let Err(e) = tx.rollback().await {
            // Rows are already in hand; the pool discards a broken connection on recycle
            warn!("Rollback after read-only query failed: {}", e);
        }

        Ok((columns, rows))
    }
}

#[async_trait]
impl QueryExecutor for PostgresExecutor {
    async fn execute(&self, sql: &ValidatedSql, timeout: Duration) -> Result<QueryResult, PipelineError> {
        let start = Instant::now();

        let (columns, rows) = tokio::time::timeout(timeout, self.fetch(sql, timeout))
            .await
            .map_err(|_| {
                warn!(timeout_ms = timeout.as_millis() as u64, "Query deadline elapsed");
                PipelineError::QueryTimeout(timeout)
            })??;

        let cap = self.max_rows.min(sql.row_cap());
        let (rows, truncated) = cap_rows(rows, cap, sql.limit_enforced());
        let rows: Vec<_> = rows.iter().map(row_to_json).collect();
        let elapsed = start.elapsed().as_millis() as u64;

        debug!(
            rows = rows.len(),
            truncated,
            elapsed_ms = elapsed,
            "Query executed"
        );

        Ok(QueryResult {
            row_count: rows.len(),
            columns,
            rows,
            truncated,
            execution_time_ms: elapsed,
        })
    }
}

/// Keep at most `cap` rows. A result that fills a cap the validator imposed is
/// reported as truncated since more rows may exist.
fn cap_rows<T>(mut rows: Vec<T>, cap: u64, limit_enforced: bool) -> (Vec<T>, bool) {
    let cap = usize::try_from(cap).unwrap_or(usize::MAX);
    let overflowed = rows.len() > cap;
    rows.truncate(cap);
    let truncated = overflowed || (limit_enforced && rows.len() == cap);
    (rows, truncated)
}

fn db_error(e: tokio_postgres::Error, timeout: Duration) -> PipelineError {
    if e.code() == Some(&SqlState::QUERY_CANCELED) {
        warn!("Statement cancelled by server timeout");
        return PipelineError::QueryTimeout(timeout);
    }
    error!("Database error: {}", e);
    PipelineError::QueryExecutionError(e.to_string())
}


#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_rows_under_cap_are_not_truncated() {
        let (rows, truncated) = cap_rows(vec![1, 2, 3], 10, true);
        assert_eq!(rows, vec![1, 2, 3]);
        assert!(!truncated);
    }

    #[test]
    fn test_rows_over_cap_are_truncated() {
        let (rows, truncated) = cap_rows(vec![1, 2, 3, 4], 2, false);
        assert_eq!(rows, vec![1, 2]);
        assert!(truncated);
    }

    #[test]
    fn test_filled_enforced_cap_is_truncated() {
        let (rows, truncated) = cap_rows(vec![1, 2], 2, true);
        assert_eq!(rows.len(), 2);
        assert!(truncated);
    }

    #[test]
    fn test_filled_model_limit_is_not_truncated() {
        // "top 5" asked for exactly five rows
        let (rows, truncated) = cap_rows(vec![1, 2, 3, 4, 5], 5, false);
        assert_eq!(rows.len(), 5);
        assert!(!truncated);
    }

    mod live {
        use super::super::*;
        use crate::config::Settings;
        use crate::db;
        use crate::introspection::fixtures::shop_snapshot;
        use crate::pipeline::validator::SqlValidator;

        async fn executor() -> PostgresExecutor {
            let settings = Settings::load().expect("settings");
            let pool = db::create_pool(&settings.database).expect("pool");
            PostgresExecutor::new(pool, 100)
        }

        #[tokio::test]
        #[ignore = "Requires running PostgreSQL instance"]
        async fn test_execute_select_query() {
            let sql = SqlValidator::new(10)
                .validate("SELECT 1 AS num, 'test' AS str", &shop_snapshot())
                .unwrap();
            let result = executor().await.execute(&sql, Duration::from_secs(5)).await.unwrap();

            assert_eq!(result.columns, vec!["num", "str"]);
            assert_eq!(result.rows, vec![vec![serde_json::json!(1), serde_json::json!("test")]]);
            assert!(!result.truncated);
        }

        #[tokio::test]
        #[ignore = "Requires running PostgreSQL instance"]
        async fn test_server_timeout_maps_to_query_timeout() {
            let sql = SqlValidator::new(10)
                .validate(
                    "WITH RECURSIVE n(i) AS (SELECT 1 UNION ALL SELECT i + 1 FROM n) SELECT count(*) AS c FROM n",
                    &shop_snapshot(),
                )
                .unwrap();
            let err = executor()
                .await
                .execute(&sql, Duration::from_millis(200))
                .await
                .unwrap_err();
            assert!(matches!(err, PipelineError::QueryTimeout(_)));
        }
    }
}
