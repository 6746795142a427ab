//! Application state management
//!
//! Contains shared state accessible across all handlers.

use crate::config::Settings;
use crate::introspection::PostgresIntrospector;
use crate::llm::{HttpLlmClient, LlmClient};
use crate::pipeline::executor::{PostgresExecutor, QueryExecutor};
use crate::pipeline::{Orchestrator, PipelineConfig};
use crate::prompt::PromptBuilder;
use crate::snapshot::SchemaCatalog;
use deadpool_postgres::Pool;
use std::sync::Arc;

/// Application state shared across all handlers
pub struct AppState {
    /// Cached schema snapshot, shared with the orchestrator
    pub catalog: Arc<SchemaCatalog>,

    /// Question-to-answer pipeline
    pub orchestrator: Orchestrator,
}

impl AppState {
    /// Wire the PostgreSQL and HTTP implementations together
    pub fn new(pool: Pool, settings: &Settings) -> Result<Self, reqwest::Error> {
        let source = Arc::new(
            PostgresIntrospector::new(pool.clone(), settings.database.namespace.clone())
                .with_statement_timeout(settings.query.db_timeout)
                .with_sample_rows(settings.schema.sample_rows),
        );
        let catalog = Arc::new(
            SchemaCatalog::new(source, settings.schema.cache_ttl)
                .with_load_timeout(settings.query.db_timeout),
        );
        let llm: Arc<dyn LlmClient> = Arc::new(HttpLlmClient::new(&settings.llm)?);
        let executor: Arc<dyn QueryExecutor> =
            Arc::new(PostgresExecutor::new(pool, settings.query.max_rows));

        Ok(Self::from_parts(catalog, llm, executor, settings))
    }

    /// Assemble state from any catalog source, model client and executor
    pub fn from_parts(
        catalog: Arc<SchemaCatalog>,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn QueryExecutor>,
        settings: &Settings,
    ) -> Self {
        let orchestrator = Orchestrator::new(
            catalog.clone(),
            llm,
            executor,
            PromptBuilder::from_config(&settings.query),
            PipelineConfig::from_settings(settings),
        );

        Self {
            catalog,
            orchestrator,
        }
    }
}

/// Type alias for shared state
pub type SharedState = Arc<AppState>;
