//! Pipeline Orchestrator
//!
//! Drives one question through schema load, SQL generation, validation,
//! execution and answer synthesis. Stages run strictly in order; the first
//! failure ends the run and is reported with the stage that raised it.
//! Dropping the future returned by [`Orchestrator::run`] stops the run at its
//! current await point and no later stage starts.

use crate::config::{AnswerFallback, Settings};
use crate::error::{PipelineError, PipelineFailure, Stage};
use crate::llm::retry::is_retryable;
use crate::llm::{LlmClient, RetryPolicy};
use crate::pipeline::answer::AnswerSynthesizer;
use crate::pipeline::executor::QueryExecutor;
use crate::pipeline::types::{Answer, CandidateSql, PipelineResponse, PipelineState};
use crate::pipeline::validator::SqlValidator;
use crate::prompt::PromptBuilder;
use crate::snapshot::SchemaCatalog;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn, Instrument};
use uuid::Uuid;

/// Knobs the orchestrator needs from the settings
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub max_rows: u64,
    pub llm_timeout: Duration,
    pub db_timeout: Duration,
    pub sql_max_tokens: u32,
    pub answer_max_tokens: u32,
    pub answer_fallback: AnswerFallback,
    pub generation_retry: RetryPolicy,
    pub answer_retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            max_rows: settings.query.max_rows,
            llm_timeout: settings.llm.timeout,
            db_timeout: settings.query.db_timeout,
            sql_max_tokens: settings.llm.sql_max_tokens,
            answer_max_tokens: settings.llm.answer_max_tokens,
            answer_fallback: settings.query.answer_fallback,
            generation_retry: RetryPolicy::sql_generation(settings.llm.retry_backoff),
            answer_retry: RetryPolicy::no_retry(),
        }
    }
}

pub struct Orchestrator {
    catalog: Arc<SchemaCatalog>,
    llm: Arc<dyn LlmClient>,
    executor: Arc<dyn QueryExecutor>,
    prompts: PromptBuilder,
    answers: AnswerSynthesizer,
    config: PipelineConfig,
}

impl Orchestrator {
    pub fn new(
        catalog: Arc<SchemaCatalog>,
        llm: Arc<dyn LlmClient>,
        executor: Arc<dyn QueryExecutor>,
        prompts: PromptBuilder,
        config: PipelineConfig,
    ) -> Self {
        let prompts = prompts.with_row_cap(config.max_rows);
        let answers = AnswerSynthesizer::new(
            llm.clone(),
            prompts,
            config.answer_retry,
            config.answer_max_tokens,
            config.llm_timeout,
        );

        Self {
            catalog,
            llm,
            executor,
            prompts,
            answers,
            config,
        }
    }

    /// Effective cap for a request; a per-request value can only lower it
    pub fn row_cap(&self, requested: Option<u64>) -> u64 {
        requested.map_or(self.config.max_rows, |r| r.clamp(1, self.config.max_rows))
    }

    /// Answer one question end to end
    pub async fn run(
        &self,
        question: &str,
        max_rows: Option<u64>,
    ) -> Result<PipelineResponse, PipelineFailure> {
        let request_id = Uuid::new_v4();
        let span = tracing::info_span!("pipeline", %request_id);
        self.run_stages(request_id, question, max_rows)
            .instrument(span)
            .await
    }

    async fn run_stages(
        &self,
        request_id: Uuid,
        question: &str,
        max_rows: Option<u64>,
    ) -> Result<PipelineResponse, PipelineFailure> {
        let started = Instant::now();
        let cap = self.row_cap(max_rows);
        transition(PipelineState::Received);
        info!(question_chars = question.len(), row_cap = cap, "Question received");

        let schema = self
            .catalog
            .load()
            .await
            .map_err(|e| fail(Stage::Schema, e))?;
        transition(PipelineState::SchemaLoaded);

        let prompt = self.prompts.with_row_cap(cap).build_sql_prompt(question, &schema);
        let raw = self
            .config
            .generation_retry
            .retry(
                |attempt| {
                    debug!(attempt, "Requesting SQL from LLM");
                    self.llm
                        .complete(&prompt, self.config.sql_max_tokens, self.config.llm_timeout)
                },
                is_retryable,
            )
            .await
            .map_err(|e| fail(Stage::SqlGeneration, e))?;
        let candidate = CandidateSql::from_llm(raw);
        debug!(source = ?candidate.source, chars = candidate.raw_text.len(), "Candidate SQL received");
        transition(PipelineState::SqlGenerated);

        let sql = SqlValidator::new(cap)
            .validate(&candidate.raw_text, &schema)
            .map_err(|e| fail(Stage::SqlValidation, e))?;
        debug!(
            sql = sql.as_str(),
            limit = sql.limit(),
            tables = ?sql.tables(),
            "SQL validated"
        );
        transition(PipelineState::SqlValidated);

        let result = self
            .executor
            .execute(&sql, self.config.db_timeout)
            .await
            .map_err(|e| fail(Stage::QueryExecution, e))?;
        transition(PipelineState::QueryExecuted);

        let answer = match self.answers.synthesize(question, &result).await {
            Ok(answer) => answer,
            Err(e) if e.is_llm_failure() && self.config.answer_fallback == AnswerFallback::Raw => {
                warn!("Answer synthesis failed, returning raw rows: {}", e);
                Answer::raw_fallback()
            }
            Err(e) => return Err(fail(Stage::AnswerSynthesis, e)),
        };
        transition(PipelineState::AnswerSynthesized);

        let elapsed = started.elapsed().as_millis() as u64;
        transition(PipelineState::Completed);
        info!(
            rows = result.row_count,
            truncated = result.truncated,
            answer_source = ?answer.source,
            elapsed_ms = elapsed,
            "Question answered"
        );

        Ok(PipelineResponse {
            answer_text: answer.text,
            generated_sql: sql.as_str().to_string(),
            row_count: result.row_count,
            columns: result.columns,
            rows: result.rows,
            truncated: result.truncated,
            answer_source: answer.source,
            limit: sql.limit_action(),
            execution_time_ms: elapsed,
            request_id,
        })
    }
}

fn transition(state: PipelineState) {
    debug!(state = %state, "Pipeline state");
}

fn fail(stage: Stage, error: PipelineError) -> PipelineFailure {
    warn!(
        state = %PipelineState::Failed,
        stage = %stage,
        code = error.code(),
        "Pipeline failed"
    );
    PipelineFailure::new(stage, error)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::introspection::fixtures::shop_snapshot;
    use crate::llm::mock::ScriptedLlm;
    use crate::pipeline::answer::EMPTY_RESULT_ANSWER;
    use crate::pipeline::executor::mock::{Outcome, StaticExecutor};
    use crate::pipeline::types::AnswerSource;
    use crate::pipeline::validator::{LimitAction, RejectReason};
    use crate::snapshot::store::mock::StaticSource;
    use pretty_assertions::assert_eq;
    use serde_json::{json, Value};

    const TOP_CUSTOMERS_SQL: &str = "SELECT c.name, SUM(o.amount) AS total FROM customers c \
         JOIN orders o ON o.customer_id = c.id GROUP BY c.name ORDER BY total DESC LIMIT 5";

    fn config(fallback: AnswerFallback) -> PipelineConfig {
        PipelineConfig {
            max_rows: 100,
            llm_timeout: Duration::from_secs(5),
            db_timeout: Duration::from_secs(5),
            sql_max_tokens: 1024,
            answer_max_tokens: 512,
            answer_fallback: fallback,
            generation_retry: RetryPolicy::sql_generation(Duration::from_millis(1)),
            answer_retry: RetryPolicy::no_retry(),
        }
    }

    fn orchestrator_with(
        llm: Arc<ScriptedLlm>,
        executor: Arc<StaticExecutor>,
        source: StaticSource,
        fallback: AnswerFallback,
    ) -> Orchestrator {
        let catalog = Arc::new(SchemaCatalog::new(Arc::new(source), Duration::from_secs(60)));
        Orchestrator::new(
            catalog,
            llm,
            executor,
            PromptBuilder::new(100, 50, 20, 200),
            config(fallback),
        )
    }

    fn orchestrator(llm: Arc<ScriptedLlm>, executor: Arc<StaticExecutor>) -> Orchestrator {
        orchestrator_with(
            llm,
            executor,
            StaticSource::new(vec![shop_snapshot()]),
            AnswerFallback::Raw,
        )
    }

    fn top_five_rows() -> Vec<Vec<Value>> {
        ["Ana", "Ben", "Cy", "Di", "Ed"]
            .iter()
            .enumerate()
            .map(|(i, name)| vec![json!(name), json!(500 - i * 50)])
            .collect()
    }

    #[tokio::test]
    async fn test_top_customers_end_to_end() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(TOP_CUSTOMERS_SQL.to_string()),
            Ok("Ana is the top customer with 500 in orders.".to_string()),
        ]));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(top_five_rows())));

        let response = orchestrator(llm.clone(), executor.clone())
            .run("Top 5 customers by revenue", None)
            .await
            .unwrap();

        assert_eq!(response.row_count, 5);
        assert!(response.generated_sql.ends_with("LIMIT 5"));
        assert_eq!(response.limit, LimitAction::Kept);
        assert_eq!(response.answer_source, AnswerSource::Llm);
        assert_eq!(
            response.answer_text.as_deref(),
            Some("Ana is the top customer with 500 in orders.")
        );
        assert_eq!(llm.call_count(), 2);
        assert_eq!(executor.call_count(), 1);
        assert_eq!(executor.executed.lock().unwrap()[0], response.generated_sql);
        assert!(llm.prompts()[0].contains("Top 5 customers by revenue"));
    }

    #[tokio::test]
    async fn test_delete_is_rejected_before_execution() {
        let llm = Arc::new(ScriptedLlm::replying("DELETE FROM orders"));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(vec![])));

        let failure = orchestrator(llm, executor.clone())
            .run("Remove all orders", None)
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::SqlValidation);
        assert!(matches!(
            failure.error,
            PipelineError::UnsafeSqlRejected(RejectReason::ForbiddenKeyword(_))
        ));
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_rows_skip_answer_model() {
        let llm = Arc::new(ScriptedLlm::replying(
            "SELECT name FROM customers WHERE country = 'Atlantis'",
        ));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(vec![])));

        let response = orchestrator(llm.clone(), executor)
            .run("Customers in Atlantis?", None)
            .await
            .unwrap();

        assert_eq!(response.answer_text.as_deref(), Some(EMPTY_RESULT_ANSWER));
        assert_eq!(response.answer_source, AnswerSource::EmptyResult);
        assert_eq!(response.row_count, 0);
        assert_eq!(response.limit, LimitAction::Injected);
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_generation_timeout_is_retried_exactly_once() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(PipelineError::LlmTimeout(
            Duration::from_secs(5),
        ))]));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(vec![])));

        let failure = orchestrator(llm.clone(), executor.clone())
            .run("Revenue by month", None)
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::SqlGeneration);
        assert!(matches!(failure.error, PipelineError::LlmTimeout(_)));
        assert_eq!(llm.call_count(), 2);
        assert_eq!(executor.call_count(), 0);
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let llm = Arc::new(ScriptedLlm::new(vec![Err(PipelineError::LlmRequestError {
            status: Some(401),
            message: "bad key".into(),
        })]));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(vec![])));

        let failure = orchestrator(llm.clone(), executor)
            .run("q", None)
            .await
            .unwrap_err();

        assert_eq!(failure.error.code(), "LLM_REQUEST_ERROR");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_answer_failure_falls_back_to_raw_rows() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(TOP_CUSTOMERS_SQL.to_string()),
            Err(PipelineError::LlmRequestError {
                status: Some(500),
                message: "upstream".into(),
            }),
        ]));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(top_five_rows())));

        let response = orchestrator(llm.clone(), executor)
            .run("Top 5 customers", None)
            .await
            .unwrap();

        assert_eq!(response.answer_text, None);
        assert_eq!(response.answer_source, AnswerSource::RawFallback);
        assert_eq!(response.rows.len(), 5);
        // No retry in the answer stage
        assert_eq!(llm.call_count(), 2);
    }

    #[tokio::test]
    async fn test_answer_failure_surfaces_when_fallback_disabled() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok(TOP_CUSTOMERS_SQL.to_string()),
            Err(PipelineError::LlmEmptyResponse),
        ]));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(top_five_rows())));
        let orchestrator = orchestrator_with(
            llm,
            executor,
            StaticSource::new(vec![shop_snapshot()]),
            AnswerFallback::Fail,
        );

        let failure = orchestrator.run("Top 5 customers", None).await.unwrap_err();
        assert_eq!(failure.stage, Stage::AnswerSynthesis);
        assert!(matches!(failure.error, PipelineError::LlmEmptyResponse));
    }

    #[tokio::test]
    async fn test_schema_failure_is_tagged() {
        let llm = Arc::new(ScriptedLlm::replying("SELECT 1"));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(vec![])));
        let orchestrator =
            orchestrator_with(llm.clone(), executor, StaticSource::failing(), AnswerFallback::Raw);

        let failure = orchestrator.run("q", None).await.unwrap_err();
        assert_eq!(failure.stage, Stage::Schema);
        assert_eq!(failure.error.code(), "SCHEMA_UNAVAILABLE");
        assert_eq!(llm.call_count(), 0);
    }

    #[tokio::test]
    async fn test_query_timeout_is_tagged() {
        let llm = Arc::new(ScriptedLlm::replying("SELECT id FROM orders"));
        let executor = Arc::new(StaticExecutor::new(Outcome::Timeout));

        let failure = orchestrator(llm.clone(), executor)
            .run("q", None)
            .await
            .unwrap_err();

        assert_eq!(failure.stage, Stage::QueryExecution);
        assert_eq!(failure.error.code(), "QUERY_TIMEOUT");
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_request_row_cap_only_lowers() {
        let llm = Arc::new(ScriptedLlm::new(vec![
            Ok("SELECT id FROM orders".to_string()),
            Ok("Ten orders.".to_string()),
            Ok("SELECT id FROM orders".to_string()),
            Ok("Many orders.".to_string()),
        ]));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(top_five_rows())));
        let orchestrator = orchestrator(llm.clone(), executor);

        let lowered = orchestrator.run("Orders", Some(10)).await.unwrap();
        assert!(lowered.generated_sql.ends_with("LIMIT 10"));
        assert!(llm.prompts()[0].contains("no greater than 10."));

        let raised = orchestrator.run("Orders", Some(5000)).await.unwrap();
        assert!(raised.generated_sql.ends_with("LIMIT 100"));
        assert_eq!(orchestrator.row_cap(Some(0)), 1);
    }

    #[tokio::test]
    async fn test_dropped_request_starts_no_further_stage() {
        let llm = Arc::new(ScriptedLlm::replying("SELECT id FROM orders").with_delay(Duration::from_secs(5)));
        let executor = Arc::new(StaticExecutor::new(Outcome::Rows(top_five_rows())));
        let orchestrator = orchestrator(llm.clone(), executor.clone());

        let outcome =
            tokio::time::timeout(Duration::from_millis(50), orchestrator.run("Orders", None)).await;
        assert!(outcome.is_err());

        // Give a detached continuation, if one existed, time to run
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(llm.call_count(), 1);
        assert_eq!(executor.call_count(), 0);
    }
}
