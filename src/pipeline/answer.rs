//! Answer Synthesizer

use crate::error::PipelineError;
use crate::llm::retry::is_retryable;
use crate::llm::{LlmClient, RetryPolicy};
use crate::pipeline::types::{Answer, QueryResult};
use crate::prompt::PromptBuilder;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

pub const EMPTY_RESULT_ANSWER: &str = "No matching records found for your query.";

pub struct AnswerSynthesizer {
    llm: Arc<dyn LlmClient>,
    prompts: PromptBuilder,
    retry: RetryPolicy,
    max_tokens: u32,
    timeout: Duration,
}

impl AnswerSynthesizer {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        prompts: PromptBuilder,
        retry: RetryPolicy,
        max_tokens: u32,
        timeout: Duration,
    ) -> Self {
        Self {
            llm,
            prompts,
            retry,
            max_tokens,
            timeout,
        }
    }

    /// Summarize `result` in prose. Empty results never reach the model.
    pub async fn synthesize(&self, question: &str, result: &QueryResult) -> Result<Answer, PipelineError> {
        if result.rows.is_empty() {
            debug!("Empty result, skipping answer model call");
            return Ok(Answer::empty_result(EMPTY_RESULT_ANSWER));
        }

        let prompt = self.prompts.build_answer_prompt(question, result);
        let text = self
            .retry
            .retry(
                |_| self.llm.complete(&prompt, self.max_tokens, self.timeout),
                is_retryable,
            )
            .await?;

        Ok(Answer::llm(text))
    }
}
