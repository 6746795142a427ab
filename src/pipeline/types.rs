//! Types that flow between pipeline stages

use crate::pipeline::validator::LimitAction;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

/// Where a candidate statement came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SqlSource {
    Llm,
}

/// Raw model output. Consumed by the validator, never executed.
#[derive(Debug, Clone)]
pub struct CandidateSql {
    pub raw_text: String,
    pub source: SqlSource,
}

impl CandidateSql {
    pub fn from_llm(raw_text: String) -> Self {
        Self {
            raw_text,
            source: SqlSource::Llm,
        }
    }
}

/// Tabular output of the executor
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResult {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub row_count: usize,
    pub truncated: bool,
    pub execution_time_ms: u64,
}

/// Who produced the answer text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AnswerSource {
    Llm,
    EmptyResult,
    RawFallback,
}

/// Output of the answer stage
#[derive(Debug, Clone, PartialEq)]
pub struct Answer {
    /// None only when the raw table is returned instead of prose
    pub text: Option<String>,
    pub source: AnswerSource,
}

impl Answer {
    pub fn llm(text: String) -> Self {
        Self {
            text: Some(text),
            source: AnswerSource::Llm,
        }
    }

    pub fn empty_result(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            source: AnswerSource::EmptyResult,
        }
    }

    pub fn raw_fallback() -> Self {
        Self {
            text: None,
            source: AnswerSource::RawFallback,
        }
    }
}

/// Orchestrator states, logged on every transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Received,
    SchemaLoaded,
    SqlGenerated,
    SqlValidated,
    QueryExecuted,
    AnswerSynthesized,
    Completed,
    Failed,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Received => "received",
            PipelineState::SchemaLoaded => "schema_loaded",
            PipelineState::SqlGenerated => "sql_generated",
            PipelineState::SqlValidated => "sql_validated",
            PipelineState::QueryExecuted => "query_executed",
            PipelineState::AnswerSynthesized => "answer_synthesized",
            PipelineState::Completed => "completed",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Successful end-to-end result
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PipelineResponse {
    pub answer_text: Option<String>,
    pub generated_sql: String,
    pub row_count: usize,
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
    pub truncated: bool,
    pub answer_source: AnswerSource,
    pub limit: LimitAction,
    pub execution_time_ms: u64,
    pub request_id: Uuid,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_response_serializes_camel_case() {
        let response = PipelineResponse {
            answer_text: None,
            generated_sql: "SELECT 1 LIMIT 10".to_string(),
            row_count: 1,
            columns: vec!["?column?".to_string()],
            rows: vec![vec![json!(1)]],
            truncated: false,
            answer_source: AnswerSource::RawFallback,
            limit: LimitAction::Clamped { requested: 500 },
            execution_time_ms: 12,
            request_id: Uuid::nil(),
        };

        let value = serde_json::to_value(&response).unwrap();
        assert_eq!(value["answerText"], Value::Null);
        assert_eq!(value["generatedSql"], "SELECT 1 LIMIT 10");
        assert_eq!(value["answerSource"], "raw_fallback");
        assert_eq!(value["limit"], json!({"action": "clamped", "requested": 500}));
        assert_eq!(value["rowCount"], 1);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(PipelineState::SqlValidated.to_string(), "sql_validated");
        assert_eq!(PipelineState::Failed.to_string(), "failed");
    }
}
