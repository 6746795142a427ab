//! Error handling module
//!
//! Provides unified error types and handling for the entire application.

use crate::pipeline::validator::RejectReason;
use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::{error, warn};

/// Pipeline stage a failure is attributed to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Schema,
    SqlGeneration,
    SqlValidation,
    QueryExecution,
    AnswerSynthesis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Schema => "schema",
            Stage::SqlGeneration => "sql_generation",
            Stage::SqlValidation => "sql_validation",
            Stage::QueryExecution => "query_execution",
            Stage::AnswerSynthesis => "answer_synthesis",
        };
        f.write_str(name)
    }
}

/// Failure kinds raised by the pipeline components.
///
/// The carried strings are diagnostic detail for logs only; they never reach
/// the HTTP response.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Schema unavailable: {0}")]
    SchemaUnavailable(String),

    #[error("LLM call timed out after {0:?}")]
    LlmTimeout(Duration),

    #[error("LLM request failed (status {status:?}): {message}")]
    LlmRequestError { status: Option<u16>, message: String },

    #[error("LLM returned no usable text")]
    LlmEmptyResponse,

    #[error("Unsafe SQL rejected: {0}")]
    UnsafeSqlRejected(RejectReason),

    #[error("Query timed out after {0:?}")]
    QueryTimeout(Duration),

    #[error("Query execution failed: {0}")]
    QueryExecutionError(String),
}

impl PipelineError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::SchemaUnavailable(_) => "SCHEMA_UNAVAILABLE",
            PipelineError::LlmTimeout(_) => "LLM_TIMEOUT",
            PipelineError::LlmRequestError { .. } => "LLM_REQUEST_ERROR",
            PipelineError::LlmEmptyResponse => "LLM_EMPTY_RESPONSE",
            PipelineError::UnsafeSqlRejected(_) => "UNSAFE_SQL_REJECTED",
            PipelineError::QueryTimeout(_) => "QUERY_TIMEOUT",
            PipelineError::QueryExecutionError(_) => "QUERY_EXECUTION_ERROR",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            PipelineError::SchemaUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            PipelineError::LlmTimeout(_) | PipelineError::QueryTimeout(_) => {
                StatusCode::GATEWAY_TIMEOUT
            }
            PipelineError::LlmRequestError { .. } | PipelineError::LlmEmptyResponse => {
                StatusCode::BAD_GATEWAY
            }
            PipelineError::UnsafeSqlRejected(_) => StatusCode::UNPROCESSABLE_ENTITY,
            PipelineError::QueryExecutionError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to the end user
    pub fn public_message(&self) -> &'static str {
        match self {
            PipelineError::SchemaUnavailable(_) => {
                "The database schema could not be loaded. Please try again shortly."
            }
            PipelineError::LlmTimeout(_) => "The language model did not respond in time.",
            PipelineError::LlmRequestError { .. } => "The language model request failed.",
            PipelineError::LlmEmptyResponse => "The language model returned an empty response.",
            PipelineError::UnsafeSqlRejected(_) => {
                "The generated query was rejected by the safety validator."
            }
            PipelineError::QueryTimeout(_) => "The query took too long to run.",
            PipelineError::QueryExecutionError(_) => "The query could not be executed.",
        }
    }

    /// Kinds the answer-stage fallback policy may absorb
    pub fn is_llm_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::LlmTimeout(_)
                | PipelineError::LlmRequestError { .. }
                | PipelineError::LlmEmptyResponse
        )
    }
}

/// A pipeline error tagged with the stage that raised it
#[derive(Error, Debug)]
#[error("{stage} stage failed: {error}")]
pub struct PipelineFailure {
    pub stage: Stage,
    #[source]
    pub error: PipelineError,
}

impl PipelineFailure {
    pub fn new(stage: Stage, error: PipelineError) -> Self {
        Self { stage, error }
    }
}

/// Application-wide error type
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineFailure),
}

/// Error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<Stage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = match &self {
            AppError::Validation(msg) => ErrorResponse {
                success: false,
                message: "Invalid request".to_string(),
                error: Some(msg.clone()),
                code: Some("VALIDATION_ERROR".to_string()),
                stage: None,
                reason: None,
            },
            AppError::Pipeline(failure) => {
                match &failure.error {
                    PipelineError::UnsafeSqlRejected(_) | PipelineError::LlmEmptyResponse => {
                        warn!(stage = %failure.stage, "Pipeline failure: {}", failure.error)
                    }
                    _ => error!(stage = %failure.stage, "Pipeline failure: {}", failure.error),
                }
                let reason = match &failure.error {
                    PipelineError::UnsafeSqlRejected(reason) => Some(reason.code().to_string()),
                    _ => None,
                };
                ErrorResponse {
                    success: false,
                    message: failure.error.public_message().to_string(),
                    error: None,
                    code: Some(failure.error.code().to_string()),
                    stage: Some(failure.stage),
                    reason,
                }
            }
        };

        (self.status_code(), Json(body)).into_response()
    }
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Pipeline(failure) => failure.error.status_code(),
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, AppError>;

/// Helper function to create a validation error
pub fn validation_error(msg: impl Into<String>) -> AppError {
    AppError::Validation(msg.into())
}
