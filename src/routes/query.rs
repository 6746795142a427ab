//! Question answering route handler

use crate::error::{validation_error, ApiResult};
use crate::models::{QueryRequest, SuccessResponse};
use crate::pipeline::PipelineResponse;
use crate::state::SharedState;
use axum::{extract::State, Json};
use tracing::info;
use validator::Validate;

/// Answer a natural-language question about the store data
pub async fn answer_question(
    State(state): State<SharedState>,
    Json(payload): Json<QueryRequest>,
) -> ApiResult<Json<SuccessResponse<PipelineResponse>>> {
    payload.validate().map_err(|e| validation_error(e.to_string()))?;

    let question = payload.user_query.trim();
    if question.is_empty() {
        return Err(validation_error("Question must not be blank"));
    }

    let response = state.orchestrator.run(question, payload.max_rows).await?;

    info!(
        request_id = %response.request_id,
        rows = response.row_count,
        "Question answered successfully"
    );

    Ok(Json(SuccessResponse::with_data(
        "Query executed successfully",
        response,
    )))
}
