//! Schema catalog route handlers

use crate::error::{ApiResult, PipelineFailure, Stage};
use crate::models::{ReloadResponse, SchemaResponse, SchemaSummary, SuccessResponse};
use crate::state::SharedState;
use axum::{extract::State, Json};
use tracing::info;

/// Current schema snapshot, loading it if needed
pub async fn get_schema(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<SchemaResponse>>> {
    let snapshot = state
        .catalog
        .load()
        .await
        .map_err(|e| PipelineFailure::new(Stage::Schema, e))?;

    Ok(Json(SuccessResponse::with_data(
        format!("Schema '{}' has {} tables", snapshot.namespace, snapshot.tables.len()),
        SchemaResponse {
            schema: (*snapshot).clone(),
        },
    )))
}

/// Drop the cached snapshot; the next request re-introspects
pub async fn invalidate_schema(
    State(state): State<SharedState>,
) -> Json<SuccessResponse<serde_json::Value>> {
    let previous = state.catalog.current().map(|s| s.version);
    state.catalog.invalidate();
    info!(?previous, "Schema cache invalidated on request");

    Json(SuccessResponse::with_data(
        "Schema cache cleared",
        serde_json::json!({ "previousVersion": previous }),
    ))
}

/// Re-introspect now and report what changed
pub async fn reload_schema(
    State(state): State<SharedState>,
) -> ApiResult<Json<SuccessResponse<ReloadResponse>>> {
    let outcome = state
        .catalog
        .reload()
        .await
        .map_err(|e| PipelineFailure::new(Stage::Schema, e))?;

    let changes = outcome.drift.as_ref().map_or(0, |d| d.changes.len());
    info!(
        version = outcome.snapshot.version,
        changes,
        "Schema reloaded on request"
    );

    Ok(Json(SuccessResponse::with_data(
        "Schema reloaded",
        ReloadResponse {
            schema: SchemaSummary::from(outcome.snapshot.as_ref()),
            drift: outcome.drift,
        },
    )))
}
