//! Question request DTO

use serde::Deserialize;
use validator::Validate;

/// Request to answer a natural-language question
#[derive(Debug, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    #[validate(length(min = 1, max = 2000, message = "Question must be between 1 and 2000 characters"))]
    pub user_query: String,

    /// Lowers the server row cap for this request; never raises it
    #[validate(range(min = 1, message = "maxRows must be at least 1"))]
    #[serde(default)]
    pub max_rows: Option<u64>,
}
