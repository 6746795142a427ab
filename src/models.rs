//! Data models and DTOs (Data Transfer Objects)
//!
//! Contains all request/response structures used by the API.

pub mod query;
pub mod schema;

pub use query::*;
pub use schema::*;

use serde::Serialize;

/// Generic success response
#[derive(Serialize)]
pub struct SuccessResponse<T: Serialize> {
    pub success: bool,
    pub message: String,
    #[serde(flatten)]
    pub data: Option<T>,
}

impl<T: Serialize> SuccessResponse<T> {
    pub fn with_data(message: impl Into<String>, data: T) -> Self {
        Self {
            success: true,
            message: message.into(),
            data: Some(data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[derive(Serialize)]
    struct Payload {
        count: u32,
    }

    #[test]
    fn test_data_is_flattened_into_envelope() {
        let response = SuccessResponse::with_data("ok", Payload { count: 3 });
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            json!({ "success": true, "message": "ok", "count": 3 })
        );
    }
}
