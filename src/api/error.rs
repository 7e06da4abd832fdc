//! API Error Types
//!
//! Defines error types for the HTTP layer and implements conversion to
//! responses. Bodies are GraphQL-shaped (`{"errors": [...]}`), so clients
//! parse transport violations and execution failures with the same code path.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use thiserror::Error;

use crate::executor::{GraphQLError, GraphQLResponse};

/// HTTP layer error types
#[derive(Error, Debug)]
pub enum ApiError {
    /// The GraphQL-over-HTTP request is malformed
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// Operation kind is not acceptable on this transport
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = match &self {
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::UnsupportedOperation(_) => (StatusCode::BAD_REQUEST, "UNSUPPORTED_OPERATION"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        };

        tracing::error!(
            error_code = %code,
            error_message = %self,
            "API error occurred"
        );

        let mut error = GraphQLError::new(self.to_string());
        error.extensions = Some(serde_json::json!({ "code": code }));
        let body = GraphQLResponse::errors(vec![error]);

        (status, Json(body)).into_response()
    }
}

/// Result type for API operations
pub type ApiResult<T> = Result<T, ApiError>;
