//! GraphQL HTTP Routes
//!
//! Session-less query/mutation execution.
//!
//! - `POST /graphql` - JSON body `{query, variables, operationName}`
//! - `GET /graphql` - operation in query-string parameters
//!
//! Status policy: a malformed GraphQL-over-HTTP request is a 400; a
//! well-formed request whose execution produced errors is a 200 carrying the
//! errors array in the result body.

use axum::{
    extract::{rejection::JsonRejection, Query, State},
    Json,
};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::Arc;

use crate::api::error::{ApiError, ApiResult};
use crate::api::state::AppState;
use crate::executor::{
    ExecutorError, ExecutorReply, GraphQLRequest, GraphQLResponse, OperationContext,
};

/// POST /graphql
pub async fn post_graphql(
    State(state): State<Arc<AppState>>,
    request: Result<Json<GraphQLRequest>, JsonRejection>,
) -> ApiResult<Json<GraphQLResponse>> {
    let Json(request) = request.map_err(|e| ApiError::BadRequest(e.to_string()))?;
    execute(&state, request).await
}

/// Query-string form of a GraphQL request
#[derive(Debug, Deserialize)]
pub struct GraphQLQueryParams {
    query: Option<String>,
    #[serde(rename = "operationName")]
    operation_name: Option<String>,
    /// JSON-encoded variables object
    variables: Option<String>,
}

/// GET /graphql
pub async fn get_graphql(
    State(state): State<Arc<AppState>>,
    Query(params): Query<GraphQLQueryParams>,
) -> ApiResult<Json<GraphQLResponse>> {
    let query = params
        .query
        .ok_or_else(|| ApiError::BadRequest("missing query parameter".to_string()))?;

    let variables = match params.variables {
        Some(raw) => Some(
            serde_json::from_str::<HashMap<String, serde_json::Value>>(&raw)
                .map_err(|e| ApiError::BadRequest(format!("invalid variables: {e}")))?
                .into_iter()
                .collect(),
        ),
        None => None,
    };

    let request = GraphQLRequest {
        query,
        operation_name: params.operation_name,
        variables,
    };
    execute(&state, request).await
}

async fn execute(state: &AppState, request: GraphQLRequest) -> ApiResult<Json<GraphQLResponse>> {
    if request.query.trim().is_empty() {
        return Err(ApiError::BadRequest("empty query".to_string()));
    }

    match state
        .executor
        .execute(request, OperationContext::http())
        .await
    {
        Ok(ExecutorReply::Single(response)) => Ok(Json(response)),
        Ok(ExecutorReply::Stream(_)) => Err(ApiError::UnsupportedOperation(
            "subscriptions are only supported over WebSocket".to_string(),
        )),
        // Validation failures surface as errors-in-result with a 200,
        // per the GraphQL-over-HTTP convention
        Err(e @ ExecutorError::Validation(_)) => {
            Ok(Json(GraphQLResponse::errors(e.to_errors())))
        }
        Err(e @ ExecutorError::Internal(_)) => Err(ApiError::Internal(e.to_string())),
    }
}
