//! GraphQL Executor Boundary
//!
//! The gateway treats GraphQL parsing, validation, and resolution as a black
//! box behind the [`Executor`] trait: operation text plus variables plus
//! context in, a result or an error list out. A query or mutation yields a
//! single response; a subscription yields an [`EventStream`] of responses
//! that the gateway forwards frame by frame.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

use crate::stream::EventStream;
use crate::websocket::ConnectionId;

/// One client-issued GraphQL operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLRequest {
    /// Operation text
    pub query: String,

    /// Name of the operation to run when the document contains several
    #[serde(
        rename = "operationName",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub operation_name: Option<String>,

    /// Operation variables
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub variables: Option<Map<String, Value>>,
}

impl GraphQLRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            operation_name: None,
            variables: None,
        }
    }

    /// Look up a variable by name
    pub fn variable(&self, name: &str) -> Option<&Value> {
        self.variables.as_ref().and_then(|vars| vars.get(name))
    }
}

/// A GraphQL execution result: data plus an error list
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GraphQLResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<GraphQLError>,
}

impl GraphQLResponse {
    /// A successful result carrying `data`
    pub fn data(data: Value) -> Self {
        Self {
            data: Some(data),
            errors: Vec::new(),
        }
    }

    /// A failed result carrying only errors
    pub fn errors(errors: Vec<GraphQLError>) -> Self {
        Self { data: None, errors }
    }

    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A single error object in a GraphQL result
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphQLError {
    pub message: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub locations: Option<Vec<ErrorLocation>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<Vec<Value>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub extensions: Option<Value>,
}

impl GraphQLError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            locations: None,
            path: None,
            extensions: None,
        }
    }
}

/// Source position of an error in the operation text
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorLocation {
    pub line: u32,
    pub column: u32,
}

/// Per-operation execution context handed to the executor
///
/// For WebSocket operations this carries the connection identity and the
/// payload the client sent with its init handshake; for plain HTTP requests
/// both are absent.
#[derive(Debug, Clone, Default)]
pub struct OperationContext {
    /// Connection the operation arrived on, if any
    pub connection_id: Option<ConnectionId>,

    /// Payload from the connection-init handshake, if any
    pub connection_params: Option<Value>,
}

impl OperationContext {
    /// Context for the session-less HTTP path
    pub fn http() -> Self {
        Self::default()
    }

    /// Context for an operation on an established WebSocket connection
    pub fn websocket(connection_id: ConnectionId, connection_params: Option<Value>) -> Self {
        Self {
            connection_id: Some(connection_id),
            connection_params,
        }
    }
}

/// What an execution produced
pub enum ExecutorReply {
    /// Query or mutation: exactly one result
    Single(GraphQLResponse),
    /// Subscription: a stream of results
    Stream(EventStream<GraphQLResponse>),
}

impl std::fmt::Debug for ExecutorReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutorReply::Single(response) => f.debug_tuple("Single").field(response).finish(),
            ExecutorReply::Stream(_) => f.debug_tuple("Stream").finish(),
        }
    }
}

/// Errors the executor boundary can surface
///
/// Resolver errors do NOT travel this path: they belong inside a
/// [`GraphQLResponse`]'s error list, per the errors-as-data convention.
#[derive(Debug, Error)]
pub enum ExecutorError {
    /// The operation failed first-phase parsing or validation
    #[error("invalid operation: {0}")]
    Validation(String),

    /// The execution engine itself failed
    #[error("execution failed: {0}")]
    Internal(String),
}

impl ExecutorError {
    /// Render as a GraphQL error list for a result payload
    pub fn to_errors(&self) -> Vec<GraphQLError> {
        vec![GraphQLError::new(self.to_string())]
    }
}

/// GraphQL execution engine boundary
///
/// Implementations own schema knowledge and resolver dispatch. The gateway
/// only distinguishes single-result replies from stream replies.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        request: GraphQLRequest,
        ctx: OperationContext,
    ) -> Result<ExecutorReply, ExecutorError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_deserialize_with_variables() {
        let json = r#"{"query": "query Q($id: ID!) { node(id: $id) { id } }", "operationName": "Q", "variables": {"id": "42"}}"#;
        let req: GraphQLRequest = serde_json::from_str(json).unwrap();
        assert_eq!(req.operation_name.as_deref(), Some("Q"));
        assert_eq!(req.variable("id"), Some(&json!("42")));
    }

    #[test]
    fn test_request_deserialize_minimal() {
        let req: GraphQLRequest = serde_json::from_str(r#"{"query": "{ ping }"}"#).unwrap();
        assert!(req.operation_name.is_none());
        assert!(req.variables.is_none());
    }

    #[test]
    fn test_response_serialize_omits_empty_errors() {
        let response = GraphQLResponse::data(json!({"ping": "pong"}));
        let json = serde_json::to_string(&response).unwrap();
        assert!(json.contains("\"data\""));
        assert!(!json.contains("errors"));
    }

    #[test]
    fn test_response_serialize_errors_only() {
        let response = GraphQLResponse::errors(vec![GraphQLError::new("boom")]);
        let json = serde_json::to_string(&response).unwrap();
        assert!(!json.contains("\"data\""));
        assert!(json.contains("\"message\":\"boom\""));
    }

    #[test]
    fn test_executor_error_to_errors() {
        let errors = ExecutorError::Validation("unknown field".to_string()).to_errors();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].message.contains("unknown field"));
    }
}
