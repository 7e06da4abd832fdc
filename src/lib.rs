//! # Sluice
//!
//! GraphQL execution gateway with three transport modes: HTTP
//! query/mutation, WebSocket subscriptions (both GraphQL-over-WebSocket
//! sub-protocols), and an in-memory publish/subscribe layer for fanning
//! subscription events out to many consumers.
//!
//! ## Features
//!
//! - **Subscription lifecycle**: per-connection state machine from upgrade
//!   through handshake, multiplexed operations, keep-alive, and teardown
//! - **Broadcast fan-out**: one upstream event source shared by N
//!   independently-cancelable subscribers, with no leak on disconnect
//! - **Two sub-protocols**: `graphql-transport-ws` and legacy `graphql-ws`
//!   drive the same state machine through interchangeable codecs
//! - **Pluggable execution**: GraphQL parsing and resolution live behind the
//!   [`executor::Executor`] trait
//!
//! ## Modules
//!
//! - [`stream`]: the resolver-facing [`stream::EventStream`] abstraction
//! - [`pubsub`]: broadcast fan-out and the topic-addressed [`pubsub::PubSub`]
//! - [`websocket`]: connection sessions, wire protocols, and the dispatcher
//! - [`executor`]: the execution engine boundary
//! - [`api`]: HTTP server with Axum
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sluice::api::{serve, AppState};
//! use sluice::config::GatewayConfig;
//! use std::sync::Arc;
//!
//! # struct MyExecutor;
//! # #[async_trait::async_trait]
//! # impl sluice::executor::Executor for MyExecutor {
//! #     async fn execute(
//! #         &self,
//! #         _request: sluice::executor::GraphQLRequest,
//! #         _ctx: sluice::executor::OperationContext,
//! #     ) -> Result<sluice::executor::ExecutorReply, sluice::executor::ExecutorError> {
//! #         unimplemented!()
//! #     }
//! # }
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = GatewayConfig::default();
//!     let state = AppState::new(Arc::new(MyExecutor), config.clone());
//!
//!     serve(state, &config).await?;
//!     Ok(())
//! }
//! ```

pub mod api;
pub mod config;
pub mod executor;
pub mod pubsub;
pub mod stream;
pub mod websocket;

// Re-export top-level types for convenience
pub use stream::{EndReason, EventStream, StreamHandle};

pub use pubsub::{Broadcast, Downstream, DownstreamHandle, MemoryPubSub, PubSub, PubSubError};

pub use executor::{
    Executor, ExecutorError, ExecutorReply, GraphQLError, GraphQLRequest, GraphQLResponse,
    OperationContext,
};

pub use websocket::{
    graphql_ws_handler, ConnectionGuard, ConnectionId, Dispatcher, DispatcherConfig, GatewayError,
    Protocol, ServerFrame, SessionState,
};

pub use api::{build_router, serve, ApiError, AppState};

pub use config::{ConfigError, GatewayConfig, LoggingConfig, ServerConfig, WebSocketConfig};
