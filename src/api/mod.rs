//! Gateway HTTP API
//!
//! HTTP surface of the gateway, built with Axum.
//!
//! # Endpoints
//!
//! ## GraphQL
//! - `POST /graphql` - Execute a query or mutation
//! - `GET /graphql` - Execute a query from query-string parameters
//! - `GET /graphql/ws` - WebSocket upgrade for subscriptions
//!
//! ## Health
//! - `GET /health/live` - Liveness probe
//! - `GET /health/ready` - Readiness probe with gateway statistics
//!
//! # Example
//!
//! ```rust,ignore
//! use sluice::api::{serve, AppState};
//! use sluice::config::GatewayConfig;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let executor = Arc::new(MyExecutor::new());
//!     let config = GatewayConfig::default();
//!
//!     let state = AppState::new(executor, config.clone());
//!     serve(state, &config).await?;
//!
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod routes;
pub mod state;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

use axum::{
    routing::get,
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::GatewayConfig;
use crate::websocket::graphql_ws_handler;

/// Build the API router with all routes and middleware
pub fn build_router(state: AppState) -> Router {
    let health_routes = Router::new()
        .route("/live", get(routes::health::liveness))
        .route("/ready", get(routes::health::readiness));

    let shared_state = Arc::new(state);

    Router::new()
        .route(
            "/graphql",
            get(routes::graphql::get_graphql).post(routes::graphql::post_graphql),
        )
        .route("/graphql/ws", get(graphql_ws_handler))
        .nest("/health", health_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()) // Configure properly in production
        .with_state(shared_state)
}

/// Start the API server
pub async fn serve(state: AppState, config: &GatewayConfig) -> Result<(), ApiError> {
    let router = build_router(state);

    let addr = config.server.addr();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| ApiError::Internal(format!("Failed to bind {addr}: {e}")))?;

    tracing::info!("Gateway listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| ApiError::Internal(format!("Server error: {e}")))?;

    tracing::info!("Gateway shut down gracefully");
    Ok(())
}

/// Wait for shutdown signal
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received, starting graceful shutdown");
}
