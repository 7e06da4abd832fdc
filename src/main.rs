//! Sluice Gateway Server
//!
//! Runs the gateway with a demo executor wired to the in-memory pub/sub:
//! queries answer with service info, mutations publish their `payload`
//! variable to the `topic` variable's topic, and subscriptions stream
//! everything published to their topic. Swap the executor for a real GraphQL
//! engine when embedding the gateway as a library.
//!
//! # Configuration
//!
//! Environment variables:
//! - `SLUICE_HOST`: Host to bind to (default: 0.0.0.0)
//! - `SLUICE_PORT`: Port to listen on (default: 4000)
//! - `SLUICE_KEEPALIVE_SECS`: Keep-alive interval (default: 30)
//! - `SLUICE_INIT_TIMEOUT_SECS`: Handshake timeout (default: 3)
//! - `RUST_LOG`: Log filter (default: sluice=info)

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use clap::Parser;
use serde_json::json;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use sluice::api::{serve, AppState};
use sluice::config::{generate_default_config, GatewayConfig, LoggingConfig};
use sluice::executor::{
    Executor, ExecutorError, ExecutorReply, GraphQLRequest, GraphQLResponse, OperationContext,
};
use sluice::pubsub::{MemoryPubSub, PubSub};

#[derive(Parser)]
#[command(name = "sluice", about = "GraphQL execution gateway", version)]
struct Cli {
    /// Path to a TOML config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the bind host
    #[arg(long)]
    host: Option<String>,

    /// Override the bind port
    #[arg(long)]
    port: Option<u16>,

    /// Print the default configuration and exit
    #[arg(long)]
    print_default_config: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.print_default_config {
        print!("{}", generate_default_config());
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => GatewayConfig::load_with_env(path)?,
        None => GatewayConfig::load_default(),
    };
    if let Some(host) = cli.host {
        config.server.host = host;
    }
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    init_tracing(&config.logging);

    tracing::info!("Sluice GraphQL gateway v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!(
        keepalive_secs = config.websocket.keepalive_interval_secs,
        init_timeout_secs = config.websocket.init_timeout_secs,
        max_connections = config.websocket.max_connections,
        "WebSocket transport configured"
    );

    let pubsub: Arc<dyn PubSub> = Arc::new(MemoryPubSub::new());
    let executor = Arc::new(DemoExecutor {
        pubsub: Arc::clone(&pubsub),
    });

    let state = AppState::with_pubsub(executor, pubsub, config.clone());
    serve(state, &config).await?;

    tracing::info!("Sluice stopped");
    Ok(())
}

/// Initialize logging
fn init_tracing(config: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("sluice={},tower_http=info", config.level))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if config.format == "json" {
        registry
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

/// Demo executor backed by the in-memory pub/sub.
///
/// Not a GraphQL engine: it inspects only the leading keyword of the
/// operation text, enough to demonstrate all three transport paths.
struct DemoExecutor {
    pubsub: Arc<dyn PubSub>,
}

impl DemoExecutor {
    fn topic(request: &GraphQLRequest) -> String {
        request
            .variable("topic")
            .and_then(|v| v.as_str())
            .unwrap_or("events")
            .to_string()
    }
}

#[async_trait]
impl Executor for DemoExecutor {
    async fn execute(
        &self,
        request: GraphQLRequest,
        ctx: OperationContext,
    ) -> Result<ExecutorReply, ExecutorError> {
        let operation = request.query.trim_start();

        if operation.starts_with("subscription") {
            let topic = Self::topic(&request);
            tracing::debug!(
                topic = %topic,
                connection_id = ?ctx.connection_id,
                "Demo subscription started"
            );
            let stream = self
                .pubsub
                .subscribe(&topic)
                .await
                .map_err(|e| ExecutorError::Internal(e.to_string()))?
                .map(|payload| GraphQLResponse::data(json!({ "event": payload })));
            Ok(ExecutorReply::Stream(stream))
        } else if operation.starts_with("mutation") {
            let topic = Self::topic(&request);
            let payload = request
                .variable("payload")
                .cloned()
                .ok_or_else(|| ExecutorError::Validation("missing payload variable".to_string()))?;
            self.pubsub
                .publish(&topic, payload)
                .await
                .map_err(|e| ExecutorError::Internal(e.to_string()))?;
            Ok(ExecutorReply::Single(GraphQLResponse::data(
                json!({ "publish": { "topic": topic } }),
            )))
        } else {
            Ok(ExecutorReply::Single(GraphQLResponse::data(json!({
                "service": "sluice",
                "version": env!("CARGO_PKG_VERSION"),
            }))))
        }
    }
}
