//! Application State
//!
//! Shared state accessible by all HTTP handlers, wrapped in Arc for sharing
//! across async tasks.

use std::sync::Arc;
use std::time::Instant;

use crate::config::GatewayConfig;
use crate::executor::Executor;
use crate::pubsub::PubSub;
use crate::websocket::{Dispatcher, DispatcherConfig};

/// Shared application state for all handlers
#[derive(Clone)]
pub struct AppState {
    /// GraphQL execution engine, shared by the HTTP and WebSocket paths
    pub executor: Arc<dyn Executor>,
    /// WebSocket connection dispatcher
    pub dispatcher: Arc<Dispatcher>,
    /// Event fan-out used by subscription resolvers
    pub pubsub: Arc<dyn PubSub>,
    /// Gateway configuration
    pub config: Arc<GatewayConfig>,
    /// Server start time for uptime tracking
    pub start_time: Instant,
}

impl AppState {
    /// Create state with the default in-memory pub/sub
    pub fn new(executor: Arc<dyn Executor>, config: GatewayConfig) -> Self {
        Self::with_pubsub(
            executor,
            Arc::new(crate::pubsub::MemoryPubSub::new()),
            config,
        )
    }

    /// Create state with an explicit pub/sub implementation
    pub fn with_pubsub(
        executor: Arc<dyn Executor>,
        pubsub: Arc<dyn PubSub>,
        config: GatewayConfig,
    ) -> Self {
        let dispatcher_config = DispatcherConfig {
            max_connections: config.websocket.max_connections,
            keepalive_interval: config.websocket.keepalive_interval(),
            init_timeout: config.websocket.init_timeout(),
        };
        let dispatcher = Arc::new(Dispatcher::new(Arc::clone(&executor), dispatcher_config));

        Self {
            executor,
            dispatcher,
            pubsub,
            config: Arc::new(config),
            start_time: Instant::now(),
        }
    }

    /// Replace the dispatcher, e.g. to install a connection guard
    pub fn with_dispatcher(mut self, dispatcher: Arc<Dispatcher>) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Get server uptime in seconds
    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}
